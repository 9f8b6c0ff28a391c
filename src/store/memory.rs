//! In-memory implementation of [`NoteStore`].
//!
//! Backs the engine's test suite and local demos. Directories are explicit
//! entries (auto-registered for a blob's ancestors) so tests can control
//! directory modification times, and every mutating call is counted so
//! idempotence can be asserted.

use crate::error::SyncError;
use crate::store::{
    canonical_document_path, file_name, now_unix_millis, parent_path, DirEntry, NoteStore,
    Notebook,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// A stored blob plus its stamp.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub bytes: Vec<u8>,
    pub modified_at_ms: u64,
}

/// Record of a `create_document` call.
#[derive(Debug, Clone)]
pub struct CreatedDocument {
    pub id: String,
    pub notebook_id: String,
    pub path_hint: String,
    pub canonical_path: String,
}

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, StoredFile>,
    dirs: BTreeMap<String, u64>,
    symlinks: BTreeMap<String, u64>,
    notebooks: Vec<Notebook>,
    unused_assets: Vec<String>,
    created_documents: Vec<CreatedDocument>,
    renamed_documents: Vec<(String, String)>,
    reloaded_documents: Vec<String>,
    workspace_reloads: usize,
    tree_refreshes: usize,
    snapshots: Vec<String>,
    puts: usize,
    deletes: usize,
}

/// In-process [`NoteStore`].
#[derive(Default)]
pub struct MemoryNoteStore {
    inner: RwLock<Inner>,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a blob directly, registering ancestor directories.
    pub async fn insert_file(&self, path: &str, bytes: &[u8], modified_at_ms: u64) {
        let mut inner = self.inner.write().await;
        register_ancestors(&mut inner.dirs, path, modified_at_ms / 1000);
        inner.files.insert(
            path.to_string(),
            StoredFile {
                bytes: bytes.to_vec(),
                modified_at_ms,
            },
        );
    }

    /// Register a directory with an explicit modification time (seconds).
    pub async fn add_directory(&self, path: &str, modified_at: u64) {
        let mut inner = self.inner.write().await;
        register_ancestors(&mut inner.dirs, path, modified_at);
        inner.dirs.insert(path.to_string(), modified_at);
    }

    /// Register a symlink entry; listings report it but sync must skip it.
    pub async fn add_symlink(&self, path: &str, modified_at: u64) {
        let mut inner = self.inner.write().await;
        register_ancestors(&mut inner.dirs, path, modified_at);
        inner.symlinks.insert(path.to_string(), modified_at);
    }

    pub async fn set_notebooks(&self, notebooks: Vec<Notebook>) {
        self.inner.write().await.notebooks = notebooks;
    }

    pub async fn set_unused_assets(&self, paths: Vec<String>) {
        self.inner.write().await.unused_assets = paths;
    }

    pub async fn file(&self, path: &str) -> Option<StoredFile> {
        self.inner.read().await.files.get(path).cloned()
    }

    pub async fn file_paths(&self) -> Vec<String> {
        self.inner.read().await.files.keys().cloned().collect()
    }

    pub async fn has_directory(&self, path: &str) -> bool {
        self.inner.read().await.dirs.contains_key(path)
    }

    pub async fn put_count(&self) -> usize {
        self.inner.read().await.puts
    }

    pub async fn delete_count(&self) -> usize {
        self.inner.read().await.deletes
    }

    pub async fn created_documents(&self) -> Vec<CreatedDocument> {
        self.inner.read().await.created_documents.clone()
    }

    pub async fn renamed_documents(&self) -> Vec<(String, String)> {
        self.inner.read().await.renamed_documents.clone()
    }

    pub async fn reloaded_documents(&self) -> Vec<String> {
        self.inner.read().await.reloaded_documents.clone()
    }

    pub async fn workspace_reload_count(&self) -> usize {
        self.inner.read().await.workspace_reloads
    }

    pub async fn tree_refresh_count(&self) -> usize {
        self.inner.read().await.tree_refreshes
    }

    pub async fn snapshot_count(&self) -> usize {
        self.inner.read().await.snapshots.len()
    }
}

fn register_ancestors(dirs: &mut BTreeMap<String, u64>, path: &str, modified_at: u64) {
    let mut parent = parent_path(path);
    while !parent.is_empty() {
        dirs.entry(parent.clone()).or_insert(modified_at);
        parent = parent_path(&parent);
    }
}

#[async_trait]
impl NoteStore for MemoryNoteStore {
    async fn list_directory(&self, path: &str) -> Result<Option<Vec<DirEntry>>, SyncError> {
        let inner = self.inner.read().await;
        if !path.is_empty() && !inner.dirs.contains_key(path) {
            return Ok(None);
        }

        let mut entries = Vec::new();
        for (p, file) in &inner.files {
            if parent_path(p) == path {
                entries.push(DirEntry {
                    name: file_name(p),
                    is_directory: false,
                    is_symlink: false,
                    modified_at: file.modified_at_ms / 1000,
                });
            }
        }
        for (p, modified_at) in &inner.dirs {
            if parent_path(p) == path && !p.is_empty() {
                entries.push(DirEntry {
                    name: file_name(p),
                    is_directory: true,
                    is_symlink: false,
                    modified_at: *modified_at,
                });
            }
        }
        for (p, modified_at) in &inner.symlinks {
            if parent_path(p) == path {
                entries.push(DirEntry {
                    name: file_name(p),
                    is_directory: false,
                    is_symlink: true,
                    modified_at: *modified_at,
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(entries))
    }

    async fn get_blob(&self, path: &str) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self
            .inner
            .read()
            .await
            .files
            .get(path)
            .map(|f| f.bytes.clone()))
    }

    async fn put_blob(
        &self,
        path: &str,
        bytes: Vec<u8>,
        modified_at_ms: u64,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.write().await;
        register_ancestors(&mut inner.dirs, path, modified_at_ms / 1000);
        inner.files.insert(
            path.to_string(),
            StoredFile {
                bytes,
                modified_at_ms,
            },
        );
        inner.puts += 1;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), SyncError> {
        let mut inner = self.inner.write().await;
        let prefix = format!("{}/", path);
        let existed = inner.files.remove(path).is_some()
            | inner.dirs.remove(path).is_some()
            | inner.symlinks.remove(path).is_some();
        inner.files.retain(|p, _| !p.starts_with(&prefix));
        inner.dirs.retain(|p, _| !p.starts_with(&prefix));
        inner.symlinks.retain(|p, _| !p.starts_with(&prefix));
        if existed {
            inner.deletes += 1;
        }
        Ok(())
    }

    async fn create_document(
        &self,
        notebook_id: &str,
        path: &str,
        initial_content: &str,
    ) -> Result<String, SyncError> {
        let mut inner = self.inner.write().await;
        let id = uuid::Uuid::new_v4().to_string();
        let canonical = canonical_document_path(path, &id);
        let now = now_unix_millis();
        register_ancestors(&mut inner.dirs, &canonical, now / 1000);
        inner.files.insert(
            canonical.clone(),
            StoredFile {
                bytes: initial_content.as_bytes().to_vec(),
                modified_at_ms: now,
            },
        );
        inner.created_documents.push(CreatedDocument {
            id: id.clone(),
            notebook_id: notebook_id.to_string(),
            path_hint: path.to_string(),
            canonical_path: canonical,
        });
        Ok(id)
    }

    async fn rename_document(&self, document_id: &str, new_title: &str) -> Result<(), SyncError> {
        self.inner
            .write()
            .await
            .renamed_documents
            .push((document_id.to_string(), new_title.to_string()));
        Ok(())
    }

    async fn list_notebooks(&self) -> Result<Vec<Notebook>, SyncError> {
        Ok(self.inner.read().await.notebooks.clone())
    }

    async fn list_unused_assets(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.inner.read().await.unused_assets.clone())
    }

    async fn refresh_file_tree(&self) -> Result<(), SyncError> {
        self.inner.write().await.tree_refreshes += 1;
        Ok(())
    }

    async fn reload_open_document(&self, path: &str) -> Result<(), SyncError> {
        self.inner
            .write()
            .await
            .reloaded_documents
            .push(path.to_string());
        Ok(())
    }

    async fn reload_workspace(&self) -> Result<(), SyncError> {
        self.inner.write().await.workspace_reloads += 1;
        Ok(())
    }

    async fn create_snapshot(&self, reason: &str) -> Result<(), SyncError> {
        self.inner.write().await.snapshots.push(reason.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_reports_files_dirs_and_symlinks() {
        let store = MemoryNoteStore::new();
        store.insert_file("data/nb1/a.md", b"hello", 100_000).await;
        store.add_directory("data/nb1/sub", 200).await;
        store.add_symlink("data/nb1/link", 300).await;

        let entries = store.list_directory("data/nb1").await.unwrap().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.md", "link", "sub"]);
        assert!(entries.iter().any(|e| e.name == "sub" && e.is_directory));
        assert!(entries.iter().any(|e| e.name == "link" && e.is_symlink));
    }

    #[tokio::test]
    async fn test_missing_directory_is_none() {
        let store = MemoryNoteStore::new();
        assert!(store.list_directory("nope").await.unwrap().is_none());
        // The empty root always exists.
        assert!(store.list_directory("").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let store = MemoryNoteStore::new();
        store.insert_file("data/nb1/a.md", b"a", 1_000).await;
        store.insert_file("data/nb1/sub/b.md", b"b", 2_000).await;

        store.delete_file("data/nb1").await.unwrap();
        assert!(store.file("data/nb1/a.md").await.is_none());
        assert!(store.file("data/nb1/sub/b.md").await.is_none());
        assert!(!store.has_directory("data/nb1").await);
        assert_eq!(store.delete_count().await, 1);
    }

    #[tokio::test]
    async fn test_create_document_uses_canonical_path() {
        let store = MemoryNoteStore::new();
        let id = store
            .create_document("nb1", "data/nb1/draft.md", "")
            .await
            .unwrap();
        let created = store.created_documents().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].canonical_path, format!("data/nb1/{}.md", id));
        assert!(store.file(&created[0].canonical_path).await.is_some());
    }
}
