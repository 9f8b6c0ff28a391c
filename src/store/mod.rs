//! Note-store access layer.
//!
//! The engine never talks to a concrete backend directly; everything goes
//! through the [`NoteStore`] trait. `http` implements it against the host's
//! note-storage HTTP API, `memory` implements it over in-process maps for
//! tests and demos.

pub mod http;
pub mod memory;

use crate::error::SyncError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::{AuthInterceptor, HttpNoteStore, Interceptor, TraceInterceptor};
pub use memory::MemoryNoteStore;

/// One entry of a single-level directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
    #[serde(default)]
    pub is_symlink: bool,
    /// Modification time in seconds since the Unix epoch.
    pub modified_at: u64,
}

/// A notebook as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: String,
    pub name: String,
}

/// Interface to one replica's note storage.
///
/// Absence is a sentinel (`None`), not an error: a missing blob or directory
/// is routine during reconciliation. Write operations are paired internally
/// with the host's search-index bookkeeping so the index never drifts from
/// the blobs.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// List one directory level, non-recursively. `None` if the directory
    /// does not exist.
    async fn list_directory(&self, path: &str) -> Result<Option<Vec<DirEntry>>, SyncError>;

    /// Fetch a blob's bytes. `None` if absent.
    async fn get_blob(&self, path: &str) -> Result<Option<Vec<u8>>, SyncError>;

    /// Write a blob, stamping its modification time (milliseconds), and
    /// update the search index for the path.
    async fn put_blob(&self, path: &str, bytes: Vec<u8>, modified_at_ms: u64)
        -> Result<(), SyncError>;

    /// Delete a file or directory subtree and remove it from the search
    /// index. Deleting an absent path is not an error.
    async fn delete_file(&self, path: &str) -> Result<(), SyncError>;

    /// Create a new empty document inside a notebook. The host derives the
    /// canonical id-named location from `path` and returns the fresh id.
    async fn create_document(
        &self,
        notebook_id: &str,
        path: &str,
        initial_content: &str,
    ) -> Result<String, SyncError>;

    /// Retitle an existing document.
    async fn rename_document(&self, document_id: &str, new_title: &str) -> Result<(), SyncError>;

    async fn list_notebooks(&self) -> Result<Vec<Notebook>, SyncError>;

    /// Asset paths the host currently considers unreferenced.
    async fn list_unused_assets(&self) -> Result<Vec<String>, SyncError>;

    /// Ask the host UI to re-render its file tree.
    async fn refresh_file_tree(&self) -> Result<(), SyncError>;

    /// Ask the host UI to reload one open document from disk.
    async fn reload_open_document(&self, path: &str) -> Result<(), SyncError>;

    /// Ask the host UI for a full reload. Used instead of per-document
    /// reloads when structured-data paths changed, since a partial reload
    /// can miss cross-document index state.
    async fn reload_workspace(&self) -> Result<(), SyncError>;

    /// Record a content-history checkpoint before the pass mutates data.
    async fn create_snapshot(&self, reason: &str) -> Result<(), SyncError>;
}

/// Canonical location of an id-named document next to `path_hint`.
///
/// `data/nb1/draft.md` with id `doc-7` becomes `data/nb1/doc-7.md`.
pub fn canonical_document_path(path_hint: &str, document_id: &str) -> String {
    let parent = parent_path(path_hint);
    let ext = file_ext(path_hint);
    if ext.is_empty() {
        join_path(&parent, document_id)
    } else {
        join_path(&parent, &format!("{}.{}", document_id, ext))
    }
}

/// Parent of a slash-separated path; empty for a top-level name.
pub fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// Final component of a slash-separated path.
pub fn file_name(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[idx + 1..].to_string(),
        None => path.to_string(),
    }
}

/// File name without its last extension.
pub fn file_stem(path: &str) -> String {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => name[..idx].to_string(),
    }
}

/// Extension without the dot; empty if there is none.
pub fn file_ext(path: &str) -> String {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => String::new(),
        Some(idx) => name[idx + 1..].to_string(),
    }
}

/// Join a parent path and a child name, handling the empty root.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_path("data/nb1/doc.md"), "data/nb1");
        assert_eq!(parent_path("data"), "");
        assert_eq!(file_name("data/nb1/doc.md"), "doc.md");
        assert_eq!(file_name("doc.md"), "doc.md");
        assert_eq!(file_stem("data/nb1/doc.md"), "doc");
        assert_eq!(file_ext("data/nb1/doc.md"), "md");
        assert_eq!(file_ext("data/nb1/Makefile"), "");
        assert_eq!(file_stem("data/.hidden"), ".hidden");
        assert_eq!(join_path("", "data"), "data");
        assert_eq!(join_path("data", "nb1"), "data/nb1");
    }

    #[test]
    fn test_canonical_document_path() {
        assert_eq!(
            canonical_document_path("data/nb1/draft.md", "doc-7"),
            "data/nb1/doc-7.md"
        );
        assert_eq!(canonical_document_path("notes", "doc-7"), "doc-7");
        assert_eq!(
            canonical_document_path("data/nb1/raw", "doc-9"),
            "data/nb1/doc-9"
        );
    }
}
