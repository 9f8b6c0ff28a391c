//! Conflict detection and materialization.
//!
//! A conflict exists only when both replicas edited the same document after
//! their last mutual sync, to different content. The engine never merges:
//! the newer edit wins the original path (via the regular file step) and
//! the older edit is preserved as a new, clearly-titled sibling document.

use crate::error::SyncError;
use crate::replica::Replica;
use crate::session::SessionLog;
use crate::store::{canonical_document_path, file_ext, file_stem, join_path, parent_path};
use crate::sync::tree::NodeMeta;
use tracing::{debug, info, warn};

/// Locale-independent timestamp format used in conflict titles.
const CONFLICT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A detected divergence, carrying everything materialization needs.
#[derive(Debug, Clone)]
pub struct DetectedConflict {
    pub winner: NodeMeta,
    pub loser: NodeMeta,
    pub loser_bytes: Vec<u8>,
    /// True when the losing copy lives on the local replica.
    pub loser_on_local: bool,
}

impl DetectedConflict {
    /// `"<winner stem> - Conflict YYYY-MM-DD HH:mm:ss"`, stamped with the
    /// loser's modification time.
    pub fn title(&self) -> String {
        let stamp = chrono::DateTime::<chrono::Utc>::from_timestamp(
            self.loser.modified_at as i64,
            0,
        )
        .map(|t| t.format(CONFLICT_TIME_FORMAT).to_string())
        .unwrap_or_else(|| self.loser.modified_at.to_string());
        format!("{} - Conflict {}", file_stem(&self.winner.path), stamp)
    }
}

pub struct ConflictHandler;

impl ConflictHandler {
    /// Decide whether a pair of files is a true editing conflict.
    ///
    /// Detection alone never mutates anything. Returns `None` unless both
    /// sides hold a file, both ledgers record a mutual sync, both copies
    /// are newer than it, the timestamps differ, and the contents differ
    /// as text.
    pub async fn detect(
        local_node: &NodeMeta,
        remote_node: &NodeMeta,
        local: &Replica,
        remote: &Replica,
    ) -> Result<Option<DetectedConflict>, SyncError> {
        if local_node.is_directory || remote_node.is_directory {
            return Ok(None);
        }

        let recorded_local = local.history.last_sync_with(&remote.instance_id);
        let recorded_remote = remote.history.last_sync_with(&local.instance_id);
        if recorded_local == 0 || recorded_remote == 0 {
            return Ok(None);
        }
        // Symmetric ledger writes make the two entries equal in practice;
        // the later one is the last time both sides provably agreed.
        let last_mutual = recorded_local.max(recorded_remote);

        if local_node.modified_at <= last_mutual || remote_node.modified_at <= last_mutual {
            return Ok(None);
        }
        if local_node.modified_at == remote_node.modified_at {
            return Ok(None);
        }

        let Some(local_bytes) = local.store.get_blob(&local_node.path).await? else {
            return Ok(None);
        };
        let Some(remote_bytes) = remote.store.get_blob(&remote_node.path).await? else {
            return Ok(None);
        };
        if String::from_utf8_lossy(&local_bytes) == String::from_utf8_lossy(&remote_bytes) {
            debug!(
                "{}: timestamps diverged but content is identical, not a conflict",
                local_node.path
            );
            return Ok(None);
        }

        let loser_on_local = local_node.modified_at < remote_node.modified_at;
        let (winner, loser, loser_bytes) = if loser_on_local {
            (remote_node.clone(), local_node.clone(), local_bytes)
        } else {
            (local_node.clone(), remote_node.clone(), remote_bytes)
        };

        info!(
            "conflict at {}: keeping edit from {}, preserving the {} copy",
            winner.path,
            if loser_on_local { &remote.name } else { &local.name },
            if loser_on_local { &local.name } else { &remote.name },
        );
        Ok(Some(DetectedConflict {
            winner,
            loser,
            loser_bytes,
            loser_on_local,
        }))
    }

    /// Preserve the losing edit as a new sibling document on both replicas.
    ///
    /// A fresh document is created through the host to obtain an id and
    /// canonical location next to the winner; the loser's raw bytes are
    /// uploaded under that id on both sides, and both copies are retitled.
    /// Per-replica failures are logged independently and never abort the
    /// surrounding pass.
    pub async fn materialize(
        conflict: &DetectedConflict,
        notebook_id: &str,
        local: &Replica,
        remote: &Replica,
        session: &SessionLog,
    ) {
        let title = conflict.title();
        let ext = file_ext(&conflict.winner.path);
        let hint_name = if ext.is_empty() {
            title.clone()
        } else {
            format!("{}.{}", title, ext)
        };
        let path_hint = join_path(&parent_path(&conflict.winner.path), &hint_name);

        let document_id = match local
            .store
            .create_document(notebook_id, &path_hint, "")
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("could not create conflict document for {}: {}", path_hint, e);
                session.record(format!("conflict copy failed for {}: {}", path_hint, e));
                return;
            }
        };
        let canonical = canonical_document_path(&path_hint, &document_id);
        session.record(format!(
            "conflict at {}: preserving older copy as \"{}\"",
            conflict.winner.path, title
        ));

        for replica in [local, remote] {
            let upload = replica
                .store
                .put_blob(
                    &canonical,
                    conflict.loser_bytes.clone(),
                    conflict.loser.modified_at * 1000,
                )
                .await;
            if let Err(e) = upload {
                warn!(
                    "conflict copy upload to {} failed for {}: {}",
                    replica.name, canonical, e
                );
                continue;
            }
            if let Err(e) = replica.store.rename_document(&document_id, &title).await {
                warn!(
                    "conflict copy rename on {} failed for {}: {}",
                    replica.name, document_id, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{Replica, ReplicaHandle};
    use crate::store::MemoryNoteStore;
    use std::sync::Arc;

    async fn replica_with(name: &str, peer_id: &str, synced_at: u64) -> (Replica, Arc<MemoryNoteStore>) {
        let store = Arc::new(MemoryNoteStore::new());
        let mut replica = Replica::connect(ReplicaHandle::new(name, store.clone()))
            .await
            .unwrap();
        if synced_at > 0 {
            replica.history.record(peer_id, synced_at);
        }
        (replica, store)
    }

    fn node(path: &str, modified_at: u64) -> NodeMeta {
        NodeMeta {
            path: path.to_string(),
            name: crate::store::file_name(path),
            modified_at,
            is_directory: false,
        }
    }

    #[tokio::test]
    async fn test_no_conflict_without_mutual_history() {
        let (local, ls) = replica_with("local", "x", 0).await;
        let (remote, rs) = replica_with("remote", "y", 0).await;
        ls.insert_file("data/nb/d.md", b"one", 2_000_000).await;
        rs.insert_file("data/nb/d.md", b"two", 3_000_000).await;

        let found = ConflictHandler::detect(
            &node("data/nb/d.md", 2_000),
            &node("data/nb/d.md", 3_000),
            &local,
            &remote,
        )
        .await
        .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_identical_text_is_not_a_conflict() {
        let (mut local, ls) = replica_with("local", "", 0).await;
        let (mut remote, rs) = replica_with("remote", "", 0).await;
        let (lid, rid) = (local.instance_id.clone(), remote.instance_id.clone());
        local.history.record(&rid, 1_000);
        remote.history.record(&lid, 1_000);
        ls.insert_file("data/nb/d.md", b"same", 2_000_000).await;
        rs.insert_file("data/nb/d.md", b"same", 3_000_000).await;

        let found = ConflictHandler::detect(
            &node("data/nb/d.md", 2_000),
            &node("data/nb/d.md", 3_000),
            &local,
            &remote,
        )
        .await
        .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_divergent_edits_pick_older_loser() {
        let (mut local, ls) = replica_with("local", "", 0).await;
        let (mut remote, rs) = replica_with("remote", "", 0).await;
        let (lid, rid) = (local.instance_id.clone(), remote.instance_id.clone());
        local.history.record(&rid, 1_000);
        remote.history.record(&lid, 1_000);
        ls.insert_file("data/nb/d.md", b"local edit", 2_000_000).await;
        rs.insert_file("data/nb/d.md", b"remote edit", 3_000_000).await;

        let found = ConflictHandler::detect(
            &node("data/nb/d.md", 2_000),
            &node("data/nb/d.md", 3_000),
            &local,
            &remote,
        )
        .await
        .unwrap()
        .expect("conflict expected");

        assert!(found.loser_on_local);
        assert_eq!(found.loser.modified_at, 2_000);
        assert_eq!(found.loser_bytes, b"local edit");
    }

    #[test]
    fn test_conflict_title_format() {
        let conflict = DetectedConflict {
            winner: node("data/nb/doc-3.md", 1_700_000_100),
            loser: node("data/nb/doc-3.md", 1_699_999_999),
            loser_bytes: Vec::new(),
            loser_on_local: false,
        };
        // 1699999999 = 2023-11-14 22:13:19 UTC
        assert_eq!(conflict.title(), "doc-3 - Conflict 2023-11-14 22:13:19");
    }

    #[tokio::test]
    async fn test_materialize_creates_sibling_on_both_replicas() {
        let (mut local, ls) = replica_with("local", "", 0).await;
        let (mut remote, rs) = replica_with("remote", "", 0).await;
        let (lid, rid) = (local.instance_id.clone(), remote.instance_id.clone());
        local.history.record(&rid, 1_000);
        remote.history.record(&lid, 1_000);

        let conflict = DetectedConflict {
            winner: node("data/nb/doc-3.md", 3_000),
            loser: node("data/nb/doc-3.md", 2_000),
            loser_bytes: b"older words".to_vec(),
            loser_on_local: true,
        };
        let session = SessionLog::new();
        ConflictHandler::materialize(&conflict, "nb", &local, &remote, &session).await;

        let created = ls.created_documents().await;
        assert_eq!(created.len(), 1);
        let canonical = created[0].canonical_path.clone();
        assert_eq!(crate::store::parent_path(&canonical), "data/nb");

        for store in [&ls, &rs] {
            let file = store.file(&canonical).await.expect("conflict copy missing");
            assert_eq!(file.bytes, b"older words");
            assert_eq!(file.modified_at_ms, 2_000 * 1000);
            let renames = store.renamed_documents().await;
            assert_eq!(renames.len(), 1);
            assert!(renames[0].1.starts_with("doc-3 - Conflict "));
        }
    }
}
