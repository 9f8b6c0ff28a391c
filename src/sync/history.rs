//! Per-replica sync-history ledger.
//!
//! A small JSON object mapping peer instance id → the last time (unix
//! seconds) this replica and that peer are known to have observed each
//! other's state. The ledger is what lets the engine tell "deleted since we
//! last talked" apart from "never propagated".

use crate::error::SyncError;
use crate::store::NoteStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Where the ledger lives inside a replica's configuration directory.
pub const HISTORY_FILE: &str = ".notesync/sync-history.json";

/// Ledger of last mutual syncs, keyed by peer instance id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncHistory {
    #[serde(flatten)]
    peers: HashMap<String, u64>,
}

impl SyncHistory {
    /// Load the ledger. Any read or parse failure yields an empty ledger;
    /// a fresh ledger only makes the engine conservative (it copies instead
    /// of deleting), so this is non-fatal.
    pub async fn load(store: &dyn NoteStore) -> Self {
        match store.get_blob(HISTORY_FILE).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(history) => history,
                Err(e) => {
                    warn!("unreadable sync history, starting empty: {}", e);
                    Self::default()
                }
            },
            Ok(None) => {
                debug!("no sync history yet");
                Self::default()
            }
            Err(e) => {
                warn!("failed to load sync history, starting empty: {}", e);
                Self::default()
            }
        }
    }

    /// Serialize and write the ledger back.
    pub async fn save(&self, store: &dyn NoteStore) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        store
            .put_blob(HISTORY_FILE, bytes, crate::store::now_unix_millis())
            .await
    }

    /// Last mutual sync with `peer_id`, or 0 if never.
    pub fn last_sync_with(&self, peer_id: &str) -> u64 {
        self.peers.get(peer_id).copied().unwrap_or(0)
    }

    /// Most recent sync with any peer, or 0 if never.
    pub fn most_recent_sync(&self) -> u64 {
        self.peers.values().copied().max().unwrap_or(0)
    }

    /// Record a mutual sync with `peer_id` at `at` (unix seconds).
    pub fn record(&mut self, peer_id: &str, at: u64) {
        self.peers.insert(peer_id.to_string(), at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryNoteStore;

    #[tokio::test]
    async fn test_missing_ledger_is_empty() {
        let store = MemoryNoteStore::new();
        let history = SyncHistory::load(&store).await;
        assert_eq!(history.last_sync_with("peer"), 0);
        assert_eq!(history.most_recent_sync(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_is_empty() {
        let store = MemoryNoteStore::new();
        store.insert_file(HISTORY_FILE, b"not json{", 1_000).await;
        let history = SyncHistory::load(&store).await;
        assert_eq!(history.most_recent_sync(), 0);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let store = MemoryNoteStore::new();
        let mut history = SyncHistory::default();
        history.record("peer-a", 1_700_000_000);
        history.record("peer-b", 1_700_000_100);
        history.save(&store).await.unwrap();

        let loaded = SyncHistory::load(&store).await;
        assert_eq!(loaded.last_sync_with("peer-a"), 1_700_000_000);
        assert_eq!(loaded.most_recent_sync(), 1_700_000_100);
        assert_eq!(loaded.last_sync_with("unknown"), 0);
    }
}
