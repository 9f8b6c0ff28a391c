//! Coarse pair-wide locking via marker files.
//!
//! One zero-byte marker per replica keeps two overlapping passes from
//! corrupting each other's bookkeeping. A marker older than
//! [`LOCK_STALE_AFTER`] is treated as abandoned and overwritten. This does
//! not guarantee mutual exclusion against a fully independent third actor;
//! it protects a single client from racing itself.

use crate::error::SyncError;
use crate::replica::ReplicaHandle;
use crate::store::{file_name, now_unix_millis, now_unix_secs, parent_path};
use std::time::Duration;
use tracing::{info, warn};

/// Where the lock marker lives inside a replica's configuration directory.
pub const LOCK_FILE: &str = ".notesync/sync.lock";

/// A lock marker older than this is considered abandoned.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

pub struct LockManager;

impl LockManager {
    /// Acquire the marker on one replica, overriding a stale one.
    pub async fn acquire(replica: &ReplicaHandle) -> Result<(), SyncError> {
        if let Some(age_secs) = Self::marker_age_secs(replica).await? {
            if age_secs < LOCK_STALE_AFTER.as_secs() {
                return Err(SyncError::LockContention {
                    replica: replica.name.clone(),
                    age_secs,
                });
            }
            info!(
                "overriding stale lock on {} ({}s old)",
                replica.name, age_secs
            );
        }
        replica
            .store
            .put_blob(LOCK_FILE, Vec::new(), now_unix_millis())
            .await
    }

    /// Acquire both locks, remote first. The fixed order keeps a single
    /// client from racing itself across rapid repeated invocations. If the
    /// local acquire fails the remote marker is released again.
    pub async fn acquire_all(
        remote: &ReplicaHandle,
        local: &ReplicaHandle,
    ) -> Result<(), SyncError> {
        Self::acquire(remote).await?;
        if let Err(e) = Self::acquire(local).await {
            Self::release(remote).await;
            return Err(e);
        }
        Ok(())
    }

    /// Delete the marker. Failure is not retried: a fresh leftover lock
    /// only blocks the next pass until it goes stale, so the operator gets
    /// a persistent warning with the path to remove by hand.
    pub async fn release(replica: &ReplicaHandle) {
        if let Err(e) = replica.store.delete_file(LOCK_FILE).await {
            warn!(
                "could not release sync lock on {}: {}; remove {} manually",
                replica.name, e, LOCK_FILE
            );
        }
    }

    /// Age of the marker in seconds, or `None` when absent.
    async fn marker_age_secs(replica: &ReplicaHandle) -> Result<Option<u64>, SyncError> {
        let dir = parent_path(LOCK_FILE);
        let name = file_name(LOCK_FILE);
        let Some(entries) = replica.store.list_directory(&dir).await? else {
            return Ok(None);
        };
        let Some(entry) = entries.into_iter().find(|e| e.name == name) else {
            return Ok(None);
        };
        Ok(Some(now_unix_secs().saturating_sub(entry.modified_at)))
    }
}
