//! Session-scoped logging.
//!
//! Each pass carries one [`SessionLog`], an explicit object handed to the
//! engine, not process-wide state. Lines mirror what goes to `tracing` but
//! are persisted through the storage API as a rolling set of session log
//! files, capped at the [`MAX_SESSION_LOGS`] most recent.

use crate::store::{join_path, NoteStore};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Session log directory inside the replica's configuration directory.
pub const LOGS_DIR: &str = ".notesync/logs";

/// How many session log files are kept; the oldest are pruned after each
/// flush.
pub const MAX_SESSION_LOGS: usize = 10;

/// Collector for one pass's log lines.
pub struct SessionLog {
    session_id: String,
    started_at: Instant,
    lines: Mutex<Vec<String>>,
}

impl SessionLog {
    pub fn new() -> Self {
        let session_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        Self {
            session_id,
            started_at: Instant::now(),
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Append one timestamped line.
    pub fn record(&self, line: impl AsRef<str>) {
        let stamped = format!(
            "{} {}",
            chrono::Utc::now().format("%H:%M:%S%.3f"),
            line.as_ref()
        );
        self.lines.lock().expect("session log poisoned").push(stamped);
    }

    /// Number of lines recorded so far.
    pub fn len(&self) -> usize {
        self.lines.lock().expect("session log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the collected lines as one session file and prune old ones.
    /// Best-effort: a replica that cannot take the log only warns.
    pub async fn flush(&self, store: &dyn NoteStore) {
        let body = {
            let lines = self.lines.lock().expect("session log poisoned");
            lines.join("\n")
        };
        let path = join_path(LOGS_DIR, &format!("sync-{}.log", self.session_id));
        if let Err(e) = store
            .put_blob(&path, body.into_bytes(), crate::store::now_unix_millis())
            .await
        {
            warn!("failed to write session log {}: {}", path, e);
            return;
        }
        prune_old_logs(store).await;
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Delete the oldest session logs beyond [`MAX_SESSION_LOGS`]. Session ids
/// start with a UTC timestamp, so lexical order is chronological order.
async fn prune_old_logs(store: &dyn NoteStore) {
    let entries = match store.list_directory(LOGS_DIR).await {
        Ok(Some(entries)) => entries,
        Ok(None) => return,
        Err(e) => {
            warn!("failed to list session logs: {}", e);
            return;
        }
    };

    let mut names: Vec<String> = entries
        .into_iter()
        .filter(|e| !e.is_directory && e.name.starts_with("sync-") && e.name.ends_with(".log"))
        .map(|e| e.name)
        .collect();
    names.sort();

    if names.len() <= MAX_SESSION_LOGS {
        return;
    }
    let excess = names.len() - MAX_SESSION_LOGS;
    for name in names.into_iter().take(excess) {
        let path = join_path(LOGS_DIR, &name);
        if let Err(e) = store.delete_file(&path).await {
            warn!("failed to prune session log {}: {}", path, e);
        }
    }
}
