//! Per-document edit debouncing.
//!
//! Rapid keystrokes on one open document coalesce into a single propagated
//! write. Every new edit resets that document's timer; when the timer
//! finally fires, the payload is discarded if the originating edit session
//! no longer matches the active one, or if the content hash equals the
//! last published one.

use crate::realtime::{encode_content, ChannelMessage, RealtimeTransport};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// How long a document must stay quiet before its edit propagates.
pub const EDIT_DEBOUNCE: Duration = Duration::from_secs(5);

struct PendingEdit {
    generation: u64,
    session_id: String,
    content: Vec<u8>,
    modified_at_ms: u64,
}

#[derive(Default)]
struct DebounceState {
    pending: HashMap<String, PendingEdit>,
    last_published: HashMap<String, String>,
}

/// Coalesces rapid edits per open-document path.
pub struct EditDebouncer {
    transport: Arc<dyn RealtimeTransport>,
    channel: String,
    debounce: Duration,
    active_session: Arc<RwLock<String>>,
    state: Arc<RwLock<DebounceState>>,
}

impl EditDebouncer {
    pub fn new(transport: Arc<dyn RealtimeTransport>, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
            debounce: EDIT_DEBOUNCE,
            active_session: Arc::new(RwLock::new(String::new())),
            state: Arc::new(RwLock::new(DebounceState::default())),
        }
    }

    /// Override the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Record which edit session currently owns the editor.
    pub async fn set_active_session(&self, session_id: &str) {
        *self.active_session.write().await = session_id.to_string();
    }

    /// Note one edit; (re)starts the document's debounce timer.
    pub async fn note_edit(
        &self,
        path: &str,
        session_id: &str,
        content: Vec<u8>,
        modified_at_ms: u64,
    ) {
        let generation = {
            let mut state = self.state.write().await;
            let entry = state
                .pending
                .entry(path.to_string())
                .or_insert_with(|| PendingEdit {
                    generation: 0,
                    session_id: String::new(),
                    content: Vec::new(),
                    modified_at_ms: 0,
                });
            entry.generation += 1;
            entry.session_id = session_id.to_string();
            entry.content = content;
            entry.modified_at_ms = modified_at_ms;
            entry.generation
        };

        let transport = self.transport.clone();
        let channel = self.channel.clone();
        let state = self.state.clone();
        let active_session = self.active_session.clone();
        let debounce = self.debounce;
        let path = path.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            let active = active_session.read().await.clone();
            let edit = {
                let mut guard = state.write().await;
                let superseded = match guard.pending.get(&path) {
                    Some(pending) => pending.generation != generation,
                    None => true,
                };
                if superseded {
                    return;
                }
                let pending = guard
                    .pending
                    .remove(&path)
                    .expect("pending edit checked above");
                if pending.session_id != active {
                    debug!("dropping debounced edit for {}: edit session changed", path);
                    return;
                }
                let hash = format!("{:x}", Sha256::digest(&pending.content));
                if guard.last_published.get(&path) == Some(&hash) {
                    debug!("dropping debounced edit for {}: content unchanged", path);
                    return;
                }
                guard.last_published.insert(path.clone(), hash);
                pending
            };

            let message = ChannelMessage::Edit {
                path: path.clone(),
                content: encode_content(&edit.content),
                session_id: edit.session_id,
                modified_at_ms: edit.modified_at_ms,
            };
            if let Err(e) = transport.publish(&channel, &message).await {
                warn!("debounced edit for {} failed to publish: {}", path, e);
            }
        });
    }

    /// Number of documents with a timer currently running.
    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }
}
