//! Optional realtime push path.
//!
//! Between full passes, individual mutating calls and debounced content
//! edits can be mirrored over a persistent pub/sub channel instead of
//! waiting for the next reconciliation. The transport itself (WebSocket,
//! broker, whatever the host offers) is a collaborator behind
//! [`RealtimeTransport`]; this module owns the message protocol, the
//! request/response correlation, and the edit debouncing on top of it.

pub mod debounce;
pub mod messages;
pub mod mirror;
pub mod request;

pub use debounce::{EditDebouncer, EDIT_DEBOUNCE};
pub use messages::{decode_content, encode_content, ChannelMessage};
pub use mirror::RealtimeMirror;
pub use request::{RequestBroker, REQUEST_TIMEOUT};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Channel used for mutation mirroring unless the caller picks another.
pub const DEFAULT_CHANNEL: &str = "notesync/mutations";

/// Buffered messages per subscription before slow readers lag.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Errors from the realtime path. None of them are fatal to a sync pass;
/// the full reconciliation remains the source of truth.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("publish on {0} failed: {1}")]
    Publish(String, String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport closed")]
    Closed,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// The push transport collaborator.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn publish(&self, channel: &str, message: &ChannelMessage)
        -> Result<(), TransportError>;

    /// Subscribe to a channel's message stream.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChannelMessage>;

    /// How many participants are on the channel right now. Callers use
    /// this to decide whether the realtime path is viable at all.
    async fn occupancy(&self, channel: &str) -> Result<usize, TransportError>;
}

type ChannelMap = Arc<Mutex<HashMap<String, broadcast::Sender<ChannelMessage>>>>;

/// In-process transport connecting exactly two endpoints. Publishing on one
/// endpoint delivers to the other's subscribers only, like a broker between
/// two clients; nothing echoes back to the publisher.
pub struct LoopbackTransport {
    outbound: ChannelMap,
    inbound: ChannelMap,
}

impl LoopbackTransport {
    /// Create a connected endpoint pair.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let a: ChannelMap = Arc::new(Mutex::new(HashMap::new()));
        let b: ChannelMap = Arc::new(Mutex::new(HashMap::new()));
        (
            LoopbackTransport {
                outbound: b.clone(),
                inbound: a.clone(),
            },
            LoopbackTransport {
                outbound: a,
                inbound: b,
            },
        )
    }

    fn sender(map: &ChannelMap, channel: &str) -> broadcast::Sender<ChannelMessage> {
        let mut guard = map.lock().expect("loopback poisoned");
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl RealtimeTransport for LoopbackTransport {
    async fn publish(
        &self,
        channel: &str,
        message: &ChannelMessage,
    ) -> Result<(), TransportError> {
        // A send with no receivers is not an error; occupancy gates usage.
        let _ = Self::sender(&self.outbound, channel).send(message.clone());
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChannelMessage> {
        Self::sender(&self.inbound, channel).subscribe()
    }

    async fn occupancy(&self, channel: &str) -> Result<usize, TransportError> {
        let ours = Self::sender(&self.inbound, channel).receiver_count();
        let theirs = Self::sender(&self.outbound, channel).receiver_count();
        Ok(ours + theirs)
    }
}
