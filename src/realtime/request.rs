//! One-shot request/response exchanges over the realtime channel.
//!
//! Requests carry a random correlation id; a background dispatcher routes
//! each response to the pending caller, which settles exactly once: via
//! the response or via the fixed timeout, whichever comes first.

use crate::realtime::{ChannelMessage, RealtimeTransport, TransportError};
use crate::sync::tree::TreeNode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, trace, warn};

/// Fixed timeout for one exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type PendingRequests = Arc<RwLock<HashMap<String, oneshot::Sender<ChannelMessage>>>>;

/// Correlates requests with their responses on one channel.
pub struct RequestBroker {
    transport: Arc<dyn RealtimeTransport>,
    channel: String,
    pending: PendingRequests,
    timeout: Duration,
}

impl RequestBroker {
    /// Create a broker and start its response dispatcher.
    pub fn new(transport: Arc<dyn RealtimeTransport>, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let pending: PendingRequests = Arc::new(RwLock::new(HashMap::new()));

        let mut rx = transport.subscribe(&channel);
        let pending_for_dispatch = pending.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let ChannelMessage::ListResponse { ref req, .. } = message else {
                            continue;
                        };
                        let sender = {
                            let mut guard = pending_for_dispatch.write().await;
                            guard.remove(req.as_str())
                        };
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(message);
                            }
                            None => trace!("no pending request for response req={}", req),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("request dispatcher lagged {} messages", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("request dispatcher shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            transport,
            channel,
            pending,
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// Override the exchange timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the peer for a directory snapshot. `None` when the directory
    /// does not exist on the peer.
    pub async fn list_directory(&self, path: &str) -> Result<Option<TreeNode>, TransportError> {
        let req_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.write().await;
            guard.insert(req_id.clone(), tx);
        }

        let request = ChannelMessage::ListRequest {
            req: req_id.clone(),
            path: path.to_string(),
        };
        if let Err(e) = self.transport.publish(&self.channel, &request).await {
            self.pending.write().await.remove(&req_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(ChannelMessage::ListResponse { tree, .. })) => Ok(tree),
            Ok(Ok(other)) => Err(TransportError::InvalidMessage(format!(
                "unexpected response kind: {:?}",
                other
            ))),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.write().await.remove(&req_id);
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}
