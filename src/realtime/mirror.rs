//! Mutation mirroring over the realtime channel.
//!
//! Outbound: individual mutating calls publish their mirror message when
//! the channel is occupied on both ends. Inbound: an apply loop replays the
//! peer's mutations against the local store and answers directory-listing
//! requests with a snapshot.

use crate::realtime::{
    decode_content, encode_content, ChannelMessage, RealtimeTransport, TransportError,
};
use crate::store::NoteStore;
use crate::sync::tree::TreeNode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Both ends of one replica pair's realtime channel.
pub struct RealtimeMirror {
    store: Arc<dyn NoteStore>,
    transport: Arc<dyn RealtimeTransport>,
    channel: String,
}

impl RealtimeMirror {
    pub fn new(
        store: Arc<dyn NoteStore>,
        transport: Arc<dyn RealtimeTransport>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            channel: channel.into(),
        }
    }

    /// The realtime path is only worth using when somebody is listening on
    /// the other end.
    pub async fn is_viable(&self) -> bool {
        match self.transport.occupancy(&self.channel).await {
            Ok(count) => count >= 2,
            Err(e) => {
                debug!("occupancy check failed: {}", e);
                false
            }
        }
    }

    /// Mirror a blob write. Returns false when the channel is not viable.
    pub async fn mirror_put(
        &self,
        path: &str,
        bytes: &[u8],
        modified_at_ms: u64,
    ) -> Result<bool, TransportError> {
        if !self.is_viable().await {
            return Ok(false);
        }
        self.transport
            .publish(
                &self.channel,
                &ChannelMessage::PutBlob {
                    path: path.to_string(),
                    content: encode_content(bytes),
                    modified_at_ms,
                },
            )
            .await?;
        Ok(true)
    }

    /// Mirror a blob/subtree deletion.
    pub async fn mirror_remove(&self, path: &str) -> Result<bool, TransportError> {
        if !self.is_viable().await {
            return Ok(false);
        }
        self.transport
            .publish(
                &self.channel,
                &ChannelMessage::RemoveBlob {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(true)
    }

    /// Mirror a document creation.
    pub async fn mirror_create_document(
        &self,
        notebook_id: &str,
        path: &str,
        content: &str,
    ) -> Result<bool, TransportError> {
        if !self.is_viable().await {
            return Ok(false);
        }
        self.transport
            .publish(
                &self.channel,
                &ChannelMessage::CreateDocument {
                    notebook_id: notebook_id.to_string(),
                    path: path.to_string(),
                    content: content.to_string(),
                },
            )
            .await?;
        Ok(true)
    }

    /// Mirror a document retitle.
    pub async fn mirror_rename_document(
        &self,
        document_id: &str,
        title: &str,
    ) -> Result<bool, TransportError> {
        if !self.is_viable().await {
            return Ok(false);
        }
        self.transport
            .publish(
                &self.channel,
                &ChannelMessage::RenameDocument {
                    document_id: document_id.to_string(),
                    title: title.to_string(),
                },
            )
            .await?;
        Ok(true)
    }

    /// Start applying the peer's messages to the local store. Runs until
    /// the transport closes.
    pub fn spawn_apply_loop(&self) -> JoinHandle<()> {
        let mut rx = self.transport.subscribe(&self.channel);
        let store = self.store.clone();
        let transport = self.transport.clone();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            info!("realtime apply loop started on {}", channel);
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        apply_message(store.as_ref(), transport.as_ref(), &channel, message).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("realtime apply loop lagged {} messages", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("realtime apply loop on {} shutting down", channel);
                        break;
                    }
                }
            }
        })
    }
}

async fn apply_message(
    store: &dyn NoteStore,
    transport: &dyn RealtimeTransport,
    channel: &str,
    message: ChannelMessage,
) {
    match message {
        ChannelMessage::PutBlob {
            path,
            content,
            modified_at_ms,
        }
        | ChannelMessage::Edit {
            path,
            content,
            modified_at_ms,
            ..
        } => match decode_content(&content) {
            Ok(bytes) => {
                if let Err(e) = store.put_blob(&path, bytes, modified_at_ms).await {
                    warn!("realtime write of {} failed: {}", path, e);
                }
            }
            Err(e) => warn!("realtime write of {} carried bad payload: {}", path, e),
        },
        ChannelMessage::RemoveBlob { path } => {
            if let Err(e) = store.delete_file(&path).await {
                warn!("realtime delete of {} failed: {}", path, e);
            }
        }
        ChannelMessage::CreateDocument {
            notebook_id,
            path,
            content,
        } => {
            if let Err(e) = store.create_document(&notebook_id, &path, &content).await {
                warn!("realtime document creation at {} failed: {}", path, e);
            }
        }
        ChannelMessage::RenameDocument { document_id, title } => {
            if let Err(e) = store.rename_document(&document_id, &title).await {
                warn!("realtime rename of {} failed: {}", document_id, e);
            }
        }
        ChannelMessage::ListRequest { req, path } => {
            let tree = match TreeNode::snapshot(store, &path, &[]).await {
                Ok(tree) => tree,
                Err(e) => {
                    warn!("realtime listing of {} failed: {}", path, e);
                    None
                }
            };
            let response = ChannelMessage::ListResponse { req, tree };
            if let Err(e) = transport.publish(channel, &response).await {
                warn!("realtime listing response failed: {}", e);
            }
        }
        // Responses belong to the request broker.
        ChannelMessage::ListResponse { .. } => {}
    }
}
