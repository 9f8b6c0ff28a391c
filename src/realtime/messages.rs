//! Realtime channel message protocol.
//!
//! One closed tagged enum, decoded exactly once at the transport boundary.
//! Blob payloads travel base64-encoded so the whole message stays valid
//! JSON text on the wire.

use crate::realtime::TransportError;
use crate::sync::tree::TreeNode;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Everything that can cross the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Mirror of a blob write.
    PutBlob {
        path: String,
        /// Base64-encoded bytes.
        content: String,
        modified_at_ms: u64,
    },
    /// Mirror of a blob/subtree deletion.
    RemoveBlob { path: String },
    /// Mirror of a document creation.
    CreateDocument {
        notebook_id: String,
        path: String,
        content: String,
    },
    /// Mirror of a document retitle.
    RenameDocument { document_id: String, title: String },
    /// A debounced content edit from an open editor.
    Edit {
        path: String,
        /// Base64-encoded bytes.
        content: String,
        session_id: String,
        modified_at_ms: u64,
    },
    /// One-shot request for a directory snapshot.
    ListRequest { req: String, path: String },
    /// Answer to [`ChannelMessage::ListRequest`]; `tree` is absent when the
    /// directory does not exist on the answering side.
    ListResponse {
        req: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tree: Option<TreeNode>,
    },
}

impl ChannelMessage {
    /// Correlation id, for the request/response kinds.
    pub fn req(&self) -> Option<&str> {
        match self {
            ChannelMessage::ListRequest { req, .. } => Some(req),
            ChannelMessage::ListResponse { req, .. } => Some(req),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::InvalidMessage(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, TransportError> {
        serde_json::from_str(raw).map_err(|e| TransportError::InvalidMessage(e.to_string()))
    }
}

/// Base64-encode blob bytes for the wire.
pub fn encode_content(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64 blob bytes from the wire.
pub fn decode_content(content: &str) -> Result<Vec<u8>, TransportError> {
    STANDARD
        .decode(content)
        .map_err(|e| TransportError::InvalidMessage(format!("bad base64 payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_blob_wire_format() {
        let msg = ChannelMessage::PutBlob {
            path: "data/nb1/doc-1.md".into(),
            content: encode_content(b"hello"),
            modified_at_ms: 100_000,
        };
        let wire = msg.encode().unwrap();
        assert!(wire.contains("\"type\":\"put_blob\""));
        assert!(wire.contains("\"path\":\"data/nb1/doc-1.md\""));

        let decoded = ChannelMessage::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_list_response_omits_absent_tree() {
        let msg = ChannelMessage::ListResponse {
            req: "r-1".into(),
            tree: None,
        };
        let wire = msg.encode().unwrap();
        assert!(!wire.contains("\"tree\""));
        match ChannelMessage::decode(&wire).unwrap() {
            ChannelMessage::ListResponse { req, tree } => {
                assert_eq!(req, "r-1");
                assert!(tree.is_none());
            }
            other => panic!("expected ListResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_req_only_on_correlated_kinds() {
        assert_eq!(
            ChannelMessage::ListRequest {
                req: "r-9".into(),
                path: "data".into(),
            }
            .req(),
            Some("r-9")
        );
        assert_eq!(
            ChannelMessage::RemoveBlob { path: "x".into() }.req(),
            None
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = ChannelMessage::decode(r#"{"type":"detonate","path":"x"}"#).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage(_)));
    }

    #[test]
    fn test_content_round_trip() {
        let bytes = vec![0u8, 159, 146, 150];
        let encoded = encode_content(&bytes);
        assert_eq!(decode_content(&encoded).unwrap(), bytes);
    }
}
