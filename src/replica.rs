//! Replica descriptors and instance-id persistence.
//!
//! A replica is one endpoint of the pair being kept convergent. Its stable
//! instance id is generated lazily, persisted through the storage API, and
//! never regenerated while the marker is readable.

use crate::error::SyncError;
use crate::store::NoteStore;
use crate::sync::history::SyncHistory;
use std::sync::Arc;
use tracing::info;

/// Where a replica's instance id marker lives.
pub const INSTANCE_ID_FILE: &str = ".notesync/instance-id";

/// Connection settings for one replica, as provided by the operator.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub address: String,
    pub credential: String,
    pub display_name: String,
}

impl ReplicaConfig {
    /// Validate a local/remote pair before any I/O is attempted.
    pub fn validate_pair(local: &ReplicaConfig, remote: &ReplicaConfig) -> Result<(), SyncError> {
        for (which, config) in [("local", local), ("remote", remote)] {
            if config.address.trim().is_empty() {
                return Err(SyncError::Validation(format!(
                    "{} replica has no address",
                    which
                )));
            }
            if config.credential.trim().is_empty() {
                return Err(SyncError::Validation(format!(
                    "{} replica has no credential",
                    which
                )));
            }
        }
        if local.address == remote.address {
            return Err(SyncError::Validation(
                "local and remote replicas share one address".to_string(),
            ));
        }
        Ok(())
    }
}

/// An unresolved endpoint: a display name plus its storage handle.
#[derive(Clone)]
pub struct ReplicaHandle {
    pub name: String,
    pub store: Arc<dyn NoteStore>,
}

impl ReplicaHandle {
    pub fn new(name: impl Into<String>, store: Arc<dyn NoteStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

/// A resolved replica for the duration of one pass: handle plus persisted
/// identity and ledger. Discarded when the pass ends.
pub struct Replica {
    pub name: String,
    pub store: Arc<dyn NoteStore>,
    pub instance_id: String,
    pub history: SyncHistory,
}

impl Replica {
    /// Resolve a handle: ensure the instance id exists and load the ledger.
    pub async fn connect(handle: ReplicaHandle) -> Result<Self, SyncError> {
        let instance_id = ensure_instance_id(handle.store.as_ref(), &handle.name).await?;
        let history = SyncHistory::load(handle.store.as_ref()).await;
        Ok(Self {
            name: handle.name,
            store: handle.store,
            instance_id,
            history,
        })
    }
}

/// Read the persisted instance id, generating and persisting a fresh v4
/// UUID the first time.
async fn ensure_instance_id(store: &dyn NoteStore, name: &str) -> Result<String, SyncError> {
    if let Some(bytes) = store.get_blob(INSTANCE_ID_FILE).await? {
        let id = String::from_utf8_lossy(&bytes).trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    store
        .put_blob(
            INSTANCE_ID_FILE,
            id.as_bytes().to_vec(),
            crate::store::now_unix_millis(),
        )
        .await?;
    info!("generated instance id {} for replica {}", id, name);
    Ok(id)
}
