//! notesync: keeps two note-store replicas convergent.
//!
//! The engine decides, for every path that exists on either replica,
//! whether to copy, overwrite, delete, or leave a file alone, and
//! materializes true editing conflicts as clearly-titled sibling
//! documents. It never merges content: one side wins by modification
//! time and the loser is preserved.
//!
//! The host's note storage and the realtime push transport are
//! collaborators behind traits ([`store::NoteStore`],
//! [`realtime::RealtimeTransport`]); the engine owns only its own
//! bookkeeping (lock markers, sync-history ledgers, instance ids, and
//! rolling session logs) inside one configuration directory per replica.

pub mod error;
pub mod realtime;
pub mod replica;
pub mod session;
pub mod store;
pub mod sync;

pub use error::SyncError;
pub use replica::{Replica, ReplicaConfig, ReplicaHandle};
pub use session::SessionLog;
pub use store::{HttpNoteStore, MemoryNoteStore, NoteStore};
pub use sync::{
    EngineConfig, PassState, ReconciliationEngine, SyncObserver, SyncReport,
};
