//! The reconciliation core: directory snapshots, ledgers, locks, conflict
//! handling, and the engine that drives one full pass.

pub mod conflict;
pub mod engine;
pub mod history;
pub mod lock;
pub mod target;
pub mod tree;

pub use conflict::{ConflictHandler, DetectedConflict};
pub use engine::{
    EngineConfig, NullObserver, PassState, ReconciliationEngine, SyncObserver, SyncReport,
    MAX_ANCESTOR_DEPTH,
};
pub use history::{SyncHistory, HISTORY_FILE};
pub use lock::{LockManager, LOCK_FILE, LOCK_STALE_AFTER};
pub use target::{SyncTarget, TargetOptions};
pub use tree::{pair_trees, NodeMeta, PairKey, TreeNode};
