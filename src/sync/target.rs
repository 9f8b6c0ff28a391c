//! Sync-target descriptors.
//!
//! A target is a declared subtree plus the policy flags describing how it
//! reconciles. Targets are enumerated fresh at the start of every pass from
//! the current notebook lists plus a fixed set of auxiliary directories,
//! and are never persisted.

use crate::error::SyncError;
use crate::replica::Replica;
use crate::sync::tree::PairKey;
use std::collections::BTreeMap;

/// Root of all synced content.
pub const DATA_DIR: &str = "data";
/// Per-notebook configuration subtree, excluded from the document pass.
pub const NOTEBOOK_META_DIR: &str = ".meta";
/// Attachment directory, reconciled last with unused names excluded.
pub const ASSETS_DIR: &str = "data/assets";
/// Structured-data store; changes here require a full workspace reload.
pub const STORAGE_DIR: &str = "data/storage";

/// Fixed directories where only stale folders may be pruned.
pub const FOLDER_PRUNE_DIRS: [&str; 2] = ["data/templates", "data/widgets"];
/// Fixed directories that only ever gain content.
pub const NEVER_DELETE_DIRS: [&str; 2] = ["data/emojis", "data/snippets"];
/// Fixed directories created once and then left alone.
pub const IF_MISSING_DIRS: [&str; 2] = ["conf/appearance", "conf/langs"];

/// Policy flags for one target.
#[derive(Debug, Clone)]
pub struct TargetOptions {
    /// Prune stale directories but never plain files.
    pub delete_folders_only: bool,
    /// Copy a file only when the other side lacks it entirely.
    pub only_if_missing: bool,
    /// Never prune anything.
    pub avoid_deletions: bool,
    /// Run conflict detection on paired files.
    pub track_conflicts: bool,
    /// Record written paths for editor reload notification.
    pub track_updated_files: bool,
    pub pair_key: PairKey,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            delete_folders_only: false,
            only_if_missing: false,
            avoid_deletions: false,
            track_conflicts: false,
            track_updated_files: false,
            pair_key: PairKey::ByPath,
        }
    }
}

/// One declared subtree to reconcile.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub root_path: String,
    pub excluded_names: Vec<String>,
    /// Container for conflict copies, present on document targets.
    pub notebook_id: Option<String>,
    pub options: TargetOptions,
}

impl SyncTarget {
    fn plain(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            excluded_names: Vec::new(),
            notebook_id: None,
            options: TargetOptions::default(),
        }
    }

    /// Document tree of one notebook: name-keyed pairing so moved documents
    /// pair with themselves, conflict tracking, reload tracking.
    pub fn notebook(notebook_id: &str) -> Self {
        Self {
            root_path: format!("{}/{}", DATA_DIR, notebook_id),
            excluded_names: vec![NOTEBOOK_META_DIR.to_string()],
            notebook_id: Some(notebook_id.to_string()),
            options: TargetOptions {
                track_conflicts: true,
                track_updated_files: true,
                pair_key: PairKey::ByName,
                ..TargetOptions::default()
            },
        }
    }

    /// Configuration subtree of one notebook.
    pub fn notebook_meta(notebook_id: &str) -> Self {
        Self::plain(format!(
            "{}/{}/{}",
            DATA_DIR, notebook_id, NOTEBOOK_META_DIR
        ))
    }

    /// Attachment directory, with currently-unused asset names excluded.
    pub fn assets(unused_names: Vec<String>) -> Self {
        Self {
            root_path: ASSETS_DIR.to_string(),
            excluded_names: unused_names,
            notebook_id: None,
            options: TargetOptions::default(),
        }
    }
}

/// Enumerate every target for one pass, in a stable order: per-notebook
/// document and config targets over the union of both sides' notebook
/// lists, then the fixed auxiliary directories. The asset target is built
/// separately once both sides' unused-asset lists are known.
pub async fn enumerate(local: &Replica, remote: &Replica) -> Result<Vec<SyncTarget>, SyncError> {
    let mut notebooks = BTreeMap::new();
    for notebook in local.store.list_notebooks().await? {
        notebooks.insert(notebook.id.clone(), notebook);
    }
    for notebook in remote.store.list_notebooks().await? {
        notebooks.entry(notebook.id.clone()).or_insert(notebook);
    }

    let mut targets = Vec::new();
    for id in notebooks.keys() {
        targets.push(SyncTarget::notebook(id));
        targets.push(SyncTarget::notebook_meta(id));
    }

    for dir in FOLDER_PRUNE_DIRS {
        let mut target = SyncTarget::plain(dir);
        target.options.delete_folders_only = true;
        targets.push(target);
    }
    for dir in NEVER_DELETE_DIRS {
        let mut target = SyncTarget::plain(dir);
        target.options.avoid_deletions = true;
        targets.push(target);
    }
    for dir in IF_MISSING_DIRS {
        let mut target = SyncTarget::plain(dir);
        target.options.only_if_missing = true;
        targets.push(target);
    }

    let mut storage = SyncTarget::plain(STORAGE_DIR);
    storage.options.track_updated_files = true;
    targets.push(storage);

    Ok(targets)
}
