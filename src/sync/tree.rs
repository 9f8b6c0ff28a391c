//! Recursive directory snapshots and tree pairing.
//!
//! A [`TreeNode`] is an owned-children snapshot of one subtree on one
//! replica, built by listing one level at a time and recursing into every
//! discovered subdirectory concurrently. Trees received over the realtime
//! channel are plain serde values and reconstitute into the same structure
//! a direct listing produces.

use crate::error::SyncError;
use crate::store::{join_path, DirEntry, NoteStore};
use async_recursion::async_recursion;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// How two trees are keyed against each other.
///
/// Document files are named by their stable document id, so `ByName`
/// pairing lets a moved document pair with itself across replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKey {
    ByPath,
    ByName,
}

/// One node of a directory snapshot. `parent_path` is a plain string, not a
/// back-pointer, so the structure is a straightforward owned value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub path: String,
    pub parent_path: String,
    pub name: String,
    /// Seconds since the Unix epoch.
    pub modified_at: u64,
    pub is_directory: bool,
    #[serde(default)]
    pub is_symlink: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// The slice of a node the reconciliation decision logic needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMeta {
    pub path: String,
    pub name: String,
    pub modified_at: u64,
    pub is_directory: bool,
}

impl From<&TreeNode> for NodeMeta {
    fn from(node: &TreeNode) -> Self {
        Self {
            path: node.path.clone(),
            name: node.name.clone(),
            modified_at: node.modified_at,
            is_directory: node.is_directory,
        }
    }
}

impl TreeNode {
    /// Snapshot the subtree rooted at `root_path`, or `None` if it does not
    /// exist (or is a symlink). Symlinks and `excluded` names are filtered
    /// at every level; recursion into subdirectories is concurrent.
    pub async fn snapshot(
        store: &dyn NoteStore,
        root_path: &str,
        excluded: &[String],
    ) -> Result<Option<TreeNode>, SyncError> {
        let parent = crate::store::parent_path(root_path);
        let name = crate::store::file_name(root_path);
        let Some(entries) = store.list_directory(&parent).await? else {
            return Ok(None);
        };
        let Some(entry) = entries.into_iter().find(|e| e.name == name) else {
            return Ok(None);
        };
        if entry.is_symlink {
            return Ok(None);
        }
        build_node(store, root_path.to_string(), parent, entry, excluded)
            .await
            .map(Some)
    }

    /// All descendants (excluding this node), depth-first.
    pub fn descendants(&self) -> Vec<&TreeNode> {
        let mut out = Vec::new();
        collect_descendants(self, &mut out);
        out
    }

    /// Map of path → metadata for this node and every descendant. Used for
    /// ancestor-timestamp lookups during placement resolution.
    pub fn index(&self) -> HashMap<String, NodeMeta> {
        let mut map = HashMap::new();
        map.insert(self.path.clone(), NodeMeta::from(self));
        for node in self.descendants() {
            map.insert(node.path.clone(), NodeMeta::from(node));
        }
        map
    }

    /// Attach or replace a subtree whose `parent_path` names a directory in
    /// this tree. Returns false when no such directory exists. Lets partial
    /// listings received asynchronously be folded into one snapshot.
    pub fn merge_subtree(&mut self, subtree: TreeNode) -> bool {
        if self.path == subtree.parent_path {
            self.children.retain(|c| c.name != subtree.name);
            let at = self
                .children
                .binary_search_by(|c| c.name.cmp(&subtree.name))
                .unwrap_or_else(|i| i);
            self.children.insert(at, subtree);
            return true;
        }
        for child in &mut self.children {
            let under_child = subtree.parent_path == child.path
                || subtree
                    .parent_path
                    .starts_with(&format!("{}/", child.path));
            if child.is_directory && under_child {
                return child.merge_subtree(subtree);
            }
        }
        false
    }
}

fn collect_descendants<'a>(node: &'a TreeNode, out: &mut Vec<&'a TreeNode>) {
    for child in &node.children {
        out.push(child);
        collect_descendants(child, out);
    }
}

#[async_recursion]
async fn build_node(
    store: &dyn NoteStore,
    path: String,
    parent_path: String,
    entry: DirEntry,
    excluded: &[String],
) -> Result<TreeNode, SyncError> {
    let mut node = TreeNode {
        path: path.clone(),
        parent_path,
        name: entry.name,
        modified_at: entry.modified_at,
        is_directory: entry.is_directory,
        is_symlink: entry.is_symlink,
        children: Vec::new(),
    };

    if node.is_directory {
        if let Some(entries) = store.list_directory(&path).await? {
            let futures = entries
                .into_iter()
                .filter(|e| !e.is_symlink && !excluded.iter().any(|x| x == &e.name))
                .map(|e| {
                    let child_path = join_path(&path, &e.name);
                    build_node(store, child_path, path.clone(), e, excluded)
                });
            let mut children = Vec::new();
            for child in join_all(futures).await {
                children.push(child?);
            }
            children.sort_by(|a, b| a.name.cmp(&b.name));
            node.children = children;
        }
    }

    Ok(node)
}

/// Pair two snapshots into key → (side A, side B). Either side of a pair
/// may be absent; roots themselves are anchors and never appear as pairs.
pub fn pair_trees(
    a: Option<&TreeNode>,
    b: Option<&TreeNode>,
    key: PairKey,
) -> BTreeMap<String, (Option<NodeMeta>, Option<NodeMeta>)> {
    let mut pairs: BTreeMap<String, (Option<NodeMeta>, Option<NodeMeta>)> = BTreeMap::new();

    if let Some(tree) = a {
        for node in tree.descendants() {
            let k = key_of(node, key);
            let slot = pairs.entry(k.clone()).or_default();
            if slot.0.is_some() {
                warn!("duplicate pairing key {} on side A, keeping first", k);
                continue;
            }
            slot.0 = Some(NodeMeta::from(node));
        }
    }
    if let Some(tree) = b {
        for node in tree.descendants() {
            let k = key_of(node, key);
            let slot = pairs.entry(k.clone()).or_default();
            if slot.1.is_some() {
                warn!("duplicate pairing key {} on side B, keeping first", k);
                continue;
            }
            slot.1 = Some(NodeMeta::from(node));
        }
    }

    pairs
}

fn key_of(node: &TreeNode, key: PairKey) -> String {
    match key {
        PairKey::ByPath => node.path.clone(),
        PairKey::ByName => node.name.clone(),
    }
}
