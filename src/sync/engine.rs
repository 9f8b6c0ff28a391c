//! The reconciliation engine.
//!
//! One pass walks every sync target for a replica pair, decides per paired
//! path whether to copy, overwrite, delete, or leave alone, materializes
//! true editing conflicts, and finishes by updating both sync-history
//! ledgers. All fan-out is concurrent in-flight I/O; a failure in one
//! file's reconciliation is isolated and never cancels its siblings.

use crate::error::SyncError;
use crate::replica::{Replica, ReplicaConfig, ReplicaHandle};
use crate::session::SessionLog;
use crate::store::{file_name, now_unix_secs, parent_path, HttpNoteStore, NoteStore};
use crate::sync::conflict::ConflictHandler;
use crate::sync::lock::LockManager;
use crate::sync::target::{self, SyncTarget, STORAGE_DIR};
use crate::sync::tree::{pair_trees, NodeMeta, TreeNode};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Placement resolution climbs at most this many ancestor levels before
/// giving up with a skip.
pub const MAX_ANCESTOR_DEPTH: usize = 16;

/// Engine lifecycle, reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Idle,
    Locking,
    Reconciling,
    Finalizing,
    Failed,
}

/// Receives state transitions and user-facing messages (the plugin shell's
/// status icon hangs off this).
pub trait SyncObserver: Send + Sync {
    fn state_changed(&self, _state: PassState) {}
    fn message(&self, _text: &str) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl SyncObserver for NullObserver {}

/// Outcome of a pass (or of a single target).
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub copied_to_local: usize,
    pub copied_to_remote: usize,
    pub deleted_on_local: usize,
    pub deleted_on_remote: usize,
    pub conflicts: usize,
    pub failures: usize,
    pub changed_on_local: BTreeSet<String>,
    pub changed_on_remote: BTreeSet<String>,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn mutation_count(&self) -> usize {
        self.copied_to_local + self.copied_to_remote + self.deleted_on_local + self.deleted_on_remote
    }

    pub fn summary(&self) -> String {
        let mut parts = vec![format!(
            "{} pulled, {} pushed, {} pruned",
            self.copied_to_local,
            self.copied_to_remote,
            self.deleted_on_local + self.deleted_on_remote
        )];
        if self.conflicts > 0 {
            parts.push(format!("{} conflict copies", self.conflicts));
        }
        if self.failures > 0 {
            parts.push(format!("{} items skipped on errors", self.failures));
        }
        parts.join(", ")
    }

    fn absorb(&mut self, other: SyncReport) {
        self.copied_to_local += other.copied_to_local;
        self.copied_to_remote += other.copied_to_remote;
        self.deleted_on_local += other.deleted_on_local;
        self.deleted_on_remote += other.deleted_on_remote;
        self.conflicts += other.conflicts;
        self.failures += other.failures;
        self.changed_on_local.extend(other.changed_on_local);
        self.changed_on_remote.extend(other.changed_on_remote);
    }
}

/// Engine tuning.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Minimum gap between content-history snapshots; `None` disables them.
    pub snapshot_interval: Option<Duration>,
}

/// Mutable counters shared by one target's concurrent file fan-out.
#[derive(Default)]
struct PassStats {
    copied_to_local: AtomicUsize,
    copied_to_remote: AtomicUsize,
    deleted_on_local: AtomicUsize,
    deleted_on_remote: AtomicUsize,
    conflicts: AtomicUsize,
    failures: AtomicUsize,
    changed_on_local: Mutex<BTreeSet<String>>,
    changed_on_remote: Mutex<BTreeSet<String>>,
}

impl PassStats {
    fn record_copy(&self, to_local: bool) {
        if to_local {
            self.copied_to_local.fetch_add(1, Ordering::Relaxed);
        } else {
            self.copied_to_remote.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_delete(&self, on_local: bool) {
        if on_local {
            self.deleted_on_local.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deleted_on_remote.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_change(&self, on_local: bool, path: &str) {
        let set = if on_local {
            &self.changed_on_local
        } else {
            &self.changed_on_remote
        };
        set.lock().expect("stats poisoned").insert(path.to_string());
    }

    fn into_report(self) -> SyncReport {
        SyncReport {
            copied_to_local: self.copied_to_local.into_inner(),
            copied_to_remote: self.copied_to_remote.into_inner(),
            deleted_on_local: self.deleted_on_local.into_inner(),
            deleted_on_remote: self.deleted_on_remote.into_inner(),
            conflicts: self.conflicts.into_inner(),
            failures: self.failures.into_inner(),
            changed_on_local: self.changed_on_local.into_inner().expect("stats poisoned"),
            changed_on_remote: self.changed_on_remote.into_inner().expect("stats poisoned"),
            elapsed: Duration::ZERO,
        }
    }
}

pub struct ReconciliationEngine {
    config: EngineConfig,
    observer: Arc<dyn SyncObserver>,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate a config pair, build HTTP stores, and run one pass.
    pub async fn run_http(
        &self,
        local: &ReplicaConfig,
        remote: &ReplicaConfig,
        session: &SessionLog,
    ) -> Result<SyncReport, SyncError> {
        ReplicaConfig::validate_pair(local, remote)?;
        let local_handle = ReplicaHandle::new(
            local.display_name.clone(),
            Arc::new(HttpNoteStore::new(
                &local.address,
                &local.credential,
                &local.display_name,
            )) as Arc<dyn NoteStore>,
        );
        let remote_handle = ReplicaHandle::new(
            remote.display_name.clone(),
            Arc::new(HttpNoteStore::new(
                &remote.address,
                &remote.credential,
                &remote.display_name,
            )) as Arc<dyn NoteStore>,
        );
        self.run(local_handle, remote_handle, session).await
    }

    /// Run one full reconciliation pass. Locks are always released, the
    /// session log is always flushed, and exactly one terminal state is
    /// reported.
    pub async fn run(
        &self,
        local: ReplicaHandle,
        remote: ReplicaHandle,
        session: &SessionLog,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        session.record(format!("sync session {} started", session.session_id()));

        self.observer.state_changed(PassState::Locking);
        if let Err(e) = LockManager::acquire_all(&remote, &local).await {
            return Err(self.finish_failed(e, started, session, &local).await);
        }

        self.observer.state_changed(PassState::Reconciling);
        let outcome = self.run_locked(&local, &remote, session).await;

        LockManager::release(&local).await;
        LockManager::release(&remote).await;

        match outcome {
            Ok(mut report) => {
                report.elapsed = started.elapsed();
                let text = format!(
                    "sync finished in {:.1}s: {}",
                    report.elapsed.as_secs_f64(),
                    report.summary()
                );
                info!("{}", text);
                session.record(&text);
                session.flush(local.store.as_ref()).await;
                self.observer.message(&report.summary());
                self.observer.state_changed(PassState::Idle);
                Ok(report)
            }
            Err(e) => Err(self.finish_failed(e, started, session, &local).await),
        }
    }

    async fn finish_failed(
        &self,
        error: SyncError,
        started: Instant,
        session: &SessionLog,
        local: &ReplicaHandle,
    ) -> SyncError {
        let text = format!(
            "sync failed after {:.1}s: {}",
            started.elapsed().as_secs_f64(),
            error
        );
        warn!("{}", text);
        session.record(&text);
        session.flush(local.store.as_ref()).await;
        self.observer.message(&text);
        self.observer.state_changed(PassState::Failed);
        error
    }

    async fn run_locked(
        &self,
        local_handle: &ReplicaHandle,
        remote_handle: &ReplicaHandle,
        session: &SessionLog,
    ) -> Result<SyncReport, SyncError> {
        let mut local = Replica::connect(local_handle.clone()).await?;
        let mut remote = Replica::connect(remote_handle.clone()).await?;

        self.maybe_snapshot(&local).await;
        self.maybe_snapshot(&remote).await;

        let targets = target::enumerate(&local, &remote).await?;
        info!(
            "reconciling {} targets between {} and {}",
            targets.len(),
            local.name,
            remote.name
        );

        let target_reports = join_all(
            targets
                .iter()
                .map(|t| self.reconcile_target(t, &local, &remote, session)),
        )
        .await;
        let mut report = SyncReport::default();
        for partial in target_reports {
            report.absorb(partial);
        }

        // Assets go last, excluding names either side reports as unused.
        let unused = self.unused_asset_names(&local, &remote).await;
        report.absorb(
            self.reconcile_target(&SyncTarget::assets(unused), &local, &remote, session)
                .await,
        );

        self.observer.state_changed(PassState::Finalizing);

        for replica in [&local, &remote] {
            if let Err(e) = replica.store.refresh_file_tree().await {
                warn!("file tree refresh on {} failed: {}", replica.name, e);
            }
        }

        // Symmetric ledger write: both sides now know they observed each
        // other as of this instant. Failures only make the next pass
        // conservative (copy instead of delete), so they warn.
        let now = now_unix_secs();
        local.history.record(&remote.instance_id, now);
        remote.history.record(&local.instance_id, now);
        if let Err(e) = local.history.save(local.store.as_ref()).await {
            warn!("could not save sync history on {}: {}", local.name, e);
        }
        if let Err(e) = remote.history.save(remote.store.as_ref()).await {
            warn!("could not save sync history on {}: {}", remote.name, e);
        }

        self.notify_editors(&local, &remote, &report).await;

        Ok(report)
    }

    async fn maybe_snapshot(&self, replica: &Replica) {
        let Some(interval) = self.config.snapshot_interval else {
            return;
        };
        let last = replica.history.most_recent_sync();
        if last != 0 && now_unix_secs().saturating_sub(last) < interval.as_secs() {
            return;
        }
        if let Err(e) = replica.store.create_snapshot("pre-sync checkpoint").await {
            warn!("snapshot on {} failed: {}", replica.name, e);
        }
    }

    async fn unused_asset_names(&self, local: &Replica, remote: &Replica) -> Vec<String> {
        let mut names = BTreeSet::new();
        for replica in [local, remote] {
            match replica.store.list_unused_assets().await {
                Ok(paths) => names.extend(paths.iter().map(|p| file_name(p))),
                Err(e) => warn!("unused-asset listing on {} failed: {}", replica.name, e),
            }
        }
        names.into_iter().collect()
    }

    /// Reconcile one target: snapshot both sides, pair, and fan out the
    /// per-file decisions concurrently. All failures stay inside the
    /// returned report.
    pub async fn reconcile_target(
        &self,
        target: &SyncTarget,
        local: &Replica,
        remote: &Replica,
        session: &SessionLog,
    ) -> SyncReport {
        let stats = PassStats::default();

        let (local_tree, remote_tree) = tokio::join!(
            TreeNode::snapshot(local.store.as_ref(), &target.root_path, &target.excluded_names),
            TreeNode::snapshot(
                remote.store.as_ref(),
                &target.root_path,
                &target.excluded_names
            ),
        );
        let local_tree = match local_tree {
            Ok(tree) => tree,
            Err(e) => {
                warn!("could not scan {} on {}: {}", target.root_path, local.name, e);
                session.record(format!("skipped {}: {}", target.root_path, e));
                stats.failures.fetch_add(1, Ordering::Relaxed);
                return stats.into_report();
            }
        };
        let remote_tree = match remote_tree {
            Ok(tree) => tree,
            Err(e) => {
                warn!("could not scan {} on {}: {}", target.root_path, remote.name, e);
                session.record(format!("skipped {}: {}", target.root_path, e));
                stats.failures.fetch_add(1, Ordering::Relaxed);
                return stats.into_report();
            }
        };

        if local_tree.is_none() && remote_tree.is_none() {
            debug!("target {} absent on both replicas", target.root_path);
            return stats.into_report();
        }
        if let (Some(a), Some(b)) = (&local_tree, &remote_tree) {
            if a.is_directory != b.is_directory {
                warn!(
                    "target {} is a file on one replica and a directory on the other, skipping",
                    target.root_path
                );
                session.record(format!(
                    "skipped {}: file/directory mismatch at the root",
                    target.root_path
                ));
                return stats.into_report();
            }
        }

        let local_index = local_tree.as_ref().map(TreeNode::index).unwrap_or_default();
        let remote_index = remote_tree.as_ref().map(TreeNode::index).unwrap_or_default();

        let pairs = pair_trees(
            local_tree.as_ref(),
            remote_tree.as_ref(),
            target.options.pair_key,
        );
        let work = pairs.into_iter().map(|(key, (l, r))| {
            self.sync_file_guarded(
                key,
                l,
                r,
                target,
                local,
                remote,
                &local_index,
                &remote_index,
                &stats,
                session,
            )
        });
        join_all(work).await;

        stats.into_report()
    }

    /// Wrapper that keeps one file's failure from touching its siblings.
    #[allow(clippy::too_many_arguments)]
    async fn sync_file_guarded(
        &self,
        key: String,
        local_node: Option<NodeMeta>,
        remote_node: Option<NodeMeta>,
        target: &SyncTarget,
        local: &Replica,
        remote: &Replica,
        local_index: &HashMap<String, NodeMeta>,
        remote_index: &HashMap<String, NodeMeta>,
        stats: &PassStats,
        session: &SessionLog,
    ) {
        let result = self
            .sync_file(
                &key,
                local_node,
                remote_node,
                target,
                local,
                remote,
                local_index,
                remote_index,
                stats,
                session,
            )
            .await;
        if let Err(e) = result {
            warn!("reconciliation of {} failed: {}", key, e);
            session.record(format!("failed {}: {}", key, e));
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The per-path decision procedure: skip trivial cases, detect
    /// conflicts, then let the newer side win, treating single-sided
    /// files as tombstones only when the ledgers prove the other side
    /// already saw them.
    #[allow(clippy::too_many_arguments)]
    async fn sync_file(
        &self,
        key: &str,
        local_node: Option<NodeMeta>,
        remote_node: Option<NodeMeta>,
        target: &SyncTarget,
        local: &Replica,
        remote: &Replica,
        local_index: &HashMap<String, NodeMeta>,
        remote_index: &HashMap<String, NodeMeta>,
        stats: &PassStats,
        session: &SessionLog,
    ) -> Result<(), SyncError> {
        let opts = &target.options;

        let (l, r) = match (local_node, remote_node) {
            (None, None) => return Ok(()),
            (Some(node), None) => {
                return self
                    .sync_single_side(node, true, target, local, remote, stats)
                    .await;
            }
            (None, Some(node)) => {
                return self
                    .sync_single_side(node, false, target, local, remote, stats)
                    .await;
            }
            (Some(l), Some(r)) => (l, r),
        };

        if opts.only_if_missing {
            return Ok(());
        }
        if l.modified_at == r.modified_at && l.path == r.path {
            return Ok(());
        }

        if opts.track_conflicts && !l.is_directory && !r.is_directory {
            match ConflictHandler::detect(&l, &r, local, remote).await {
                Ok(Some(conflict)) => {
                    stats.conflicts.fetch_add(1, Ordering::Relaxed);
                    let notebook = target.notebook_id.as_deref().unwrap_or("");
                    ConflictHandler::materialize(&conflict, notebook, local, remote, session)
                        .await;
                }
                Ok(None) => {}
                // Transient fetch trouble: the regular copy below still
                // runs, so nothing is lost, only the conflict copy.
                Err(e) => warn!("conflict detection for {} failed: {}", key, e),
            }
        }

        if l.is_directory != r.is_directory {
            warn!(
                "{} is a file on one replica and a directory on the other, leaving both",
                key
            );
            return Ok(());
        }
        if l.is_directory {
            // Paired directories carry no content of their own.
            return Ok(());
        }

        if l.modified_at == r.modified_at {
            // Same stamp at different paths: the ancestor chain decides.
            return self
                .resolve_placement(&l, &r, target, local, remote, local_index, remote_index, stats)
                .await;
        }

        let stamp_ms = l.modified_at.max(r.modified_at) * 1000;
        let (src_node, dst_node, src, dst, to_local) = if l.modified_at > r.modified_at {
            (&l, &r, local, remote, false)
        } else {
            (&r, &l, remote, local, true)
        };

        let Some(bytes) = src.store.get_blob(&src_node.path).await? else {
            debug!("{} vanished on {} mid-pass", src_node.path, src.name);
            return Ok(());
        };
        dst.store.put_blob(&src_node.path, bytes, stamp_ms).await?;
        if dst_node.path != src_node.path {
            dst.store.delete_file(&dst_node.path).await?;
            stats.record_delete(to_local);
        }
        stats.record_copy(to_local);
        if opts.track_updated_files {
            stats.record_change(to_local, &src_node.path);
        }
        debug!("updated {} on {}", src_node.path, dst.name);
        Ok(())
    }

    /// A path present on exactly one side: either a deletion to propagate
    /// or content that never propagated. The ledgers decide.
    async fn sync_single_side(
        &self,
        node: NodeMeta,
        on_local: bool,
        target: &SyncTarget,
        local: &Replica,
        remote: &Replica,
        stats: &PassStats,
    ) -> Result<(), SyncError> {
        let opts = &target.options;
        let (holder, absent) = if on_local {
            (local, remote)
        } else {
            (remote, local)
        };

        // Tombstone: the absent side saw this file at the last mutual sync
        // (ledger time is newer than the file), and the holder has not
        // since synced anywhere that could have reintroduced it.
        let last_mutual = absent.history.last_sync_with(&holder.instance_id);
        let is_tombstone = last_mutual > 0
            && last_mutual > node.modified_at
            && last_mutual >= holder.history.most_recent_sync();

        if is_tombstone {
            if deletion_allowed(opts, node.is_directory) {
                holder.store.delete_file(&node.path).await?;
                stats.record_delete(on_local);
                if opts.track_updated_files {
                    stats.record_change(on_local, &node.path);
                }
                info!(
                    "pruned {} from {}: deleted on {} since their last sync",
                    node.path, holder.name, absent.name
                );
            } else {
                debug!(
                    "{} looks deleted on {} but the target policy forbids pruning",
                    node.path, absent.name
                );
            }
            return Ok(());
        }

        if node.is_directory {
            // Never propagated, but directories materialize through their
            // child file writes.
            debug!(
                "directory {} will appear on {} through its children",
                node.path, absent.name
            );
            return Ok(());
        }

        let Some(bytes) = holder.store.get_blob(&node.path).await? else {
            debug!("{} vanished on {} mid-pass", node.path, holder.name);
            return Ok(());
        };
        absent
            .store
            .put_blob(&node.path, bytes, node.modified_at * 1000)
            .await?;
        stats.record_copy(!on_local);
        if opts.track_updated_files {
            stats.record_change(!on_local, &node.path);
        }
        debug!("propagated {} to {}", node.path, absent.name);
        Ok(())
    }

    /// The same document sits at two different paths with one timestamp.
    /// Climb both ancestor chains in lockstep; the first level where the
    /// directory timestamps differ names the authoritative placement. The
    /// climb is bounded and gives up with a skip.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_placement(
        &self,
        l: &NodeMeta,
        r: &NodeMeta,
        target: &SyncTarget,
        local: &Replica,
        remote: &Replica,
        local_index: &HashMap<String, NodeMeta>,
        remote_index: &HashMap<String, NodeMeta>,
        stats: &PassStats,
    ) -> Result<(), SyncError> {
        let mut local_dir = parent_path(&l.path);
        let mut remote_dir = parent_path(&r.path);

        for _ in 0..MAX_ANCESTOR_DEPTH {
            if local_dir == target.root_path && remote_dir == target.root_path {
                break;
            }
            if local_dir.is_empty() || remote_dir.is_empty() {
                break;
            }
            let (Some(lm), Some(rm)) = (local_index.get(&local_dir), remote_index.get(&remote_dir))
            else {
                break;
            };
            if lm.modified_at != rm.modified_at {
                let local_wins = lm.modified_at > rm.modified_at;
                let (winner, stale, src, dst, to_local) = if local_wins {
                    (l, r, local, remote, false)
                } else {
                    (r, l, remote, local, true)
                };
                let Some(bytes) = src.store.get_blob(&winner.path).await? else {
                    return Ok(());
                };
                dst.store
                    .put_blob(&winner.path, bytes, winner.modified_at * 1000)
                    .await?;
                dst.store.delete_file(&stale.path).await?;
                stats.record_copy(to_local);
                stats.record_delete(to_local);
                if target.options.track_updated_files {
                    stats.record_change(to_local, &winner.path);
                }
                info!(
                    "moved {} to {} on {}: ancestor timestamps name the newer placement",
                    stale.path, winner.path, dst.name
                );
                return Ok(());
            }
            local_dir = parent_path(&local_dir);
            remote_dir = parent_path(&remote_dir);
        }

        debug!(
            "placement of {} vs {} is undecidable, leaving both",
            l.path, r.path
        );
        Ok(())
    }

    /// Tell open editors what changed. When anything under the structured
    /// data store moved, a partial reload can miss cross-document index
    /// state, so the whole workspace reloads instead.
    async fn notify_editors(&self, local: &Replica, remote: &Replica, report: &SyncReport) {
        let storage_prefix = format!("{}/", STORAGE_DIR);
        for (replica, changed) in [
            (local, &report.changed_on_local),
            (remote, &report.changed_on_remote),
        ] {
            if changed.is_empty() {
                continue;
            }
            let touches_storage = changed
                .iter()
                .any(|p| p == STORAGE_DIR || p.starts_with(&storage_prefix));
            if touches_storage {
                if let Err(e) = replica.store.reload_workspace().await {
                    warn!("workspace reload on {} failed: {}", replica.name, e);
                }
                continue;
            }
            for path in changed {
                if let Err(e) = replica.store.reload_open_document(path).await {
                    warn!("document reload of {} on {} failed: {}", path, replica.name, e);
                }
            }
        }
    }
}

fn deletion_allowed(opts: &crate::sync::target::TargetOptions, is_directory: bool) -> bool {
    if opts.avoid_deletions || opts.only_if_missing {
        return false;
    }
    if opts.delete_folders_only {
        return is_directory;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::target::TargetOptions;

    fn opts() -> TargetOptions {
        TargetOptions::default()
    }

    #[test]
    fn test_deletion_gating() {
        assert!(deletion_allowed(&opts(), false));
        assert!(deletion_allowed(&opts(), true));

        let never = TargetOptions {
            avoid_deletions: true,
            ..opts()
        };
        assert!(!deletion_allowed(&never, false));
        assert!(!deletion_allowed(&never, true));

        let folders = TargetOptions {
            delete_folders_only: true,
            ..opts()
        };
        assert!(!deletion_allowed(&folders, false));
        assert!(deletion_allowed(&folders, true));

        let if_missing = TargetOptions {
            only_if_missing: true,
            ..opts()
        };
        assert!(!deletion_allowed(&if_missing, false));
    }

    #[test]
    fn test_report_summary_mentions_conflicts() {
        let report = SyncReport {
            copied_to_local: 2,
            conflicts: 1,
            ..SyncReport::default()
        };
        let text = report.summary();
        assert!(text.contains("2 pulled"));
        assert!(text.contains("1 conflict"));
    }
}
