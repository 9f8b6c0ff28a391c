//! End-to-end engine tests over in-memory replicas.

use notesync::replica::{Replica, ReplicaHandle, INSTANCE_ID_FILE};
use notesync::store::{MemoryNoteStore, NoteStore, Notebook};
use notesync::sync::{
    EngineConfig, ReconciliationEngine, SyncTarget, HISTORY_FILE, LOCK_FILE,
};
use notesync::{SessionLog, SyncError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> ReconciliationEngine {
    ReconciliationEngine::new(EngineConfig::default())
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Give a store a fixed instance id and a ledger, before the engine runs.
async fn seed_identity(store: &MemoryNoteStore, id: &str, ledger: &[(&str, u64)]) {
    store
        .insert_file(INSTANCE_ID_FILE, id.as_bytes(), 1_000)
        .await;
    if !ledger.is_empty() {
        let map: HashMap<&str, u64> = ledger.iter().copied().collect();
        let bytes = serde_json::to_vec(&map).unwrap();
        store.insert_file(HISTORY_FILE, &bytes, 1_000).await;
    }
}

async fn notebook_pair() -> (Arc<MemoryNoteStore>, Arc<MemoryNoteStore>) {
    let local = Arc::new(MemoryNoteStore::new());
    let remote = Arc::new(MemoryNoteStore::new());
    let nb = vec![Notebook {
        id: "nb1".into(),
        name: "First".into(),
    }];
    local.set_notebooks(nb.clone()).await;
    remote.set_notebooks(nb).await;
    (local, remote)
}

fn handles(
    local: &Arc<MemoryNoteStore>,
    remote: &Arc<MemoryNoteStore>,
) -> (ReplicaHandle, ReplicaHandle) {
    (
        ReplicaHandle::new("local", local.clone()),
        ReplicaHandle::new("remote", remote.clone()),
    )
}

#[tokio::test]
async fn convergence_copies_new_file_with_timestamp() {
    let (local, remote) = notebook_pair().await;
    local
        .insert_file("data/nb1/doc-1.md", b"fresh note", 100_000)
        .await;

    let (lh, rh) = handles(&local, &remote);
    let report = engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert_eq!(report.copied_to_remote, 1);
    assert_eq!(report.deleted_on_local + report.deleted_on_remote, 0);
    assert_eq!(report.conflicts, 0);

    let copied = remote.file("data/nb1/doc-1.md").await.expect("not copied");
    assert_eq!(copied.bytes, b"fresh note");
    assert_eq!(copied.modified_at_ms, 100_000);

    // Both ledgers now record the mutual sync symmetrically.
    let local_ledger = local.get_blob(HISTORY_FILE).await.unwrap().unwrap();
    let remote_ledger = remote.get_blob(HISTORY_FILE).await.unwrap().unwrap();
    let local_map: HashMap<String, u64> = serde_json::from_slice(&local_ledger).unwrap();
    let remote_map: HashMap<String, u64> = serde_json::from_slice(&remote_ledger).unwrap();
    assert_eq!(local_map.len(), 1);
    assert_eq!(remote_map.len(), 1);
    assert_eq!(
        local_map.values().next().unwrap(),
        remote_map.values().next().unwrap()
    );
}

#[tokio::test]
async fn second_pass_is_idempotent() {
    let (local, remote) = notebook_pair().await;
    local
        .insert_file("data/nb1/doc-1.md", b"one", 100_000)
        .await;
    remote
        .insert_file("data/nb1/doc-2.md", b"two", 200_000)
        .await;

    let (lh, rh) = handles(&local, &remote);
    let first = engine()
        .run(lh.clone(), rh.clone(), &SessionLog::new())
        .await
        .unwrap();
    assert_eq!(first.mutation_count(), 2);

    let second = engine().run(lh, rh, &SessionLog::new()).await.unwrap();
    assert_eq!(second.mutation_count(), 0, "second pass must be a no-op");
    assert_eq!(second.conflicts, 0);
}

#[tokio::test]
async fn tombstone_deletes_file_seen_at_last_sync() {
    let (local, remote) = notebook_pair().await;
    // The file existed on both sides as of the mutual sync at t=200, then
    // was deleted locally. Only the remote copy (mtime 100 < 200) is left.
    remote
        .insert_file("data/nb1/doc-1.md", b"stale", 100_000)
        .await;
    seed_identity(&local, "id-local", &[("id-remote", 200)]).await;
    seed_identity(&remote, "id-remote", &[("id-local", 200)]).await;

    let (lh, rh) = handles(&local, &remote);
    let report = engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert_eq!(report.deleted_on_remote, 1);
    assert_eq!(report.copied_to_local, 0);
    assert!(remote.file("data/nb1/doc-1.md").await.is_none());
}

#[tokio::test]
async fn tombstone_is_cancelled_by_third_party_sync() {
    let (local, remote) = notebook_pair().await;
    remote
        .insert_file("data/nb1/doc-1.md", b"reintroduced", 100_000)
        .await;
    // Same shape as above, but the remote later synced with a third
    // replica (t=300), which may have reintroduced the content.
    seed_identity(&local, "id-local", &[("id-remote", 200)]).await;
    seed_identity(
        &remote,
        "id-remote",
        &[("id-local", 200), ("id-third", 300)],
    )
    .await;

    let (lh, rh) = handles(&local, &remote);
    let report = engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert_eq!(report.deleted_on_remote, 0, "must not destroy user data");
    assert_eq!(report.copied_to_local, 1);
    let recreated = local.file("data/nb1/doc-1.md").await.expect("not recreated");
    assert_eq!(recreated.bytes, b"reintroduced");
}

#[tokio::test]
async fn conflict_materializes_exactly_one_sibling() {
    let (local, remote) = notebook_pair().await;
    // Both sides edited doc-1 after their mutual sync at t=1000.
    local
        .insert_file("data/nb1/doc-1.md", b"local words", 2_000_000)
        .await;
    remote
        .insert_file("data/nb1/doc-1.md", b"remote words", 3_000_000)
        .await;
    seed_identity(&local, "id-local", &[("id-remote", 1_000)]).await;
    seed_identity(&remote, "id-remote", &[("id-local", 1_000)]).await;

    let (lh, rh) = handles(&local, &remote);
    let report = engine().run(lh, rh, &SessionLog::new()).await.unwrap();
    assert_eq!(report.conflicts, 1);

    // Newer content won the original path on both replicas.
    for store in [&local, &remote] {
        let winner = store.file("data/nb1/doc-1.md").await.unwrap();
        assert_eq!(winner.bytes, b"remote words");
        assert_eq!(winner.modified_at_ms, 3_000_000);
    }

    // Exactly one new sibling document holds the older content.
    let created = local.created_documents().await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].notebook_id, "nb1");
    let canonical = &created[0].canonical_path;
    for store in [&local, &remote] {
        let copy = store.file(canonical).await.expect("conflict copy missing");
        assert_eq!(copy.bytes, b"local words");
        assert_eq!(copy.modified_at_ms, 2_000_000);
        let renames = store.renamed_documents().await;
        assert_eq!(renames.len(), 1);
        // The loser's stamp: 2000 s = 1970-01-01 00:33:20 UTC.
        assert_eq!(renames[0].1, "doc-1 - Conflict 1970-01-01 00:33:20");
    }
}

#[tokio::test]
async fn identical_content_never_conflicts() {
    let (local, remote) = notebook_pair().await;
    local
        .insert_file("data/nb1/doc-1.md", b"same words", 2_000_000)
        .await;
    remote
        .insert_file("data/nb1/doc-1.md", b"same words", 3_000_000)
        .await;
    seed_identity(&local, "id-local", &[("id-remote", 1_000)]).await;
    seed_identity(&remote, "id-remote", &[("id-local", 1_000)]).await;

    let (lh, rh) = handles(&local, &remote);
    let report = engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert_eq!(report.conflicts, 0);
    assert!(local.created_documents().await.is_empty());
    // The newer stamp still propagates so the pair converges.
    let settled = local.file("data/nb1/doc-1.md").await.unwrap();
    assert_eq!(settled.modified_at_ms, 3_000_000);
}

#[tokio::test]
async fn fresh_lock_fails_the_pass() {
    let (local, remote) = notebook_pair().await;
    let one_minute_ago = (now_secs() - 60) * 1000;
    remote.insert_file(LOCK_FILE, b"", one_minute_ago).await;

    let (lh, rh) = handles(&local, &remote);
    let err = engine().run(lh, rh, &SessionLog::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::LockContention { .. }));
    // Nothing was locked on the local side.
    assert!(local.file(LOCK_FILE).await.is_none());
}

#[tokio::test]
async fn stale_lock_is_overridden_and_released() {
    let (local, remote) = notebook_pair().await;
    let six_minutes_ago = (now_secs() - 6 * 60) * 1000;
    remote.insert_file(LOCK_FILE, b"", six_minutes_ago).await;

    let (lh, rh) = handles(&local, &remote);
    engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    // Locks are gone after the pass, stale one included.
    assert!(local.file(LOCK_FILE).await.is_none());
    assert!(remote.file(LOCK_FILE).await.is_none());
}

#[tokio::test]
async fn unused_assets_are_excluded_from_the_asset_pass() {
    let (local, remote) = notebook_pair().await;
    local
        .insert_file("data/assets/kept.png", b"kept", 100_000)
        .await;
    local
        .insert_file("data/assets/orphan.png", b"orphan", 100_000)
        .await;
    remote
        .set_unused_assets(vec!["data/assets/orphan.png".into()])
        .await;

    let (lh, rh) = handles(&local, &remote);
    engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert!(remote.file("data/assets/kept.png").await.is_some());
    assert!(remote.file("data/assets/orphan.png").await.is_none());
}

#[tokio::test]
async fn never_delete_directories_only_gain_content() {
    let (local, remote) = notebook_pair().await;
    // Mutually synced at t=200; the emoji (mtime 100) is gone locally, so
    // it looks like a deletion, but the target policy forbids pruning.
    remote
        .insert_file("data/emojis/party.png", b"emoji", 100_000)
        .await;
    seed_identity(&local, "id-local", &[("id-remote", 200)]).await;
    seed_identity(&remote, "id-remote", &[("id-local", 200)]).await;

    let (lh, rh) = handles(&local, &remote);
    let report = engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert_eq!(report.deleted_on_remote, 0);
    assert!(remote.file("data/emojis/party.png").await.is_some());
}

#[tokio::test]
async fn template_pruning_spares_plain_files() {
    let (local, remote) = notebook_pair().await;
    // Both the stale folder and the file look deleted locally (mtime 100,
    // mutual sync at 200), but templates only ever prune folders.
    remote.add_directory("data/templates/old", 100).await;
    remote
        .insert_file("data/templates/daily.md", b"daily", 100_000)
        .await;
    seed_identity(&local, "id-local", &[("id-remote", 200)]).await;
    seed_identity(&remote, "id-remote", &[("id-local", 200)]).await;

    let (lh, rh) = handles(&local, &remote);
    let report = engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert!(!remote.has_directory("data/templates/old").await);
    assert!(remote.file("data/templates/daily.md").await.is_some());
    assert_eq!(report.deleted_on_remote, 1);
    assert_eq!(report.copied_to_local, 0);
}

#[tokio::test]
async fn create_only_directories_never_overwrite() {
    let (local, remote) = notebook_pair().await;
    local
        .insert_file("conf/appearance/theme.css", b"local theme", 100_000)
        .await;
    remote
        .insert_file("conf/appearance/theme.css", b"remote theme", 900_000)
        .await;
    remote
        .insert_file("conf/appearance/icons.css", b"icons", 200_000)
        .await;

    let (lh, rh) = handles(&local, &remote);
    engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    // Present on both sides: left alone despite the newer remote stamp.
    let kept = local.file("conf/appearance/theme.css").await.unwrap();
    assert_eq!(kept.bytes, b"local theme");
    // Present on one side only: still created on the other.
    let created = local.file("conf/appearance/icons.css").await.unwrap();
    assert_eq!(created.bytes, b"icons");
}

#[tokio::test]
async fn snapshots_gate_on_the_configured_interval() {
    let (local, remote) = notebook_pair().await;
    let config = EngineConfig {
        snapshot_interval: Some(Duration::from_secs(3600)),
    };

    // Never synced: both replicas checkpoint before the first pass.
    let (lh, rh) = handles(&local, &remote);
    ReconciliationEngine::new(config.clone())
        .run(lh.clone(), rh.clone(), &SessionLog::new())
        .await
        .unwrap();
    assert_eq!(local.snapshot_count().await, 1);
    assert_eq!(remote.snapshot_count().await, 1);

    // Freshly synced: a pass inside the interval skips the checkpoint.
    ReconciliationEngine::new(config)
        .run(lh, rh, &SessionLog::new())
        .await
        .unwrap();
    assert_eq!(local.snapshot_count().await, 1);
    assert_eq!(remote.snapshot_count().await, 1);
}

#[tokio::test]
async fn storage_changes_trigger_full_reload() {
    let (local, remote) = notebook_pair().await;
    remote
        .insert_file("data/storage/query-index.json", b"{}", 100_000)
        .await;

    let (lh, rh) = handles(&local, &remote);
    engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    // The structured-data store changed locally: one full reload, no
    // per-document reloads.
    assert_eq!(local.workspace_reload_count().await, 1);
    assert!(local.reloaded_documents().await.is_empty());
    assert_eq!(remote.workspace_reload_count().await, 0);
}

#[tokio::test]
async fn document_changes_reload_open_editors() {
    let (local, remote) = notebook_pair().await;
    remote
        .insert_file("data/nb1/doc-1.md", b"note", 100_000)
        .await;

    let (lh, rh) = handles(&local, &remote);
    engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert_eq!(
        local.reloaded_documents().await,
        vec!["data/nb1/doc-1.md".to_string()]
    );
    assert_eq!(local.workspace_reload_count().await, 0);
    // Both file trees refresh at the end of every pass.
    assert_eq!(local.tree_refresh_count().await, 1);
    assert_eq!(remote.tree_refresh_count().await, 1);
}

#[tokio::test]
async fn moved_document_follows_newer_ancestor() {
    let (local, remote) = notebook_pair().await;
    // Same document, same stamp, different folders. The local folder was
    // touched more recently, so the local placement is authoritative.
    local.add_directory("data/nb1/projects", 500).await;
    local
        .insert_file("data/nb1/projects/doc-5.md", b"body", 300_000)
        .await;
    remote.add_directory("data/nb1/archive", 400).await;
    remote
        .insert_file("data/nb1/archive/doc-5.md", b"body", 300_000)
        .await;

    let (lh, rh) = handles(&local, &remote);
    let report = engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    assert!(remote.file("data/nb1/projects/doc-5.md").await.is_some());
    assert!(remote.file("data/nb1/archive/doc-5.md").await.is_none());
    assert!(local.file("data/nb1/projects/doc-5.md").await.is_some());
    assert_eq!(report.copied_to_remote, 1);
    assert_eq!(report.deleted_on_remote, 1);
}

#[tokio::test]
async fn worked_example_single_new_file() {
    // Local has notes/A.md (t=100), remote has nothing, ledgers empty:
    // one copy with timestamp 100,000 ms, no deletion, no conflict.
    let local_store = Arc::new(MemoryNoteStore::new());
    let remote_store = Arc::new(MemoryNoteStore::new());
    local_store.insert_file("notes/A.md", b"alpha", 100_000).await;

    let local = Replica::connect(ReplicaHandle::new("local", local_store.clone()))
        .await
        .unwrap();
    let remote = Replica::connect(ReplicaHandle::new("remote", remote_store.clone()))
        .await
        .unwrap();

    let target = SyncTarget {
        root_path: "notes".into(),
        excluded_names: Vec::new(),
        notebook_id: None,
        options: Default::default(),
    };
    let report = engine()
        .reconcile_target(&target, &local, &remote, &SessionLog::new())
        .await;

    assert_eq!(report.copied_to_remote, 1);
    assert_eq!(report.deleted_on_local + report.deleted_on_remote, 0);
    assert_eq!(report.conflicts, 0);
    let copied = remote_store.file("notes/A.md").await.unwrap();
    assert_eq!(copied.bytes, b"alpha");
    assert_eq!(copied.modified_at_ms, 100_000);
}

#[tokio::test]
async fn session_log_lands_on_the_local_replica() {
    let (local, remote) = notebook_pair().await;
    let (lh, rh) = handles(&local, &remote);
    engine().run(lh, rh, &SessionLog::new()).await.unwrap();

    let logs: Vec<_> = local
        .file_paths()
        .await
        .into_iter()
        .filter(|p| p.starts_with(".notesync/logs/"))
        .collect();
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn validation_rejects_malformed_pairs_before_io() {
    let bad = notesync::ReplicaConfig {
        address: String::new(),
        credential: "tok".into(),
        display_name: "local".into(),
    };
    let good = notesync::ReplicaConfig {
        address: "https://peer.example".into(),
        credential: "tok".into(),
        display_name: "remote".into(),
    };
    let err = engine()
        .run_http(&bad, &good, &SessionLog::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}
