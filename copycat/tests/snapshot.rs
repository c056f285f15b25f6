use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use copycat::Config;
use copycat::SnapshotPolicy;
use fixtures::RaftRouter;
use kvstore::KvResponse;

mod fixtures;

const SNAPSHOT_THRESHOLD: u64 = 50;

/// Snapshot installation test.
///
/// What does this test do?
///
/// - brings a single-node cluster online with a tight snapshot policy.
/// - writes enough commands to trigger a snapshot, which purges the log prefix.
/// - joins a second node whose earliest reachable index is now gone.
/// - asserts the joiner installs the snapshot, catches up, and serves reads at or beyond the
///   snapshot index.
///
/// RUST_LOG=copycat,kvstore,snapshot=trace cargo test -p copycat --test snapshot
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_member_installs_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let dir = tempfile::tempdir()?;
    let config = Arc::new(
        Config::build("test".into())
            .election_timeout(300)
            .heartbeat_interval(100)
            .storage_directory(dir.path().to_path_buf())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(SNAPSHOT_THRESHOLD))
            // Small segments so the snapshot actually purges sealed prefixes.
            .max_entries_per_segment(16)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));
    let id = router.new_raft_node(1).await;
    router.initialize(1, &[1]).await?;
    router
        .wait_for_metrics(
            &id,
            |m| m.state == copycat::State::Leader,
            Some(Duration::from_secs(3)),
            "n1 -> leader",
        )
        .await?;

    tracing::info!("--- writing past the snapshot threshold");
    let client = router.client(1, &[1]);
    client.connect().await?;
    for i in 0..SNAPSHOT_THRESHOLD + 10 {
        client.submit(fixtures::put(&format!("key{}", i), &format!("v{}", i))).await?;
    }

    let metrics = router
        .wait_for_metrics(
            &id,
            |m| m.snapshot.index > 0,
            Some(Duration::from_secs(5)),
            "n1 snapshot taken",
        )
        .await?;
    let snapshot_index = metrics.snapshot.index;

    // The snapshot superseded the log prefix.
    let store = router.get_storage_handle(&id).await?;
    assert!(
        copycat::storage::RaftStorage::try_get_log_entry(&*store, 1).await?.is_none(),
        "the log prefix covered by the snapshot must be purged"
    );

    tracing::info!("--- joining node 2 after the log has been purged");
    let id2 = router.new_raft_node(2).await;
    let leader_raft = router.get_raft_handle(&id).await?;
    leader_raft.add_member(fixtures::node_addr(2)).await?;

    // The joiner must install the snapshot: the entries it needs are gone.
    router
        .wait_for_metrics(
            &id2,
            |m| m.snapshot.index >= snapshot_index && m.last_applied >= snapshot_index,
            Some(Duration::from_secs(10)),
            "n2 installs the snapshot and catches up",
        )
        .await?;

    // The joiner's state machine holds the snapshot contents.
    let store2 = router.get_storage_handle(&id2).await?;
    let machine = copycat::storage::RaftStorageDebug::get_state_machine(&*store2).await;
    assert_eq!(machine.get("key0"), Some("v0"));

    tracing::info!("--- promoting node 2 and reading through the cluster");
    leader_raft.promote_member(fixtures::node_addr(2)).await?;
    router
        .wait_for_metrics(
            &id2,
            |m| m.state == copycat::State::Follower,
            Some(Duration::from_secs(5)),
            "n2 becomes a voting follower",
        )
        .await?;

    let read = client.query(fixtures::get("key5"), copycat::raft::ConsistencyLevel::Linearizable).await?;
    assert_eq!(read, KvResponse::Value(Some("v5".into())));

    client.close().await;
    Ok(())
}
