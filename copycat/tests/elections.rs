use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use kvstore::KvResponse;

mod fixtures;

/// Three-node leader election test.
///
/// What does this test do?
///
/// - brings three nodes online and initializes them simultaneously with the same member list.
/// - asserts that within 3x the election timeout exactly one leader exists with term >= 1.
/// - isolates the leader and asserts a new leader is elected with term >= 2.
/// - asserts a fresh command still commits against the reduced cluster.
///
/// RUST_LOG=copycat,kvstore,elections=trace cargo test -p copycat --test elections
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn three_node_election_and_leader_failure() -> Result<()> {
    fixtures::init_tracing();

    let dir = tempfile::tempdir()?;
    let config = fixtures::test_config(dir.path());
    let router = Arc::new(RaftRouter::new(config.clone()));

    for n in 1..=3 {
        router.new_raft_node(n).await;
    }

    tracing::info!("--- initializing all three nodes simultaneously");
    let (r1, r2, r3) = tokio::join!(
        router.initialize(1, &[1, 2, 3]),
        router.initialize(2, &[1, 2, 3]),
        router.initialize(3, &[1, 2, 3]),
    );
    r1?;
    r2?;
    r3?;

    let within = Duration::from_millis(config.election_timeout * 3);
    let leader = router.wait_for_leader(within, "initial election").await?;
    let leader_metrics = router.metrics_of(&leader).await?;
    assert!(leader_metrics.current_term >= 1);

    // Followers learn of the leader as heartbeats land.
    let followers: Vec<_> = (1..=3).map(fixtures::node_id).filter(|id| *id != leader).collect();
    for id in &followers {
        router
            .wait_for_metrics(
                id,
                |m| m.current_leader == Some(leader),
                Some(Duration::from_secs(3)),
                "follower discovers leader",
            )
            .await?;
    }

    tracing::info!("--- writing a command against the initial leader");
    let client = router.client(1, &[1, 2, 3]);
    client.connect().await?;
    client.submit(fixtures::put("stable", "yes")).await?;

    tracing::info!("--- isolating the leader");
    router.isolate_node(leader).await;

    let new_leader = router.wait_for_leader(Duration::from_millis(config.election_timeout * 3 + 2000), "re-election").await?;
    assert_ne!(new_leader, leader, "a different node must take over");

    let metrics = router.metrics_of(&new_leader).await?;
    assert!(metrics.current_term >= 2, "the new leader's term must have advanced, got {}", metrics.current_term);

    tracing::info!("--- committing a command against the new leader");
    let res = client.submit(fixtures::put("x", "1")).await?;
    assert_eq!(res, KvResponse::Value(None));

    let read = client.query(fixtures::get("x"), copycat::raft::ConsistencyLevel::Linearizable).await?;
    assert_eq!(read, KvResponse::Value(Some("1".into())));

    client.close().await;
    Ok(())
}
