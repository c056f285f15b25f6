use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use copycat::error::ChangeConfigError;
use fixtures::RaftRouter;
use maplit::btreeset;

mod fixtures;

/// Cluster membership change test.
///
/// What does this test do?
///
/// - brings a three-node cluster online.
/// - joins a fourth node, which catches up as a passive replica.
/// - promotes it to a voting member, demotes it back, and finally removes it.
/// - asserts the no-op and duplicate change rules along the way.
///
/// RUST_LOG=copycat,kvstore,membership=trace cargo test -p copycat --test membership
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn join_promote_demote_leave() -> Result<()> {
    fixtures::init_tracing();

    let dir = tempfile::tempdir()?;
    let config = fixtures::test_config(dir.path());
    let router = Arc::new(RaftRouter::new(config.clone()));
    for n in 1..=3 {
        router.new_raft_node(n).await;
    }
    for n in 1..=3 {
        router.initialize(n, &[1, 2, 3]).await?;
    }
    let leader = router.wait_for_leader(Duration::from_secs(3), "initial election").await?;
    let leader_raft = router.get_raft_handle(&leader).await?;

    tracing::info!("--- seeding some state");
    let client = router.client(1, &[1, 2, 3]);
    client.connect().await?;
    client.submit(fixtures::put("seed", "1")).await?;

    tracing::info!("--- joining node 4 as a passive member");
    let id4 = router.new_raft_node(4).await;
    leader_raft.add_member(fixtures::node_addr(4)).await?;

    // Joining twice is a no-op.
    match leader_raft.add_member(fixtures::node_addr(4)).await {
        Err(ChangeConfigError::Noop) => {}
        other => panic!("expected Noop rejection, got {:?}", other),
    }

    // The new member catches up as a passive replica.
    router
        .wait_for_metrics(
            &id4,
            |m| m.membership_config.passive.contains_key(&fixtures::node_id(4)) && m.last_applied >= 1,
            Some(Duration::from_secs(5)),
            "n4 catches up as passive",
        )
        .await?;
    let m4 = router.metrics_of(&id4).await?;
    assert_eq!(m4.state, copycat::State::Passive);

    // Promoting a member that is not passive is refused.
    match leader_raft.promote_member(fixtures::node_addr(5)).await {
        Err(ChangeConfigError::MemberStateMismatch) => {}
        other => panic!("expected MemberStateMismatch rejection, got {:?}", other),
    }

    tracing::info!("--- promoting node 4");
    leader_raft.promote_member(fixtures::node_addr(4)).await?;
    let want: BTreeSet<_> = btreeset![1u16, 2, 3, 4].into_iter().map(fixtures::node_id).collect();
    router
        .wait_for_metrics(
            &id4,
            |m| {
                m.membership_config.active.keys().copied().collect::<BTreeSet<_>>() == want
                    && m.state == copycat::State::Follower
            },
            Some(Duration::from_secs(5)),
            "n4 becomes a voting follower",
        )
        .await?;

    tracing::info!("--- a command commits across the four-member cluster");
    client.submit(fixtures::put("post-promote", "1")).await?;
    let leader_applied = router.metrics_of(&leader).await?.last_applied;
    router
        .wait_for_log(&btreeset![id4], leader_applied, Some(Duration::from_secs(5)), "n4 applies the new command")
        .await?;

    tracing::info!("--- demoting node 4 back to passive");
    leader_raft.demote_member(fixtures::node_addr(4)).await?;
    router
        .wait_for_metrics(
            &id4,
            |m| m.membership_config.passive.contains_key(&fixtures::node_id(4)),
            Some(Duration::from_secs(5)),
            "n4 demoted",
        )
        .await?;

    tracing::info!("--- removing node 4");
    leader_raft.remove_member(fixtures::node_addr(4)).await?;
    router
        .wait_for_metrics(
            &leader,
            |m| !m.membership_config.contains(&fixtures::node_id(4)),
            Some(Duration::from_secs(5)),
            "n4 removed from the cluster",
        )
        .await?;

    client.close().await;
    Ok(())
}
