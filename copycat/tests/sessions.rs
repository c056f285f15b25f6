use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use copycat::raft::Address;
use copycat::raft::CommandRequest;
use copycat::raft::KeepAliveRequest;
use copycat::raft::RegisterRequest;
use copycat::RaftError;
use fixtures::RaftRouter;
use kvstore::KvResponse;

mod fixtures;

/// Session at-most-once semantics test.
///
/// What does this test do?
///
/// - brings a three-node cluster online and registers a session.
/// - submits a command with an explicit request sequence and records the response.
/// - resubmits the identical request and asserts the cached response is replayed without the
///   state machine being re-applied.
///
/// RUST_LOG=copycat,kvstore,sessions=trace cargo test -p copycat --test sessions
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn duplicate_command_replays_cached_response() -> Result<()> {
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

    tracing::info!("--- registering a session directly against the leader");
    let reg = leader_raft
        .client_register(RegisterRequest {
            address: Address::new("127.0.0.1", 9100),
        })
        .await?;
    let session = reg.session;

    tracing::info!("--- submitting a command with request sequence 7");
    let rpc = CommandRequest {
        session,
        request: 7,
        response: 0,
        command: fixtures::put("counter", "1"),
    };
    let first = leader_raft.client_command(rpc.clone()).await?;
    assert_eq!(first.data, KvResponse::Value(None));

    tracing::info!("--- resubmitting the identical command");
    let second = leader_raft.client_command(rpc).await?;
    // The cached response is replayed; a re-application would have returned the displaced
    // value `Some("1")`.
    assert_eq!(second.data, KvResponse::Value(None));

    let read = leader_raft
        .client_query(copycat::raft::QueryRequest {
            session,
            query: fixtures::get("counter"),
            consistency: copycat::raft::ConsistencyLevel::Linearizable,
        })
        .await?;
    assert_eq!(read.data, KvResponse::Value(Some("1".into())));

    Ok(())
}

/// Session expiry test.
///
/// What does this test do?
///
/// - registers a session and lets it go stale past the session timeout.
/// - registers a second session, whose entry timestamp drives deterministic expiry.
/// - asserts a command against the stale session is refused with an unknown-session error.
///
/// RUST_LOG=copycat,kvstore,sessions=trace cargo test -p copycat --test sessions
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_session_expires() -> Result<()> {
    fixtures::init_tracing();

    let dir = tempfile::tempdir()?;
    let config = fixtures::test_config(dir.path());
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
    let raft = router.get_raft_handle(&id).await?;

    let stale = raft
        .client_register(RegisterRequest {
            address: Address::new("127.0.0.1", 9101),
        })
        .await?
        .session;

    // Let the session go stale; expiry is judged on entry timestamps, so it only takes
    // effect once a later registration or keep-alive carries time forward.
    tokio::time::sleep(Duration::from_millis(config.session_timeout + 300)).await;

    let fresh = raft
        .client_register(RegisterRequest {
            address: Address::new("127.0.0.1", 9102),
        })
        .await?
        .session;
    assert_ne!(stale, fresh);

    let res = raft
        .client_command(CommandRequest {
            session: stale,
            request: 1,
            response: 0,
            command: fixtures::put("k", "v"),
        })
        .await;
    match res {
        Err(RaftError::UnknownSession(session)) => assert_eq!(session, stale),
        other => panic!("expected unknown session error, got {:?}", other.map(|r| r.data)),
    }

    Ok(())
}

/// Session keep-alive test.
///
/// What does this test do?
///
/// - registers a session and keeps it alive with periodic keep-alives well past the session
///   timeout.
/// - registers a second session to drive expiry, then asserts the kept-alive session still
///   accepts commands.
///
/// RUST_LOG=copycat,kvstore,sessions=trace cargo test -p copycat --test sessions
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keep_alive_preserves_session() -> Result<()> {
    fixtures::init_tracing();

    let dir = tempfile::tempdir()?;
    let config = fixtures::test_config(dir.path());
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
    let raft = router.get_raft_handle(&id).await?;

    let session = raft
        .client_register(RegisterRequest {
            address: Address::new("127.0.0.1", 9103),
        })
        .await?
        .session;

    // Keep the session alive across two full session-timeout windows.
    for _ in 0..2 * (config.session_timeout / 200 + 1) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        raft.client_keep_alive(KeepAliveRequest { session }).await?;
    }

    // A fresh registration drives expiry of anything stale; our session is not.
    raft.client_register(RegisterRequest {
        address: Address::new("127.0.0.1", 9104),
    })
    .await?;

    let res = raft
        .client_command(CommandRequest {
            session,
            request: 1,
            response: 0,
            command: fixtures::put("k", "v"),
        })
        .await?;
    assert_eq!(res.data, KvResponse::Value(None));

    Ok(())
}
