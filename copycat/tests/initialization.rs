use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use copycat::raft::Address;
use copycat::raft::CommandRequest;
use copycat::raft::ConsistencyLevel;
use copycat::raft::QueryRequest;
use copycat::raft::RegisterRequest;
use fixtures::RaftRouter;
use kvstore::KvResponse;

mod fixtures;

/// Single-node cluster initialization test.
///
/// What does this test do?
///
/// - brings one node online and initializes it as a single-node cluster.
/// - asserts it elects itself leader and commits its initial no-op at index 1.
/// - registers a session at index 2, submits a command at index 3, and reads the value back at
///   every consistency level.
///
/// RUST_LOG=copycat,kvstore,initialization=trace cargo test -p copycat --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_cluster() -> Result<()> {
    fixtures::init_tracing();

    let dir = tempfile::tempdir()?;
    let config = fixtures::test_config(dir.path());
    let router = Arc::new(RaftRouter::new(config.clone()));

    let id = router.new_raft_node(1).await;

    tracing::info!("--- initializing single node cluster");
    router.initialize(1, &[1]).await?;

    // The node elects itself and commits the initial no-op at index 1.
    router
        .wait_for_metrics(
            &id,
            |m| m.state == copycat::State::Leader && m.last_applied >= 1 && m.current_term >= 1,
            Some(Duration::from_secs(3)),
            "n1 -> leader with no-op applied",
        )
        .await?;

    tracing::info!("--- registering a session and submitting a command");
    let raft = router.get_raft_handle(&id).await?;
    let reg = raft
        .client_register(RegisterRequest {
            address: Address::new("127.0.0.1", 9001),
        })
        .await?;
    // The session is created by the register entry directly after the no-op.
    assert_eq!(reg.session, 2);

    let res = raft
        .client_command(CommandRequest {
            session: reg.session,
            request: 1,
            response: 0,
            command: fixtures::put("foo", "bar"),
        })
        .await?;
    assert_eq!(res.data, KvResponse::Value(None));
    assert_eq!(res.index, 3);

    // Log: no-op @1, session registration @2, command @3; all committed synchronously.
    let metrics = router.metrics_of(&id).await?;
    assert_eq!(metrics.last_log_index, 3);
    assert!(metrics.last_applied >= 3);

    tracing::info!("--- reading the value back at every consistency level");
    for consistency in [
        ConsistencyLevel::Serializable,
        ConsistencyLevel::LinearizableLease,
        ConsistencyLevel::Linearizable,
    ] {
        let read = raft
            .client_query(QueryRequest {
                session: reg.session,
                query: fixtures::get("foo"),
                consistency,
            })
            .await?;
        assert_eq!(read.data, KvResponse::Value(Some("bar".into())), "consistency {:?}", consistency);
    }

    tracing::info!("--- the session client sees the same state");
    let client = router.client(1, &[1]);
    client.connect().await?;
    let res = client.submit(fixtures::put("foo", "baz")).await?;
    // Overwriting returns the displaced value.
    assert_eq!(res, KvResponse::Value(Some("bar".into())));

    let read = client.query(fixtures::get("foo"), ConsistencyLevel::Linearizable).await?;
    assert_eq!(read, KvResponse::Value(Some("baz".into())));

    client.close().await;
    Ok(())
}
