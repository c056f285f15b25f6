//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use copycat::client::RaftClient;
use copycat::client::SessionNetwork;
use copycat::metrics::RaftMetrics;
use copycat::raft::Address;
use copycat::raft::AppendEntriesRequest;
use copycat::raft::AppendEntriesResponse;
use copycat::raft::CommandRequest;
use copycat::raft::CommandResponse;
use copycat::raft::InstallSnapshotRequest;
use copycat::raft::InstallSnapshotResponse;
use copycat::raft::KeepAliveRequest;
use copycat::raft::KeepAliveResponse;
use copycat::raft::PollRequest;
use copycat::raft::PollResponse;
use copycat::raft::QueryRequest;
use copycat::raft::QueryResponse;
use copycat::raft::Raft;
use copycat::raft::RegisterRequest;
use copycat::raft::RegisterResponse;
use copycat::raft::VoteRequest;
use copycat::raft::VoteResponse;
use copycat::Config;
use copycat::NodeId;
use copycat::RaftError;
use copycat::RaftNetwork;
use copycat::State;
use kvstore::KvRequest;
use kvstore::KvResponse;
use kvstore::KvStore;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type KvRaft = Raft<KvRequest, KvResponse, RaftRouter, KvStore>;
/// A concrete session client type used during testing.
pub type KvClient = RaftClient<KvRequest, KvResponse, RaftRouter>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// The address of test node `n`.
pub fn node_addr(n: u16) -> Address {
    Address::new("127.0.0.1", 5000 + n)
}

/// The stable ID of test node `n`.
pub fn node_id(n: u16) -> NodeId {
    node_addr(n).id()
}

/// A test config with tight timings and storage under the given directory.
pub fn test_config(dir: &std::path::Path) -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout(300)
            .heartbeat_interval(100)
            .storage_directory(dir.to_path_buf())
            .validate()
            .expect("failed to build Raft config"),
    )
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (KvRaft, Arc<KvStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new Raft node bearing the given ordinal.
    pub async fn new_raft_node(self: &Arc<Self>, n: u16) -> NodeId {
        let id = node_id(n);
        let store = Arc::new(KvStore::new(id, &self.config).expect("failed to open store"));
        self.new_raft_node_with_sto(id, store).await;
        id
    }

    pub async fn new_raft_node_with_sto(self: &Arc<Self>, id: NodeId, sto: Arc<KvStore>) {
        let node = Raft::new(id, self.config.clone(), self.clone(), sto.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, sto));
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: NodeId) -> Option<(KvRaft, Arc<KvStore>)> {
        let mut rt = self.routing_table.write().await;
        let opt_handles = rt.remove(&id);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);

        opt_handles
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        let mut nodes = self.isolated_nodes.write().await;
        nodes.remove(&id);
    }

    /// Initialize the node of the given ordinal with a cluster of the given ordinals.
    pub async fn initialize(&self, n: u16, members: &[u16]) -> Result<()> {
        let addrs: Vec<Address> = members.iter().copied().map(node_addr).collect();
        let rt = self.routing_table.read().await;
        let (node, _) = rt.get(&node_id(n)).ok_or_else(|| anyhow!("node {} not found", n))?;
        node.initialize(addrs).await?;
        Ok(())
    }

    /// Get a handle to the Raft node of the given ID.
    pub async fn get_raft_handle(&self, id: &NodeId) -> Result<KvRaft> {
        let rt = self.routing_table.read().await;
        let (node, _) = rt.get(id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(node.clone())
    }

    /// Get a handle to the storage backing the specified node.
    pub async fn get_storage_handle(&self, id: &NodeId) -> Result<Arc<KvStore>> {
        let rt = self.routing_table.read().await;
        let (_, sto) = rt.get(id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(sto.clone())
    }

    /// Build a session client seeded with the given node ordinals.
    pub fn client(self: &Arc<Self>, client_port: u16, seed: &[u16]) -> KvClient {
        let members: Vec<NodeId> = seed.iter().copied().map(node_id).collect();
        RaftClient::new(
            self.clone(),
            Address::new("127.0.0.1", 9000 + client_port),
            members,
            Duration::from_millis(self.config.heartbeat_interval),
        )
    }

    /// Wait for metrics on the target node to satisfy the given condition.
    pub async fn wait_for_metrics<T: Fn(&RaftMetrics) -> bool + Send>(
        &self,
        id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics> {
        let node = self.get_raft_handle(id).await?;
        let metrics = node.wait(timeout).metrics(func, msg).await?;
        Ok(metrics)
    }

    /// Wait for the given nodes to have applied at least the given log index.
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            let node = self.get_raft_handle(id).await?;
            node.wait(timeout).log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to reach the given state.
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            let node = self.get_raft_handle(id).await?;
            node.wait(timeout).state(want_state, msg).await?;
        }
        Ok(())
    }

    /// The set of node IDs currently reporting themselves leader.
    pub async fn leaders(&self) -> Vec<NodeId> {
        let rt = self.routing_table.read().await;
        let mut leaders = Vec::new();
        for (id, (node, _)) in rt.iter() {
            let metrics = node.metrics().borrow().clone();
            if metrics.state == State::Leader {
                leaders.push(*id);
            }
        }
        leaders
    }

    /// Wait until exactly one non-isolated node reports itself leader, returning its ID.
    pub async fn wait_for_leader(&self, within: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let isolated = self.isolated_nodes.read().await.clone();
            let leaders: Vec<_> = self.leaders().await.into_iter().filter(|id| !isolated.contains(id)).collect();
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("{}: expected one leader, found {:?}", msg, leaders));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// The latest metrics of the given node.
    pub async fn metrics_of(&self, id: &NodeId) -> Result<RaftMetrics> {
        let node = self.get_raft_handle(id).await?;
        Ok(node.metrics().borrow().clone())
    }

    async fn refuse_isolated(&self, target: NodeId, sender: NodeId) -> Result<()> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&sender) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(())
    }

    async fn target_raft(&self, target: NodeId) -> Result<KvRaft> {
        let rt = self.routing_table.read().await;
        let (node, _) = rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?;
        Ok(node.clone())
    }

    async fn session_target(&self, target: NodeId) -> Result<KvRaft, RaftError> {
        {
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&target) {
                return Err(RaftError::RaftNetwork(anyhow!("target node is isolated")));
            }
        }
        self.target_raft(target).await.map_err(RaftError::RaftNetwork)
    }
}

#[async_trait]
impl RaftNetwork<KvRequest> for RaftRouter {
    /// Send an AppendEntries RPC to the target Raft node.
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<KvRequest>,
    ) -> Result<AppendEntriesResponse> {
        self.refuse_isolated(target, rpc.leader_id).await?;
        let node = self.target_raft(target).await?;
        Ok(node.append_entries(rpc).await?)
    }

    /// Send a RequestVote RPC to the target Raft node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.refuse_isolated(target, rpc.candidate_id).await?;
        let node = self.target_raft(target).await?;
        Ok(node.vote(rpc).await?)
    }

    /// Send a Poll RPC to the target Raft node.
    async fn send_poll(&self, target: NodeId, rpc: PollRequest) -> Result<PollResponse> {
        self.refuse_isolated(target, rpc.candidate_id).await?;
        let node = self.target_raft(target).await?;
        Ok(node.poll(rpc).await?)
    }

    /// Send an InstallSnapshot RPC to the target Raft node.
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.refuse_isolated(target, rpc.leader_id).await?;
        let node = self.target_raft(target).await?;
        Ok(node.install_snapshot(rpc).await?)
    }
}

#[async_trait]
impl SessionNetwork<KvRequest, KvResponse> for RaftRouter {
    async fn register(&self, target: NodeId, rpc: RegisterRequest) -> Result<RegisterResponse, RaftError> {
        self.session_target(target).await?.client_register(rpc).await
    }

    async fn keep_alive(&self, target: NodeId, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, RaftError> {
        self.session_target(target).await?.client_keep_alive(rpc).await
    }

    async fn command(
        &self,
        target: NodeId,
        rpc: CommandRequest<KvRequest>,
    ) -> Result<CommandResponse<KvResponse>, RaftError> {
        self.session_target(target).await?.client_command(rpc).await
    }

    async fn query(
        &self,
        target: NodeId,
        rpc: QueryRequest<KvRequest>,
    ) -> Result<QueryResponse<KvResponse>, RaftError> {
        self.session_target(target).await?.client_query(rpc).await
    }
}

/// A `Put` request.
pub fn put(key: &str, value: &str) -> KvRequest {
    KvRequest::Put {
        key: key.into(),
        value: value.into(),
        ttl: None,
    }
}

/// A `Put` request with a TTL in milliseconds.
pub fn put_ttl(key: &str, value: &str, ttl: u64) -> KvRequest {
    KvRequest::Put {
        key: key.into(),
        value: value.into(),
        ttl: Some(ttl),
    }
}

/// A `Get` request.
pub fn get(key: &str) -> KvRequest {
    KvRequest::Get { key: key.into() }
}
