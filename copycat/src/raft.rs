//! Public Raft interface and data types.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Applications building on top of Raft will
/// use this to spawn a Raft task, feed it RPCs arriving from peers, and submit session-scoped
/// commands and queries against the replicated state machine.
///
/// For more information on the Raft protocol, see
/// [the specification here](https://raft.github.io/raft.pdf) (**pdf warning**).
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft node
/// is shutting down (potentially for data safety reasons due to a storage error), and the `shutdown`
/// method should be called on this type to await the shutdown of the node. If the parent
/// application needs to shutdown the Raft node for any reason, calling `shutdown` will do the trick.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster. It must
    /// be the stable hash of the node's address (see [`Address::id`]) so that peers derive the
    /// same ID from configuration entries.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for sending RPCs to
    /// peer nodes within the cluster.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait which will be used by Raft for data storage.
    #[tracing::instrument(level="trace", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        self.call(|tx| RaftMsg::AppendEntries { rpc, tx }).await
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        self.call(|tx| RaftMsg::RequestVote { rpc, tx }).await
    }

    /// Submit a Poll (pre-vote) RPC to this Raft node.
    ///
    /// These RPCs are sent by peers probing whether an election they are about to start could
    /// succeed, before disrupting the cluster by incrementing their term.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn poll(&self, rpc: PollRequest) -> Result<PollResponse, RaftError> {
        self.call(|tx| RaftMsg::Poll { rpc, tx }).await
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow node up-to-speed
    /// with the leader (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_id=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        self.call(|tx| RaftMsg::InstallSnapshot { rpc, tx }).await
    }

    /// Register a new client session with the cluster.
    ///
    /// The session ID returned is the log index of the `Register` entry which created it; it must
    /// accompany every subsequent command from the client, and must be kept alive with periodic
    /// keep-alives lest the state machine expire it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_register(&self, rpc: RegisterRequest) -> Result<RegisterResponse, RaftError> {
        self.call(|tx| RaftMsg::Register { rpc, tx }).await
    }

    /// Refresh a client session's liveness.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_keep_alive(&self, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, RaftError> {
        self.call(|tx| RaftMsg::KeepAlive { rpc, tx }).await
    }

    /// Submit a mutating client command to Raft to update the state of the system (§5.1).
    ///
    /// The command will be appended to the log, committed to the cluster, and then applied to the
    /// application state machine. The result of applying the command to the state machine will
    /// be returned as the response from this method.
    ///
    /// Commands carry `(session, request, response)` sequence numbers which give them at-most-once
    /// application semantics: if the state machine has already applied `(session, request)`, the
    /// cached response is returned without re-invoking the state machine (§8).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn client_command(&self, rpc: CommandRequest<D>) -> Result<CommandResponse<R>, RaftError> {
        self.call(|tx| RaftMsg::ClientCommand { rpc, tx }).await
    }

    /// Submit a read-only client query against the replicated state machine.
    ///
    /// The consistency level on the request governs how much coordination the leader performs
    /// before answering; see [`ConsistencyLevel`].
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_query(&self, rpc: QueryRequest<D>) -> Result<QueryResponse<R>, RaftError> {
        self.call(|tx| RaftMsg::ClientQuery { rpc, tx }).await
    }

    /// Initialize a pristine Raft node with the given cluster member list.
    ///
    /// This command should be called on pristine nodes — where the log index is 0 and the node is
    /// in Passive state — as if either of those constraints are false, it indicates that the
    /// cluster is already formed and in motion. If `InitializeError::NotAllowed` is returned
    /// from this function, it is safe to ignore, as it simply indicates that the cluster is
    /// already up and running, which is ultimately the goal of this function.
    ///
    /// Every member of the cluster should perform this action with the same member list. This
    /// routine is race-condition free, and Raft guarantees that the first node to become the
    /// cluster leader will propagate only its own config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: Vec<Address>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Initialize { members, tx }, tracing::debug_span!("CH")))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Add a new member to the cluster (§6).
    ///
    /// The new member joins as a passive (non-voting) replica: it receives appends and catches up
    /// with the leader, but does not vote. Call `promote_member` once it has caught up to make it
    /// a voting member.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_member(&self, address: Address) -> Result<u64, ChangeConfigError> {
        self.change_config(|tx| RaftMsg::Join { address, tx }).await
    }

    /// Remove a member from the cluster (§6).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_member(&self, address: Address) -> Result<u64, ChangeConfigError> {
        self.change_config(|tx| RaftMsg::Leave { address, tx }).await
    }

    /// Promote a passive member to a voting member (§6).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn promote_member(&self, address: Address) -> Result<u64, ChangeConfigError> {
        self.change_config(|tx| RaftMsg::Promote { address, tx }).await
    }

    /// Demote a voting member to a passive member (§6).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn demote_member(&self, address: Address) -> Result<u64, ChangeConfigError> {
        self.change_config(|tx| RaftMsg::Demote { address, tx }).await
    }

    async fn call<T, F>(&self, f: F) -> Result<T, RaftError>
    where F: FnOnce(oneshot::Sender<Result<T, RaftError>>) -> RaftMsg<D, R> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((f(tx), tracing::debug_span!("CH"))).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    async fn change_config<F>(&self, f: F) -> Result<u64, ChangeConfigError>
    where F: FnOnce(ChangeMembershipTx) -> RaftMsg<D, R> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((f(tx), tracing::debug_span!("CH")))
            .map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?;
        match rx.await {
            Ok(res) => res,
            Err(err) => {
                tracing::error!("recv rx error: {}", err);
                Err(ChangeConfigError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the Raft metrics system which does a good job at staying
    /// up-to-date; however, a read against the leader must still go through `client_query` with a
    /// linearizable consistency level to guard against stale reads. This method is perfect for
    /// making decisions on where to route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use copycat::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3).await?;
    ///
    /// // wait for ever for raft node's current leader to become 3:
    /// r.wait(None).current_leader(2).await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower).await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientCommandTx<R> = oneshot::Sender<Result<CommandResponse<R>, RaftError>>;
pub(crate) type ClientQueryTx<R> = oneshot::Sender<Result<QueryResponse<R>, RaftError>>;
pub(crate) type RegisterTx = oneshot::Sender<Result<RegisterResponse, RaftError>>;
pub(crate) type KeepAliveTx = oneshot::Sender<Result<KeepAliveResponse, RaftError>>;
pub(crate) type ChangeMembershipTx = oneshot::Sender<Result<u64, ChangeConfigError>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    Poll {
        rpc: PollRequest,
        tx: oneshot::Sender<Result<PollResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>>,
    },
    Register {
        rpc: RegisterRequest,
        tx: RegisterTx,
    },
    KeepAlive {
        rpc: KeepAliveRequest,
        tx: KeepAliveTx,
    },
    ClientCommand {
        rpc: CommandRequest<D>,
        tx: ClientCommandTx<R>,
    },
    ClientQuery {
        rpc: QueryRequest<D>,
        tx: ClientQueryTx<R>,
    },
    Initialize {
        members: Vec<Address>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    Join {
        address: Address,
        tx: ChangeMembershipTx,
    },
    Leave {
        address: Address,
        tx: ChangeMembershipTx,
    },
    Promote {
        address: Address,
        tx: ChangeMembershipTx,
    },
    Demote {
        address: Address,
        tx: ChangeMembershipTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The `(host, port)` address of a cluster member.
///
/// A member's node ID is the stable hash of its address, so that every replica derives the same
/// ID from a configuration entry without coordination.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// The stable ID of the member at this address: the FNV-1a hash of `host:port`.
    pub fn id(&self) -> NodeId {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        for byte in self.host.as_bytes().iter().chain(b":").chain(self.port.to_string().as_bytes()) {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The membership configuration of the cluster.
///
/// Members are split into two sets: active members vote in elections and count towards commit
/// quorums; passive members replicate the log as learners but neither vote nor count. Both sets
/// are keyed by node ID, with the address retained for transports and client redirection.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// The voting members of the Raft cluster.
    pub active: BTreeMap<NodeId, Address>,
    /// The non-voting (learner) members of the Raft cluster.
    pub passive: BTreeMap<NodeId, Address>,
}

impl Membership {
    /// Create a new initial config containing only the given addresses as active members.
    pub fn new_initial(members: impl IntoIterator<Item = Address>) -> Self {
        let active = members.into_iter().map(|addr| (addr.id(), addr)).collect();
        Self {
            active,
            passive: BTreeMap::new(),
        }
    }

    /// Check if the given node ID exists in this membership config, in either set.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.active.contains_key(id) || self.passive.contains_key(id)
    }

    /// Check if the given node ID is an active (voting) member.
    pub fn is_active(&self, id: &NodeId) -> bool {
        self.active.contains_key(id)
    }

    /// Get the IDs of all members, active and passive.
    pub fn all_members(&self) -> Vec<NodeId> {
        self.active.keys().chain(self.passive.keys()).copied().collect()
    }

    /// Look up the address of a member in either set.
    pub fn address_of(&self, id: &NodeId) -> Option<&Address> {
        self.active.get(id).or_else(|| self.passive.get(id))
    }

    /// The config resulting from the given member joining as a passive member.
    pub fn with_joined(&self, address: Address) -> Result<Self, ChangeConfigError> {
        let id = address.id();
        if self.contains(&id) {
            return Err(ChangeConfigError::Noop);
        }
        let mut next = self.clone();
        next.passive.insert(id, address);
        Ok(next)
    }

    /// The config resulting from the given member leaving the cluster.
    pub fn with_left(&self, address: &Address) -> Result<Self, ChangeConfigError> {
        let id = address.id();
        if !self.contains(&id) {
            return Err(ChangeConfigError::Noop);
        }
        let mut next = self.clone();
        next.active.remove(&id);
        next.passive.remove(&id);
        if next.active.is_empty() {
            return Err(ChangeConfigError::InoperableConfig);
        }
        Ok(next)
    }

    /// The config resulting from promoting the given passive member to active.
    pub fn with_promoted(&self, address: &Address) -> Result<Self, ChangeConfigError> {
        let id = address.id();
        if self.active.contains_key(&id) {
            return Err(ChangeConfigError::Noop);
        }
        let mut next = self.clone();
        match next.passive.remove(&id) {
            Some(addr) => {
                next.active.insert(id, addr);
                Ok(next)
            }
            None => Err(ChangeConfigError::MemberStateMismatch),
        }
    }

    /// The config resulting from demoting the given active member to passive.
    pub fn with_demoted(&self, address: &Address) -> Result<Self, ChangeConfigError> {
        let id = address.id();
        if self.passive.contains_key(&id) {
            return Err(ChangeConfigError::Noop);
        }
        let mut next = self.clone();
        match next.active.remove(&id) {
            Some(addr) => {
                if next.active.is_empty() {
                    return Err(ChangeConfigError::InoperableConfig);
                }
                next.passive.insert(id, addr);
                Ok(next)
            }
            None => Err(ChangeConfigError::MemberStateMismatch),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
    /// The minimum match index across the leader's peers.
    ///
    /// This bounds how far the receiver's log compactor may safely rewrite segments without
    /// disturbing in-flight replication.
    pub global_index: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, global_index={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.global_index,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if follower contained entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// A value used to implement the _conflicting term_ optimization outlined in §5.3.
    ///
    /// This value will only be present, and should only be considered, when `success` is `false`.
    pub conflict_opt: Option<ConflictOpt>,
}

/// A struct used to implement the _conflicting term_ optimization outlined in §5.3 for log replication.
///
/// This value will only be present, and should only be considered, when an `AppendEntriesResponse`
/// object has a `success` value of `false`.
///
/// This implementation of Raft uses this value to more quickly synchronize a leader with its
/// followers which may be some distance behind in replication, may have conflicting entries, or
/// which may be new to the cluster.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    /// The most recent entry which does not conflict with the received request.
    pub log_id: LogId,
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    /// The membership carried by this entry, if it is a configuration-bearing entry.
    ///
    /// Receivers adopt configuration changes upon append, not upon commit, so this is consulted
    /// on every replication path.
    pub fn membership(&self) -> Option<&Membership> {
        match &self.payload {
            EntryPayload::Configuration(conf) => Some(&conf.membership),
            EntryPayload::Join(change)
            | EntryPayload::Leave(change)
            | EntryPayload::Promote(change)
            | EntryPayload::Demote(change) => Some(&change.membership),
            _ => None,
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            let e = format!("{}:{}", x.log_id, x.payload.summary());
            res.push(e);
        }

        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader to force commitment of prior-term entries.
    NoOp,
    /// The full cluster membership configuration.
    Configuration(ConfigurationEntry),
    /// Creation of a new client session.
    Register(RegisterEntry),
    /// A client session keep-alive.
    KeepAlive(KeepAliveEntry),
    /// A session-scoped state machine command.
    #[serde(bound = "D: AppData")]
    Command(CommandEntry<D>),
    /// A session-scoped state machine query, persisted only when a linearizable query must be
    /// ordered through the log.
    #[serde(bound = "D: AppData")]
    Query(QueryEntry<D>),
    /// A member joining the cluster as a passive replica.
    Join(MembershipChange),
    /// A member leaving the cluster.
    Leave(MembershipChange),
    /// A passive member being promoted to a voting member.
    Promote(MembershipChange),
    /// A voting member being demoted to a passive member.
    Demote(MembershipChange),
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::NoOp => "no-op".to_string(),
            EntryPayload::Configuration(conf) => format!("config: {:?}", conf.membership),
            EntryPayload::Register(reg) => format!("register: {}", reg.address),
            EntryPayload::KeepAlive(ka) => format!("keep-alive: session {}", ka.session),
            EntryPayload::Command(cmd) => format!("command: session {} request {}", cmd.session, cmd.request),
            EntryPayload::Query(query) => format!("query: session {}", query.session),
            EntryPayload::Join(change) => format!("join: {}", change.member),
            EntryPayload::Leave(change) => format!("leave: {}", change.member),
            EntryPayload::Promote(change) => format!("promote: {}", change.member),
            EntryPayload::Demote(change) => format!("demote: {}", change.member),
        }
    }
}

/// A log entry holding the full cluster membership configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    /// Details on the cluster's membership configuration.
    pub membership: Membership,
}

/// A log entry creating a client session.
///
/// The session's ID is the index at which this entry is appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    /// The address of the registering client.
    pub address: Address,
    /// The leader's clock at append time, in ms since the epoch.
    pub timestamp: i64,
}

/// A log entry refreshing a client session's liveness.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    /// The session being kept alive.
    pub session: u64,
    /// The leader's clock at append time, in ms since the epoch.
    pub timestamp: i64,
}

/// A log entry holding a session-scoped state machine command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry<D: AppData> {
    /// The session which submitted the command.
    pub session: u64,
    /// The client's sequence number for this command.
    pub request: u64,
    /// The highest response sequence the client has acknowledged receiving.
    ///
    /// Cached responses at or below this sequence may be purged.
    pub response: u64,
    /// The leader's clock at append time, in ms since the epoch.
    pub timestamp: i64,
    /// The application specific command payload.
    #[serde(bound = "D: AppData")]
    pub command: D,
}

/// A log entry holding a session-scoped state machine query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry<D: AppData> {
    /// The session which submitted the query.
    pub session: u64,
    /// The state machine version (last applied index) the query is to observe.
    pub version: u64,
    /// The leader's clock at append time, in ms since the epoch.
    pub timestamp: i64,
    /// The application specific query payload.
    #[serde(bound = "D: AppData")]
    pub query: D,
}

/// A log entry holding a single-member cluster membership change.
///
/// Carries both the member the change concerns and the full membership which results from
/// applying it, so receivers can adopt the new configuration without replaying history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipChange {
    /// The member the change concerns.
    pub member: Address,
    /// The membership configuration resulting from the change.
    pub membership: Membership,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// An RPC sent by a prospective candidate to probe whether an election could succeed, before
/// disrupting the cluster by incrementing its term.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollRequest {
    /// The prospective candidate's current term (not yet incremented).
    pub term: u64,
    /// The prospective candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for PollRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl PollRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `PollRequest`.
///
/// Acceptance is judged by the same up-to-date rule as a vote, but grants nothing and mutates no
/// state on the responder.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    /// The current term of the responding node.
    pub term: u64,
    /// Will be true if the responder would vote for the candidate in a subsequent election.
    pub accepted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to send chunks of a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// Metadata of a snapshot: snapshot_id, last_log_id, membership etc.
    pub meta: SnapshotMeta,

    /// The byte offset where this chunk of data is positioned in the snapshot file.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,

    /// Will be `true` if this is the last chunk in the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.meta,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The consistency level of a client query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Apply the query immediately against local state at the last applied index.
    ///
    /// Reads may be stale if the local node has been deposed without noticing.
    Serializable,
    /// Apply the query locally if the leader's lease is fresh — a quorum of peers has
    /// acknowledged replication within the election timeout — else fall through to
    /// `Linearizable`.
    LinearizableLease,
    /// Confirm leadership with a quorum round-trip before applying the query (§8).
    Linearizable,
}

/// A request to create a new client session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// The address of the registering client.
    pub address: Address,
}

/// The response to a `RegisterRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The ID of the newly created session.
    pub session: u64,
    /// The ID of the leader which serviced the registration.
    pub leader: NodeId,
    /// A snapshot of the cluster membership for client-side leader discovery.
    pub membership: Membership,
}

/// A request to keep a client session alive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    /// The session to refresh.
    pub session: u64,
}

/// The response to a `KeepAliveRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    /// The ID of the leader which serviced the keep-alive.
    pub leader: NodeId,
    /// A snapshot of the cluster membership for client-side leader discovery.
    pub membership: Membership,
}

/// A session-scoped client command to update the state of the system (§5.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequest<D: AppData> {
    /// The session submitting the command.
    pub session: u64,
    /// The client's sequence number for this command.
    pub request: u64,
    /// The highest response sequence the client has acknowledged receiving.
    pub response: u64,
    /// The application specific command payload.
    #[serde(bound = "D: AppData")]
    pub command: D,
}

impl<D: AppData> MessageSummary for CommandRequest<D> {
    fn summary(&self) -> String {
        format!("session={}, request={}, response={}", self.session, self.request, self.response)
    }
}

/// The response to a `CommandRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse<R: AppDataResponse> {
    /// The log index of the successfully processed command.
    pub index: u64,
    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

/// A session-scoped read-only client query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest<D: AppData> {
    /// The session submitting the query.
    pub session: u64,
    /// The application specific query payload.
    #[serde(bound = "D: AppData")]
    pub query: D,
    /// The consistency level governing how the query is serviced.
    pub consistency: ConsistencyLevel,
}

/// The response to a `QueryRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse<R: AppDataResponse> {
    /// The last applied log index observed by the query.
    pub index: u64,
    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_id_is_stable() {
        let a = Address::new("10.0.0.1", 5001);
        let b = Address::new("10.0.0.1", 5001);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), Address::new("10.0.0.1", 5002).id());
        assert_ne!(a.id(), Address::new("10.0.0.2", 5001).id());
    }

    #[test]
    fn test_membership_change_rules() {
        let m = Membership::new_initial(vec![Address::new("a", 1), Address::new("b", 2)]);
        let c = Address::new("c", 3);

        let joined = m.with_joined(c.clone()).unwrap();
        assert!(joined.passive.contains_key(&c.id()));
        assert!(matches!(joined.with_joined(c.clone()), Err(ChangeConfigError::Noop)));

        let promoted = joined.with_promoted(&c).unwrap();
        assert!(promoted.is_active(&c.id()));
        assert!(matches!(m.with_promoted(&c), Err(ChangeConfigError::MemberStateMismatch)));

        let demoted = promoted.with_demoted(&c).unwrap();
        assert!(demoted.passive.contains_key(&c.id()));

        let left = demoted.with_left(&c).unwrap();
        assert!(!left.contains(&c.id()));
    }

    #[test]
    fn test_membership_never_empties_active_set() {
        let a = Address::new("a", 1);
        let m = Membership::new_initial(vec![a.clone()]);
        assert!(matches!(m.with_left(&a), Err(ChangeConfigError::InoperableConfig)));
        assert!(matches!(m.with_demoted(&a), Err(ChangeConfigError::InoperableConfig)));
    }
}
