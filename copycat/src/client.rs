//! The client-side session handle: a remote member of the cluster.
//!
//! A `RaftClient` holds no log and no protocol state; it discovers the leader by trial over the
//! member list, registers a session, keeps it alive in the background, and forwards every
//! command and query to the current leader, retargeting whenever a response points elsewhere.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::error::RaftError;
use crate::raft::Address;
use crate::raft::CommandRequest;
use crate::raft::CommandResponse;
use crate::raft::ConsistencyLevel;
use crate::raft::KeepAliveRequest;
use crate::raft::KeepAliveResponse;
use crate::raft::QueryRequest;
use crate::raft::QueryResponse;
use crate::raft::RegisterRequest;
use crate::raft::RegisterResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;

/// The number of leader-discovery attempts before a request is abandoned.
const MAX_ATTEMPTS: usize = 10;
/// The initial retry backoff; doubles per attempt.
const BASE_BACKOFF: Duration = Duration::from_millis(10);

/// A trait defining the interface for the client side of the Raft network.
///
/// This carries the session RPCs only; servers talk to each other over [`crate::RaftNetwork`].
#[async_trait::async_trait]
pub trait SessionNetwork<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Send a session registration request to the target Raft node.
    async fn register(&self, target: NodeId, rpc: RegisterRequest) -> Result<RegisterResponse, RaftError>;

    /// Send a session keep-alive request to the target Raft node.
    async fn keep_alive(&self, target: NodeId, rpc: KeepAliveRequest) -> Result<KeepAliveResponse, RaftError>;

    /// Send a session command to the target Raft node.
    async fn command(&self, target: NodeId, rpc: CommandRequest<D>) -> Result<CommandResponse<R>, RaftError>;

    /// Send a session query to the target Raft node.
    async fn query(&self, target: NodeId, rpc: QueryRequest<D>) -> Result<QueryResponse<R>, RaftError>;
}

struct ClientState {
    /// Known cluster members to try, refreshed from session responses.
    members: Vec<NodeId>,
    /// The last known leader, if any.
    leader: Option<NodeId>,
    /// The current session ID; 0 when unregistered.
    session: u64,
    /// The sequence number of the most recent command submitted on the session.
    request: u64,
    /// The highest response sequence acknowledged back to the cluster.
    response: u64,
}

struct ClientInner<D: AppData, R: AppDataResponse, N: SessionNetwork<D, R>> {
    network: Arc<N>,
    address: Address,
    keep_alive_interval: Duration,
    state: Mutex<ClientState>,
    keep_alive_handle: Mutex<Option<JoinHandle<()>>>,
    marker_d: std::marker::PhantomData<fn() -> D>,
    marker_r: std::marker::PhantomData<fn() -> R>,
}

/// A session-holding client of the replicated state machine.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally; all clones share the session.
pub struct RaftClient<D: AppData, R: AppDataResponse, N: SessionNetwork<D, R>> {
    inner: Arc<ClientInner<D, R, N>>,
}

impl<D: AppData, R: AppDataResponse, N: SessionNetwork<D, R>> Clone for RaftClient<D, R, N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: AppData, R: AppDataResponse, N: SessionNetwork<D, R>> RaftClient<D, R, N> {
    /// Create a new client.
    ///
    /// `members` seeds leader discovery; the list is refreshed from the cluster as responses
    /// come back. `keep_alive_interval` should be the cluster's heartbeat interval, well below
    /// the session timeout.
    pub fn new(network: Arc<N>, address: Address, members: Vec<NodeId>, keep_alive_interval: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                network,
                address,
                keep_alive_interval,
                state: Mutex::new(ClientState {
                    members,
                    leader: None,
                    session: 0,
                    request: 0,
                    response: 0,
                }),
                keep_alive_handle: Mutex::new(None),
                marker_d: std::marker::PhantomData,
                marker_r: std::marker::PhantomData,
            }),
        }
    }

    /// The current session ID, `0` when unregistered.
    pub async fn session(&self) -> u64 {
        self.inner.state.lock().await.session
    }

    /// Register a session with the cluster and start the background keep-alive task.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn connect(&self) -> Result<u64, RaftError> {
        let session = self.register().await?;
        self.spawn_keep_alive().await;
        Ok(session)
    }

    /// Submit a command against the replicated state machine.
    ///
    /// The command is stamped with the session's next request sequence; the cluster applies it
    /// at most once, replaying the cached response if the submission is retried. If the session
    /// has expired the client transparently re-registers and submits on the fresh session,
    /// discarding the in-flight request sequence.
    #[tracing::instrument(level = "debug", skip(self, command))]
    pub async fn submit(&self, command: D) -> Result<R, RaftError> {
        for _ in 0..2 {
            let (session, request, response) = {
                let mut state = self.inner.state.lock().await;
                if state.session == 0 {
                    drop(state);
                    self.register().await?;
                    state = self.inner.state.lock().await;
                }
                state.request += 1;
                (state.session, state.request, state.response)
            };

            let rpc = CommandRequest {
                session,
                request,
                response,
                command: command.clone(),
            };
            let res = self
                .with_leader_retry(|network, target, rpc| async move { network.command(target, rpc).await }, rpc)
                .await;

            match res {
                Ok(res) => {
                    let mut state = self.inner.state.lock().await;
                    if state.session == session && state.response < request {
                        state.response = request;
                    }
                    return Ok(res.data);
                }
                Err(RaftError::UnknownSession(_)) => {
                    // The session expired: in-flight request IDs are worthless. Re-register and
                    // run the command on the fresh session.
                    tracing::debug!("session expired, re-registering");
                    let mut state = self.inner.state.lock().await;
                    if state.session == session {
                        state.session = 0;
                        state.request = 0;
                        state.response = 0;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(RaftError::UnknownSession(0))
    }

    /// Submit a read-only query at the given consistency level.
    #[tracing::instrument(level = "debug", skip(self, query))]
    pub async fn query(&self, query: D, consistency: ConsistencyLevel) -> Result<R, RaftError> {
        let session = self.inner.state.lock().await.session;
        let rpc = QueryRequest {
            session,
            query,
            consistency,
        };
        let res = self
            .with_leader_retry(|network, target, rpc| async move { network.query(target, rpc).await }, rpc)
            .await?;
        Ok(res.data)
    }

    /// Close the session: stop the background keep-alive task.
    ///
    /// The cluster expires the session once keep-alives stop arriving.
    pub async fn close(&self) {
        if let Some(handle) = self.inner.keep_alive_handle.lock().await.take() {
            handle.abort();
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn register(&self) -> Result<u64, RaftError> {
        let rpc = RegisterRequest {
            address: self.inner.address.clone(),
        };
        let res = self
            .with_leader_retry(|network, target, rpc| async move { network.register(target, rpc).await }, rpc)
            .await?;

        let mut state = self.inner.state.lock().await;
        state.session = res.session;
        state.request = 0;
        state.response = 0;
        state.leader = Some(res.leader);
        state.members = res.membership.all_members();
        tracing::debug!(session = res.session, "registered session");
        Ok(res.session)
    }

    async fn spawn_keep_alive(&self) {
        let client = self.clone();
        let interval = self.inner.keep_alive_interval;
        let handle = tokio::spawn(
            async move {
                loop {
                    sleep(interval).await;
                    let session = client.inner.state.lock().await.session;
                    if session == 0 {
                        continue;
                    }
                    let rpc = KeepAliveRequest { session };
                    let res = client
                        .with_leader_retry(
                            |network, target, rpc| async move { network.keep_alive(target, rpc).await },
                            rpc,
                        )
                        .await;
                    match res {
                        Ok(res) => {
                            let mut state = client.inner.state.lock().await;
                            state.leader = Some(res.leader);
                            state.members = res.membership.all_members();
                        }
                        Err(err) => {
                            tracing::warn!(error=%err, "keep-alive failed");
                        }
                    }
                }
            }
            .instrument(tracing::debug_span!("keep-alive")),
        );
        let mut guard = self.inner.keep_alive_handle.lock().await;
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
    }

    /// Run a request against the current leader, rediscovering it on transient errors with
    /// exponential backoff.
    async fn with_leader_retry<T, Rpc, F, Fut>(&self, f: F, rpc: Rpc) -> Result<T, RaftError>
    where
        Rpc: Clone,
        F: Fn(Arc<N>, NodeId, Rpc) -> Fut,
        Fut: std::future::Future<Output = Result<T, RaftError>>,
    {
        let mut backoff = BASE_BACKOFF;
        let mut rotation = 0usize;
        for _ in 0..MAX_ATTEMPTS {
            let target = {
                let state = self.inner.state.lock().await;
                match state.leader {
                    Some(leader) => leader,
                    None => {
                        if state.members.is_empty() {
                            return Err(RaftError::NoLeader { leader_hint: None });
                        }
                        state.members[rotation % state.members.len()]
                    }
                }
            };

            match f(self.inner.network.clone(), target, rpc.clone()).await {
                Ok(res) => {
                    self.inner.state.lock().await.leader = Some(target);
                    return Ok(res);
                }
                Err(RaftError::NoLeader { leader_hint }) => {
                    tracing::debug!(target, ?leader_hint, "target is not the leader, retargeting");
                    let mut state = self.inner.state.lock().await;
                    state.leader = leader_hint.filter(|hint| *hint != target);
                    rotation += 1;
                }
                Err(RaftError::IllegalMemberState) => {
                    self.inner.state.lock().await.leader = None;
                    rotation += 1;
                }
                Err(RaftError::RaftNetwork(err)) => {
                    tracing::debug!(target, error=%err, "network error reaching target, retargeting");
                    self.inner.state.lock().await.leader = None;
                    rotation += 1;
                }
                Err(err) => return Err(err),
            }

            sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(1000));
        }
        Err(RaftError::NoLeader { leader_hint: None })
    }
}
