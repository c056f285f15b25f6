use anyhow::anyhow;
use futures::future::TryFutureExt;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::ClientCommandTx;
use crate::raft::ClientQueryTx;
use crate::raft::CommandEntry;
use crate::raft::CommandRequest;
use crate::raft::CommandResponse;
use crate::raft::ConfigurationEntry;
use crate::raft::ConsistencyLevel;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::KeepAliveEntry;
use crate::raft::KeepAliveRequest;
use crate::raft::KeepAliveResponse;
use crate::raft::KeepAliveTx;
use crate::raft::QueryRequest;
use crate::raft::QueryResponse;
use crate::raft::RegisterEntry;
use crate::raft::RegisterRequest;
use crate::raft::RegisterResponse;
use crate::raft::RegisterTx;
use crate::raft::ChangeMembershipTx;
use crate::sessions::Applied;
use crate::storage::ms_since_epoch;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A client request awaiting commitment of its entry, along with its response channel.
///
/// Replication is pull-based, so nothing here holds the entry itself: the log id is enough to
/// recognize commitment and to fetch the entry back out of storage for application.
pub(super) struct ClientRequestEntry<R: AppDataResponse> {
    /// The id of the log entry the request was transformed into.
    pub log_id: LogId,
    /// The response channel for the request.
    pub tx: ClientResponseTx<R>,
}

impl<R: AppDataResponse> ClientRequestEntry<R> {
    pub(crate) fn new(log_id: LogId, tx: ClientResponseTx<R>) -> Self {
        Self { log_id, tx }
    }
}

/// The response channel matching the kind of entry awaiting commitment.
pub(super) enum ClientResponseTx<R: AppDataResponse> {
    Command(ClientCommandTx<R>),
    Register(RegisterTx),
    KeepAlive(KeepAliveTx),
    Config(Option<ChangeMembershipTx>),
    /// An internal entry (the leader's initial no-op) with no one waiting on it.
    Internal,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to power, per §8.
    ///
    /// A pristine multi-node cluster seeds its membership into the log instead; in every other
    /// case the initial entry is a no-op whose commitment drags all prior-term entries along
    /// with it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let payload = if self.core.last_log_id.index == 0 && self.core.membership.all_members().len() > 1 {
            EntryPayload::Configuration(ConfigurationEntry {
                membership: self.core.membership.clone(),
            })
        } else {
            EntryPayload::NoOp
        };

        let entry = self.append_payload_to_log(payload).await?;
        let cr_entry = ClientRequestEntry::new(entry.log_id, ClientResponseTx::Internal);
        self.replicate_client_request(cr_entry).await?;

        Ok(())
    }

    /// Handle a client session registration request.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_register_request(&mut self, rpc: RegisterRequest, tx: RegisterTx) {
        let payload = EntryPayload::Register(RegisterEntry {
            address: rpc.address,
            timestamp: ms_since_epoch(),
        });
        match self.append_payload_to_log(payload).await {
            Ok(entry) => {
                let cr_entry = ClientRequestEntry::new(entry.log_id, ClientResponseTx::Register(tx));
                if let Err(err) = self.replicate_client_request(cr_entry).await {
                    tracing::error!(error=%err, "error replicating register entry");
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Handle a client session keep-alive request.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_keep_alive_request(&mut self, rpc: KeepAliveRequest, tx: KeepAliveTx) {
        let payload = EntryPayload::KeepAlive(KeepAliveEntry {
            session: rpc.session,
            timestamp: ms_since_epoch(),
        });
        match self.append_payload_to_log(payload).await {
            Ok(entry) => {
                let cr_entry = ClientRequestEntry::new(entry.log_id, ClientResponseTx::KeepAlive(tx));
                if let Err(err) = self.replicate_client_request(cr_entry).await {
                    tracing::error!(error=%err, "error replicating keep-alive entry");
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Handle a client command request.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_command_request(&mut self, rpc: CommandRequest<D>, tx: ClientCommandTx<R>) {
        let payload = EntryPayload::Command(CommandEntry {
            session: rpc.session,
            request: rpc.request,
            response: rpc.response,
            timestamp: ms_since_epoch(),
            command: rpc.command,
        });
        match self.append_payload_to_log(payload).await {
            Ok(entry) => {
                let cr_entry = ClientRequestEntry::new(entry.log_id, ClientResponseTx::Command(tx));
                if let Err(err) = self.replicate_client_request(cr_entry).await {
                    tracing::error!(error=%err, "error replicating command entry");
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Handle a client query request, honoring its consistency level.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_query_request(&mut self, rpc: QueryRequest<D>, tx: ClientQueryTx<R>) {
        match rpc.consistency {
            ConsistencyLevel::Serializable => self.answer_query(rpc, tx).await,
            ConsistencyLevel::LinearizableLease => {
                if self.lease_is_fresh() {
                    self.answer_query(rpc, tx).await;
                } else {
                    self.answer_query_linearizable(rpc, tx).await;
                }
            }
            ConsistencyLevel::Linearizable => self.answer_query_linearizable(rpc, tx).await,
        }
    }

    /// Apply the query against local state at the last applied index.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    async fn answer_query(&mut self, rpc: QueryRequest<D>, tx: ClientQueryTx<R>) {
        // Catch the state machine up to the commit index before reading.
        if let Err(err) = self.core.apply_committed_entries().await {
            let _ = tx.send(Err(err));
            return;
        }
        match self.core.storage.query(&rpc.query).await {
            Ok(data) => {
                let _ = tx.send(Ok(QueryResponse {
                    index: self.core.last_applied.index,
                    data,
                }));
            }
            Err(err) => {
                let _ = tx.send(Err(RaftError::Application(err.to_string())));
            }
        }
    }

    /// Confirm leadership with a quorum round-trip, then apply the query locally.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    async fn answer_query_linearizable(&mut self, rpc: QueryRequest<D>, tx: ClientQueryTx<R>) {
        match self.confirm_leadership().await {
            Ok(()) => self.answer_query(rpc, tx).await,
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Whether the leader's lease is fresh: a quorum of the cluster has acknowledged an
    /// AppendEntries RPC within the election timeout.
    pub(super) fn lease_is_fresh(&self) -> bool {
        let now = Instant::now();
        let mut acks: Vec<Option<Instant>> = self
            .core
            .membership
            .active
            .keys()
            .filter(|id| **id != self.core.id)
            .map(|id| self.commit_times.get(id).copied())
            .collect();
        acks.push(Some(now)); // The leader trivially acknowledges itself.
        acks.sort_unstable_by(|a, b| b.cmp(a));

        let needed = quorum::majority_of(self.core.membership.active.len());
        match acks.get(needed - 1) {
            Some(Some(quorum_ack)) => {
                now.duration_since(*quorum_ack) < Duration::from_millis(self.core.config.election_timeout)
            }
            _ => false,
        }
    }

    /// Confirm this node is still the cluster leader before servicing a linearizable query.
    ///
    /// Spawn empty AppendEntries RPCs to all voting members; respond once a majority confirms
    /// the term (§8):
    ///
    /// From the spec: a leader must check whether it has been deposed before processing a
    /// read-only request (its information may be stale if a more recent leader has been
    /// elected). Raft handles this by having the leader exchange heartbeat messages with a
    /// majority of the cluster before responding to read-only requests.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn confirm_leadership(&mut self) -> Result<(), RaftError> {
        let len_members = self.core.membership.active.len();
        let needed = quorum::majority_of(len_members);
        let mut confirmed = 1usize; // We count ourselves.

        if confirmed >= needed {
            return Ok(());
        }

        // Spawn parallel requests, all with the standard timeout for heartbeats.
        let mut pending = FuturesUnordered::new();
        for (id, node) in self.nodes.iter() {
            if !self.core.membership.is_active(id) {
                continue;
            }
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_id: node.matched,
                entries: vec![],
                leader_commit: self.core.commit_index,
                global_index: self.core.global_index,
            };
            let target = *id;
            let network = self.core.network.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_interval);
            let task = tokio::spawn(
                async move {
                    match timeout(ttl, network.send_append_entries(target, rpc)).await {
                        Ok(Ok(data)) => Ok((target, data)),
                        Ok(Err(err)) => Err((target, err)),
                        Err(_timeout) => Err((target, anyhow!("timeout waiting for leadership confirmation"))),
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            )
            .map_err(move |err| (*id, err));
            pending.push(task);
        }

        // Handle responses as they return.
        while let Some(res) = pending.next().await {
            let (target, data) = match res {
                Ok(Ok(res)) => res,
                Ok(Err((target, err))) => {
                    tracing::warn!(target, error=%err, "failed to confirm leadership against peer");
                    continue;
                }
                Err((target, err)) => {
                    tracing::error!(target, "{}", err);
                    continue;
                }
            };

            // If we receive a response with a greater term, then revert to follower and abort this request.
            if data.term > self.core.current_term {
                self.core.update_current_term(data.term, None);
                self.core.set_target_state(State::Follower);
                return Err(RaftError::NoLeader {
                    leader_hint: self.core.current_leader,
                });
            }

            if self.core.membership.is_active(&target) {
                confirmed += 1;
            }
            if confirmed >= needed {
                return Ok(());
            }
        }

        // If we've hit this location, then we've failed to gather needed confirmations due to
        // request failures.
        Err(RaftError::RaftNetwork(anyhow!(
            "too many requests failed, could not confirm leadership"
        )))
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;

        self.leader_report_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<R>) -> RaftResult<()> {
        self.awaiting_committed.push(req);
        self.notify_replicas();

        // A quorum of one (a single voting member, or a lone node with passive learners) commits
        // on the spot.
        self.try_advance_commit().await
    }

    /// Handle the post-commit logic for a client request: apply its entry and answer the caller.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<R>) {
        let index = req.log_id.index;
        let outcome = match self.apply_through(index).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error=%err, index, "error applying committed entry");
                self.fail_request(req.tx, RaftError::Internal(err.to_string()));
                return;
            }
        };

        match req.tx {
            ClientResponseTx::Command(tx) => {
                let res = match outcome {
                    Some(Applied::Response { result }) => match result {
                        Ok(data) => Ok(CommandResponse { index, data }),
                        Err(msg) => Err(RaftError::Application(msg)),
                    },
                    Some(Applied::SessionUnknown { session }) => Err(RaftError::UnknownSession(session)),
                    Some(Applied::ResponseEvicted { .. }) => {
                        Err(RaftError::Application("command response is no longer cached".into()))
                    }
                    _ => Err(RaftError::Internal("unexpected apply outcome for command entry".into())),
                };
                let _ = tx.send(res);
            }
            ClientResponseTx::Register(tx) => {
                let res = match outcome {
                    Some(Applied::Registered { session }) => Ok(RegisterResponse {
                        session,
                        leader: self.core.id,
                        membership: self.core.membership.clone(),
                    }),
                    _ => Err(RaftError::Internal("unexpected apply outcome for register entry".into())),
                };
                let _ = tx.send(res);
            }
            ClientResponseTx::KeepAlive(tx) => {
                let res = match outcome {
                    Some(Applied::KeptAlive { .. }) => Ok(KeepAliveResponse {
                        leader: self.core.id,
                        membership: self.core.membership.clone(),
                    }),
                    Some(Applied::SessionUnknown { session }) => Err(RaftError::UnknownSession(session)),
                    _ => Err(RaftError::Internal("unexpected apply outcome for keep-alive entry".into())),
                };
                let _ = tx.send(res);
            }
            ClientResponseTx::Config(tx) => {
                self.handle_config_committed(index);
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(index));
                }
            }
            ClientResponseTx::Internal => {
                tracing::debug!(index, "internal entry committed");
            }
        }

        // Trigger log compaction if needed.
        self.core.trigger_log_compaction_if_needed(false);
    }

    pub(super) fn fail_request(&self, tx: ClientResponseTx<R>, err: RaftError) {
        match tx {
            ClientResponseTx::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            ClientResponseTx::Register(tx) => {
                let _ = tx.send(Err(err));
            }
            ClientResponseTx::KeepAlive(tx) => {
                let _ = tx.send(Err(err));
            }
            ClientResponseTx::Config(Some(tx)) => {
                let _ = tx.send(Err(err.into()));
            }
            ClientResponseTx::Config(None) | ClientResponseTx::Internal => {}
        }
    }

    /// Apply committed entries through the given index, returning the outcome of the entry at
    /// that index.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn apply_through(&mut self, index: u64) -> RaftResult<Option<Applied<R>>> {
        if self.core.last_applied.index >= index {
            return Ok(None);
        }
        let entries = self
            .core
            .storage
            .get_log_entries(self.core.last_applied.index + 1..=index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        let last_id = match entries.last() {
            Some(entry) => entry.log_id,
            None => return Ok(None),
        };

        let refs: Vec<_> = entries.iter().collect();
        let mut outcomes = self.core.storage.apply_to_state_machine(&refs).await.map_err(|err| {
            if err.downcast_ref::<S::ShutdownError>().is_some() {
                // If this is an instance of the storage impl's shutdown error, then trigger shutdown.
                self.core.map_fatal_storage_error(err)
            } else {
                // Else, we propagate normally.
                crate::error::RaftError::RaftStorage(err)
            }
        })?;

        self.core.last_applied = last_id;
        self.leader_report_metrics();
        Ok(outcomes.pop())
    }
}
