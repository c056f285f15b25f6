use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    #[tracing::instrument(level = "trace", skip(self), fields(target))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState {
        let replstream = ReplicationStream::new::<D, R, N, S>(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.global_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            // Conservative: nothing is known to match until the target acknowledges.
            matched: LogId { term: 0, index: 0 },
            remove_after_commit: None,
            replstream,
        }
    }

    /// Nudge every replica with the current log tail, commit index, and global index.
    ///
    /// Replication is pull-based: replicas fetch entries from storage themselves, so this is
    /// the only signal the leader ever pushes at them.
    pub(super) fn notify_replicas(&self) {
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::Notify {
                    last_log_index: self.core.last_log_id.index,
                    commit_index: self.core.commit_index,
                    global_index: self.core.global_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
    }

    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) {
        let res = match event {
            ReplicaEvent::UpdateMatched { target, matched } => self.handle_update_matched(target, matched).await,
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return;
            }
        };
        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// Handle a matched-index update from a replication stream.
    #[tracing::instrument(level = "trace", skip(self), fields(target))]
    async fn handle_update_matched(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        // Every successful AppendEntries acknowledgement refreshes the lease clock for the peer.
        self.commit_times.insert(target, Instant::now());

        let mut needs_removal = false;
        match self.nodes.get_mut(&target) {
            Some(state) => {
                state.matched = matched;
                if let Some(threshold) = &state.remove_after_commit {
                    if &matched.index >= threshold {
                        needs_removal = true;
                    }
                }
            }
            _ => return Ok(()),
        }

        self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });

        if needs_removal {
            if let Some(node) = self.nodes.remove(&target) {
                tracing::debug!(target, "removing target node from replication pool");
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        }

        self.try_advance_commit().await
    }

    /// Recompute the cluster commit index and, if it advanced, complete committed requests.
    ///
    /// The commit index is the quorum-th largest match index among the active members, counting
    /// the leader itself. Entries from prior terms are only committed indirectly, on the back of
    /// a current-term commitment (§5.4.2).
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn try_advance_commit(&mut self) -> RaftResult<()> {
        let mut indexes: Vec<u64> = Vec::new();
        // A leader which is leaving the cluster manages the commitment of the config entry
        // removing it, but no longer counts towards the quorum.
        if self.core.membership.is_active(&self.core.id) {
            indexes.push(self.core.last_log_id.index);
        }
        for (id, state) in self.nodes.iter() {
            if self.core.membership.is_active(id) {
                indexes.push(state.matched.index);
            }
        }
        indexes.sort_unstable_by(|a, b| b.cmp(a));

        let needed = quorum::majority_of(self.core.membership.active.len());
        let commit_candidate = indexes.get(needed - 1).copied().unwrap_or(0);

        if commit_candidate > self.core.commit_index {
            let entry = self
                .core
                .storage
                .try_get_log_entry(commit_candidate)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            let candidate_term = entry.map(|entry| entry.log_id.term).unwrap_or(0);
            if candidate_term == self.core.current_term {
                self.core.commit_index = commit_candidate;
                self.update_global_index().await?;

                // Nudge the replicas so followers learn the new commit index promptly.
                self.notify_replicas();

                // Complete requests whose entries are now committed, in index order.
                let awaiting = std::mem::take(&mut self.awaiting_committed);
                let (ready, pending): (Vec<_>, Vec<_>) =
                    awaiting.into_iter().partition(|req| req.log_id.index <= self.core.commit_index);
                self.awaiting_committed = pending;
                for req in ready {
                    self.client_request_post_commit(req).await;
                }

                // Apply any committed entries not tied to a waiting request.
                self.core.apply_committed_entries().await?;
                self.leader_report_metrics();
            }
        } else {
            self.update_global_index().await?;
        }
        Ok(())
    }

    /// Recompute the global index: the minimum match index across all replication streams.
    ///
    /// With no peers the leader's own log is the only constraint. The value legitimately
    /// regresses when a fresh member joins, protecting its catch-up replication from the
    /// compactor.
    async fn update_global_index(&mut self) -> RaftResult<()> {
        let global = self
            .nodes
            .values()
            .map(|state| state.matched.index)
            .min()
            .unwrap_or(self.core.last_log_id.index);
        self.core.global_index = global;
        self.core
            .storage
            .set_commit_bounds(self.core.commit_index, global)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        Ok(())
    }

    /// Handle a replication stream having observed a greater term.
    #[tracing::instrument(level = "trace", skip(self), fields(target))]
    async fn handle_revert_to_follower(&mut self, target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Handle a replication stream which needs a snapshot to bring its target up-to-speed.
    #[tracing::instrument(level = "trace", skip(self, tx), fields(target))]
    async fn handle_needs_snapshot(
        &mut self,
        target: NodeId,
        tx: oneshot::Sender<Snapshot<S::SnapshotData>>,
    ) -> RaftResult<()> {
        // Check for existence of current snapshot.
        let current = self
            .core
            .storage
            .get_current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        if let Some(snapshot) = current {
            let _ = tx.send(snapshot);
            return Ok(());
        }

        // No snapshot exists: if one is already being built, wire the response to its
        // completion, else kick a build off now and do the same.
        if self.core.snapshot_state.is_none() {
            self.core.trigger_log_compaction_if_needed(true);
        }
        if let Some(SnapshotState::Snapshotting { sender, .. }) = &self.core.snapshot_state {
            let mut rx = sender.subscribe();
            let storage = self.core.storage.clone();
            tokio::spawn(
                async move {
                    if rx.recv().await.is_ok() {
                        if let Ok(Some(snapshot)) = storage.get_current_snapshot().await {
                            let _ = tx.send(snapshot);
                        }
                    }
                }
                .instrument(tracing::debug_span!("waiting for snapshot to complete")),
            );
        }
        Ok(())
    }
}
