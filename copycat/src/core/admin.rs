use crate::core::client::ClientRequestEntry;
use crate::core::client::ClientResponseTx;
use crate::core::LeaderState;
use crate::core::PassiveState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::raft::Address;
use crate::raft::ChangeMembershipTx;
use crate::raft::EntryPayload;
use crate::raft::Membership;
use crate::raft::MembershipChange;
use crate::replication::RaftEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> PassiveState<'a, D, R, N, S> {
    /// Handle the admin `initialize` command.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(&mut self, members: Vec<Address>) -> Result<(), InitializeError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!({self.core.last_log_id.index, self.core.current_term}, "rejecting initialize request as last_log_index or current_term is not 0");
            return Err(InitializeError::NotAllowed);
        }

        // The initial config must carry this node as a voting member; its address cannot be
        // invented here, so the caller is required to include it.
        let membership = Membership::new_initial(members);
        if !membership.is_active(&self.core.id) {
            tracing::error!("rejecting initialize request which does not include the local node");
            return Err(InitializeError::NotAllowed);
        }
        self.core.membership = membership;

        // Become a candidate and start campaigning for leadership. If this node is the only node
        // in the cluster, then become leader without holding an election.
        if self.core.membership.active.len() == 1 {
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_state(State::Leader);
            self.core.save_hard_state().await?;
        } else {
            self.core.set_target_state(State::Candidate);
        }

        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Add a new member to the cluster as a passive replica.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_join_request(&mut self, address: Address, tx: ChangeMembershipTx) {
        let next = match self.next_config(|m| m.with_joined(address.clone())) {
            Ok(next) => next,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        let change = MembershipChange {
            member: address,
            membership: next,
        };
        self.append_membership_change(EntryPayload::Join(change), tx).await;
    }

    /// Remove a member from the cluster.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_leave_request(&mut self, address: Address, tx: ChangeMembershipTx) {
        let next = match self.next_config(|m| m.with_left(&address)) {
            Ok(next) => next,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        let change = MembershipChange {
            member: address,
            membership: next,
        };
        self.append_membership_change(EntryPayload::Leave(change), tx).await;
    }

    /// Promote a passive member to a voting member.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_promote_request(&mut self, address: Address, tx: ChangeMembershipTx) {
        let next = match self.next_config(|m| m.with_promoted(&address)) {
            Ok(next) => next,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        let change = MembershipChange {
            member: address,
            membership: next,
        };
        self.append_membership_change(EntryPayload::Promote(change), tx).await;
    }

    /// Demote a voting member to a passive member.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_demote_request(&mut self, address: Address, tx: ChangeMembershipTx) {
        let next = match self.next_config(|m| m.with_demoted(&address)) {
            Ok(next) => next,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        let change = MembershipChange {
            member: address,
            membership: next,
        };
        self.append_membership_change(EntryPayload::Demote(change), tx).await;
    }

    /// Validate the single-change rule and compute the next configuration.
    fn next_config<F>(&self, f: F) -> Result<Membership, ChangeConfigError>
    where F: FnOnce(&Membership) -> Result<Membership, ChangeConfigError> {
        if self.uncommitted_config.is_some() {
            // Only one uncommitted configuration change may exist at a time.
            tracing::debug!("rejecting config change while another is uncommitted");
            return Err(ChangeConfigError::ConfigChangeInProgress);
        }
        f(&self.core.membership)
    }

    /// Append a membership change entry, adopt the new config immediately, and begin
    /// replicating the change.
    #[tracing::instrument(level = "trace", skip(self, payload, tx), fields(id=self.core.id))]
    pub(super) async fn append_membership_change(&mut self, payload: EntryPayload<D>, tx: ChangeMembershipTx) {
        let next = match payload {
            EntryPayload::Join(ref change)
            | EntryPayload::Leave(ref change)
            | EntryPayload::Promote(ref change)
            | EntryPayload::Demote(ref change) => change.membership.clone(),
            _ => {
                let _ = tx.send(Err(ChangeConfigError::Noop));
                return;
            }
        };

        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return;
            }
        };
        self.uncommitted_config = Some(entry.log_id.index);

        // The leader adopts a configuration as soon as it is appended. Stepping down, however,
        // waits for the commit.
        self.core.membership = next;
        if !self.core.membership.is_active(&self.core.id) {
            self.is_stepping_down = true;
        }
        self.update_replication_state(entry.log_id.index);
        self.leader_report_metrics();

        let cr_entry = ClientRequestEntry::new(entry.log_id, ClientResponseTx::Config(Some(tx)));
        if let Err(err) = self.replicate_client_request(cr_entry).await {
            tracing::error!(error=%err, "error replicating membership change entry");
        }
    }

    /// Synchronize the replication streams with the current membership config.
    ///
    /// New members (active or passive) get a stream immediately; members no longer in the
    /// config keep their stream just long enough to replicate the config entry which removes
    /// them.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn update_replication_state(&mut self, config_index: u64) {
        let membership = self.core.membership.clone();

        for target in membership.all_members() {
            if target != self.core.id && !self.nodes.contains_key(&target) {
                let state = self.spawn_replication_stream(target);
                self.nodes.insert(target, state);
            }
        }

        let stale: Vec<_> = self.nodes.keys().filter(|id| !membership.contains(id)).copied().collect();
        for target in stale {
            if let Some(state) = self.nodes.get_mut(&target) {
                if state.matched.index >= config_index {
                    if let Some(node) = self.nodes.remove(&target) {
                        tracing::debug!(target, "removing replication stream of departed member");
                        let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                        self.leader_metrics.replication.remove(&target);
                        self.commit_times.remove(&target);
                    }
                } else {
                    state.remove_after_commit = Some(config_index);
                }
            }
        }
    }

    /// Handle the commitment of a configuration change entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_config_committed(&mut self, index: u64) {
        if self.uncommitted_config == Some(index) {
            self.uncommitted_config = None;
        }

        // Step down if this node was removed or demoted by the committed config.
        if self.is_stepping_down {
            tracing::debug!("raft node is stepping down");
            self.core.set_target_state(State::Passive);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return;
        }

        self.update_replication_state(index);
        self.leader_report_metrics();
    }
}
