use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level="trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        // Update current term if needed.
        if self.current_term != msg.term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader.as_ref() != Some(&msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
            report_metrics = true;
        }

        // Transition to follower state if needed.
        if !self.target_state.is_follower() && !self.target_state.is_passive() {
            self.set_target_state(State::Follower);
        }

        // The global index bounds how far the local compactor may reach.
        self.global_index = self.global_index.max(msg.global_index);

        // If RPC's `prev_log_index` is 0, or the RPC's previous log info matches the local
        // log info, then replication is g2g.
        let msg_prev_index_is_min = msg.prev_log_id.index == u64::MIN;
        let msg_index_and_term_match = msg.prev_log_id == self.last_log_id;

        if msg_prev_index_is_min || msg_index_and_term_match {
            if !msg.entries.is_empty() {
                if msg_prev_index_is_min && self.last_log_id.index > msg.prev_log_id.index {
                    // Replication is starting over from the beginning; drop whatever divergent
                    // state is present locally.
                    self.storage
                        .delete_logs_from(msg.prev_log_id.index + 1..)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    self.last_log_id = msg.prev_log_id;
                }
                self.append_log_entries(&msg.entries).await?;
            }
            self.advance_commit_and_apply(msg.leader_commit).await?;

            if report_metrics {
                self.report_metrics(Update::Ignore);
            }

            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: true,
                conflict_opt: None,
            });
        }

        /////////////////////////////////////
        //// Begin Log Consistency Check ////
        tracing::debug!("begin log consistency check");

        if self.last_log_id.index < msg.prev_log_id.index {
            if report_metrics {
                self.report_metrics(Update::Ignore);
            }

            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: Some(ConflictOpt {
                    log_id: self.last_log_id,
                }),
            });
        }

        // last_log_id.index >= prev_log_id.index
        //
        // Previous log info doesn't immediately line up, so perform log consistency check and
        // proceed based on its result.
        let prev_entry = self
            .storage
            .try_get_log_entry(msg.prev_log_id.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let target_entry = match prev_entry {
            Some(target_entry) => target_entry,
            None => {
                // This can only happen if the target entry is removed, e.g., when installing
                // snapshot or log compaction. Use the last known index & term as a conflict opt.

                if report_metrics {
                    self.report_metrics(Update::Ignore);
                }

                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt: Some(ConflictOpt {
                        log_id: self.last_log_id,
                    }),
                });
            }
        };

        // The target entry was found. Compare its term with target term to ensure everything is consistent.
        if target_entry.log_id.term == msg.prev_log_id.term {
            // We've found a point of agreement with the leader. If we have any logs present
            // with an index greater than this, then we must delete them per §5.3.
            if self.last_log_id.index > target_entry.log_id.index {
                self.storage
                    .delete_logs_from(target_entry.log_id.index + 1..)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                self.last_log_id = target_entry.log_id;
                let membership =
                    self.storage.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
                self.update_membership(membership)?;
            }
        }
        // The target entry does not have the same term. Fetch the last 50 logs, and use the last
        // entry of that payload which is still in the target term for conflict optimization.
        else {
            let start = if msg.prev_log_id.index >= 50 {
                msg.prev_log_id.index - 50
            } else {
                0
            };
            let old_entries = self
                .storage
                .get_log_entries(start..msg.prev_log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            let opt = match old_entries.iter().find(|entry| entry.log_id.term == msg.prev_log_id.term) {
                Some(entry) => Some(ConflictOpt { log_id: entry.log_id }),
                None => Some(ConflictOpt {
                    log_id: self.last_log_id,
                }),
            };
            if report_metrics {
                self.report_metrics(Update::Ignore);
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: opt,
            });
        }

        ///////////////////////////////////
        //// End Log Consistency Check ////
        tracing::debug!("end log consistency check");

        self.append_log_entries(&msg.entries).await?;
        self.advance_commit_and_apply(msg.leader_commit).await?;
        if report_metrics {
            self.report_metrics(Update::Ignore);
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Append the given entries to the log.
    ///
    /// Configuration changes are also detected and adopted here, upon append rather than upon
    /// commit.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        // Check the given entries for any config changes and take the most recent.
        let last_conf_change = entries.iter().filter_map(|ent| ent.membership()).last();
        if let Some(conf) = last_conf_change.cloned() {
            tracing::debug!({membership=?conf}, "applying new membership config received from leader");
            self.update_membership(conf)?;
        };

        // Replicate entries to log (same as append, but in follower mode).
        let entry_refs = entries.iter().collect::<Vec<_>>();
        self.storage.append_to_log(&entry_refs).await.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = entries.last() {
            self.last_log_id = entry.log_id;
        }
        Ok(())
    }

    /// Advance the local commit index from the leader's and apply newly committed entries.
    ///
    /// The commit index never advances beyond the local last log index; the leader may know of
    /// commitment for entries this node has not yet received.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn advance_commit_and_apply(&mut self, leader_commit: u64) -> RaftResult<()> {
        let new_commit = leader_commit.min(self.last_log_id.index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }

        let _ = self
            .storage
            .set_commit_bounds(self.commit_index, self.global_index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        if self.commit_index > self.last_applied.index {
            self.apply_committed_entries().await?;
        }
        Ok(())
    }
}
