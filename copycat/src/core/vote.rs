use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::PollRequest;
use crate::raft::PollResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Do not respond to the request if we've received a heartbeat within the election timeout minimum.
        if let Some(inst) = &self.last_heartbeat {
            let now = tokio::time::Instant::now();
            let delta = now.duration_since(*inst);
            if self.config.election_timeout >= delta.as_millis() as u64 {
                tracing::debug!(
                    { candidate = msg.candidate_id },
                    "rejecting vote request received within election timeout minimum"
                );
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
        }

        // Per spec, if we observe a term greater than our own outside of the election timeout
        // minimum, then we must update term & immediately become follower. We still need to do
        // vote checking after this.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // Passive nodes never vote, and candidates unknown to the cluster are never granted
        // votes.
        if self.target_state.is_passive() || !self.membership.is_active(&msg.candidate_id) {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Check if candidate's log is at least as up-to-date as this node's.
        // If candidate's log is not at least as up-to-date as this node, then reject.
        if !self.is_log_up_to_date(msg.last_log_term, msg.last_log_index) {
            tracing::debug!({ candidate = msg.candidate_id }, "rejecting vote request as candidate's log is not up-to-date");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Candidate's log is up-to-date so handle voting conditions.
        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            None => {
                self.voted_for = Some(msg.candidate_id);
                self.set_target_state(State::Follower);
                self.update_next_election_timeout(false);
                self.save_hard_state().await?;
                tracing::debug!({candidate=msg.candidate_id, msg.term}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }

    /// An RPC invoked by prospective candidates probing whether an election could succeed.
    ///
    /// Acceptance is judged by the same up-to-date rule as a vote, but nothing is granted and no
    /// local state changes; in particular the term is untouched and the election timer is not
    /// reset.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_poll_request(&mut self, msg: PollRequest) -> RaftResult<PollResponse> {
        if msg.term < self.current_term {
            return Ok(PollResponse {
                term: self.current_term,
                accepted: false,
            });
        }

        // A current leader heartbeating within the election timeout is authoritative; polls
        // against it are refused so a flaky link cannot seed an election.
        if let Some(inst) = &self.last_heartbeat {
            let now = tokio::time::Instant::now();
            let delta = now.duration_since(*inst);
            if self.config.election_timeout >= delta.as_millis() as u64 {
                return Ok(PollResponse {
                    term: self.current_term,
                    accepted: false,
                });
            }
        }

        let accepted = !self.target_state.is_passive()
            && self.membership.is_active(&msg.candidate_id)
            && self.is_log_up_to_date(msg.last_log_term, msg.last_log_index);
        Ok(PollResponse {
            term: self.current_term,
            accepted,
        })
    }

    /// Whether a candidate's log, described by its last term & index, is at least as up-to-date
    /// as this node's (§5.4.1).
    ///
    /// An empty local log is always at most as up-to-date as anything.
    fn is_log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        last_log_term > self.last_log_id.term
            || (last_log_term == self.last_log_id.term && last_log_index >= self.last_log_id.index)
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Build a future for sending a `PollRequest` to all active peers in parallel.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_poll_requests(&self) -> mpsc::Receiver<(PollResponse, NodeId)> {
        let all_members: Vec<_> = self.core.membership.active.keys().copied().collect();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));
        for member in all_members.into_iter().filter(|member| member != &self.core.id) {
            let rpc = PollRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_poll(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::warn!({error=%err, peer=member}, "error sending Poll RPC to peer"),
                    }
                }
                .instrument(tracing::debug_span!("send_poll")),
            );
        }
        rx
    }

    /// Handle a poll response, returning `true` when the election attempt must restart.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) async fn handle_poll_response(&mut self, res: PollResponse, target: NodeId) -> RaftResult<bool> {
        // If a newer term is observed, the probed election is hopeless; revert to follower.
        if res.term > self.core.current_term {
            tracing::debug!({ res.term }, "reverting to follower state due to greater term observed in PollResponse");
            self.core.update_current_term(res.term, None);
            self.core.update_next_election_timeout(false);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            return Ok(true);
        }

        if res.accepted {
            self.polls_granted += 1;
        }
        Ok(false)
    }

    /// Build a future for sending a `VoteRequest` to all active peers in parallel.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_members: Vec<_> = self.core.membership.active.keys().copied().collect();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));
        for member in all_members.into_iter().filter(|member| member != &self.core.id) {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::warn!({error=%err, peer=member}, "error sending VoteRequest RPC to peer"),
                    }
                }
                .instrument(tracing::debug_span!("send_vote")),
            );
        }
        rx
    }

    /// Handle a vote response.
    #[tracing::instrument(level = "trace", skip(self, res), fields(peer=target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            tracing::debug!({ res.term }, "reverting to follower state due to greater term observed in VoteResponse");
            self.core.update_current_term(res.term, None);
            self.core.update_next_election_timeout(false);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                // If the campaign was successful, go into leader state.
                tracing::debug!("transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
            }
        }

        Ok(())
    }
}
