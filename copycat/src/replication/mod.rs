//! Per-peer log replication.
//!
//! The leader runs one replica task per cluster member. A replica owns the peer's
//! `next_index`/`matched` bookkeeping and pulls entry batches straight out of storage, so the
//! leader never queues payloads per peer: appending an entry just nudges every replica with the
//! new log tail, and each replica catches its target up at whatever pace the target can absorb.
//!
//! At most one AppendEntries RPC is ever outstanding per peer — a replica awaits each RPC
//! in-line before building the next batch — so the target observes batches strictly in index
//! order. Every successful acknowledgement, heartbeats included, is reported back to the leader,
//! which uses the acknowledgement times as its leadership lease clock.
//!
//! A replica leaves the replicating state only to stream a snapshot: either the target is so far
//! behind the commit index that replaying the log is wasteful, or the entries it needs have been
//! dropped by compaction or a snapshot purge.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeek;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// The leader's handle to a spawned replica task.
pub(crate) struct ReplicationStream {
    /// The channel used for nudging the replica task.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent, Span)>,
}

impl ReplicationStream {
    /// Spawn a replica task for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        global_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    ) -> Self {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let replica = Replica {
            id,
            target,
            term,
            network,
            storage,
            state: ReplState::Replicating,
            last_log_index: last_log.index,
            commit_index,
            global_index,
            // Optimistic: assume the target matches our log and let the first probe correct us.
            next_index: last_log.index + 1,
            matched: last_log,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            install_snapshot_timeout: Duration::from_millis(config.install_snapshot_timeout),
            config,
            _marker: std::marker::PhantomData,
        };
        tokio::spawn(replica.run().instrument(tracing::debug_span!("replica")));
        ReplicationStream { repl_tx }
    }
}

/// A nudge from the Raft leader to a replica task.
///
/// Carries bookkeeping only — never entries. The replica pulls what it needs from storage, so a
/// slow peer cannot make the leader hold memory on its behalf.
pub(crate) enum RaftEvent {
    /// The log tail, the commit index, or the global index moved.
    Notify {
        last_log_index: u64,
        commit_index: u64,
        global_index: u64,
    },
    Terminate,
}

/// An event coming from a replica task.
pub(crate) enum ReplicaEvent<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// The target acknowledged replication through `matched`.
    ///
    /// Sent on every successful AppendEntries acknowledgement, heartbeats included, so the core
    /// can maintain its leadership lease clock alongside the commit calculation.
    UpdateMatched {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The most recent log id known to have been successfully replicated on the target.
        matched: LogId,
    },
    /// The target answered with a greater term; the leader must revert to follower.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// The target needs a snapshot; the log can no longer bring it up to date.
    NeedsSnapshot {
        /// The ID of the target node from which the event was sent.
        target: NodeId,
        /// The response channel for delivering the snapshot data.
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}

impl<S: AsyncRead + AsyncSeek + Send + Unpin + 'static> MessageSummary for ReplicaEvent<S> {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatched {
                ref target,
                ref matched,
            } => {
                format!("UpdateMatched: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RevertToFollower { ref target, ref term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { ref target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplState {
    /// Shipping log entries (or heartbeats when the target is caught up).
    Replicating,
    /// The log cannot serve the target; a snapshot is being streamed instead.
    Snapshot,
    Shutdown,
}

/// The task replicating the leader's log to a single peer.
struct Replica<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target peer.
    target: NodeId,
    /// The leader's term; a replica never outlives its leader's term.
    term: u64,

    network: Arc<N>,
    storage: Arc<S>,
    config: Arc<Config>,

    state: ReplState,

    /// The index of the newest entry in the leader's log.
    last_log_index: u64,
    /// The leader's commit index, forwarded on every payload.
    commit_index: u64,
    /// The leader's global (minimum match) index, forwarded for compaction safety.
    global_index: u64,
    /// The index of the next entry to ship to the target (§5.3).
    ///
    /// Starts just past the leader's tail and walks backwards on rejection — directly via the
    /// target's conflict hint when one is provided, one index at a time otherwise — until the
    /// logs agree.
    next_index: u64,
    /// The newest log id known to be replicated on the target.
    matched: LogId,

    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent, Span)>,

    heartbeat: Interval,
    heartbeat_timeout: Duration,
    install_snapshot_timeout: Duration,

    _marker: std::marker::PhantomData<fn() -> (D, R)>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Replica<D, R, N, S> {
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn run(mut self) {
        // Probe immediately so the leader learns where this peer's log stands.
        self.replicate().await;

        loop {
            match self.state {
                ReplState::Replicating => self.replicate_loop().await,
                ReplState::Snapshot => self.snapshot_loop().await,
                ReplState::Shutdown => return,
            }
        }
    }

    /// Whether the target still lacks entries the leader holds.
    fn behind(&self) -> bool {
        self.next_index <= self.last_log_index
    }

    /// Whether the target is so far behind the committed tail that replaying the log is
    /// wasteful and a snapshot should be streamed instead.
    fn needs_snapshot(&self) -> bool {
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        self.commit_index.saturating_sub(self.matched.index) >= *threshold
    }

    /// Report the current matched id to the leader.
    fn report_matched(&self) {
        let _ = self.raft_core_tx.send((
            ReplicaEvent::UpdateMatched {
                target: self.target,
                matched: self.matched,
            },
            tracing::debug_span!("CH"),
        ));
    }

    /// Fold every queued nudge from the leader into the replica's bookkeeping.
    ///
    /// Returns `true` if the log tail or the commit index moved, in which case a fresh
    /// replication round should follow promptly rather than waiting out the heartbeat.
    fn drain_events(&mut self, first: (RaftEvent, Span)) -> bool {
        let mut moved = false;
        let mut next = Some(first);
        while let Some((event, span)) = next {
            let _ent = span.enter();
            match event {
                RaftEvent::Notify {
                    last_log_index,
                    commit_index,
                    global_index,
                } => {
                    moved |= last_log_index > self.last_log_index || commit_index > self.commit_index;
                    self.last_log_index = self.last_log_index.max(last_log_index);
                    self.commit_index = self.commit_index.max(commit_index);
                    self.global_index = self.global_index.max(global_index);
                }
                RaftEvent::Terminate => {
                    self.state = ReplState::Shutdown;
                    return false;
                }
            }
            next = self.repl_rx.recv().now_or_never().flatten();
        }
        moved
    }

    /// Absorb anything the leader sent while an RPC was in flight.
    fn drain_pending_events(&mut self) {
        if let Some(event) = self.repl_rx.recv().now_or_never().flatten() {
            self.drain_events(event);
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "replicating"))]
    async fn replicate_loop(&mut self) {
        loop {
            if self.state != ReplState::Replicating {
                return;
            }

            // A target with entries outstanding is driven at full tilt; only a caught-up (or
            // unreachable) target waits on the heartbeat.
            if self.behind() && self.replicate().await {
                self.drain_pending_events();
                continue;
            }
            if self.state != ReplState::Replicating {
                return;
            }

            let span = tracing::debug_span!("CHrx:Replicating");
            let _ent = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.replicate().await;
                }
                event = self.repl_rx.recv() => match event {
                    Some(event) => {
                        if self.drain_events(event) {
                            self.replicate().await;
                        }
                    }
                    None => self.state = ReplState::Shutdown,
                },
            }
        }
    }

    /// Run one replication round: build a payload, send it, fold in the response.
    ///
    /// The RPC is awaited in-line, so at most one append is ever outstanding per peer and the
    /// target applies payloads strictly in index order. Returns `true` if the round moved the
    /// target's bookkeeping; `false` on transport trouble or a state change, telling the caller
    /// to back off to the heartbeat instead of hammering the target.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn replicate(&mut self) -> bool {
        let entries = match self.next_payload().await {
            Some(entries) => entries,
            // The replica is leaving the replicating state.
            None => return false,
        };
        let last_sent = entries.last().map(|entry| entry.log_id);

        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            entries,
            leader_commit: self.commit_index,
            global_index: self.global_index,
        };

        let res = match timeout(self.heartbeat_timeout, self.network.send_append_entries(self.target, rpc)).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                return false;
            }
            Err(_) => {
                tracing::warn!("timeout while sending AppendEntries RPC to target");
                return false;
            }
        };

        if res.term > self.term {
            tracing::debug!({ res.term }, "target has a newer term, reverting to follower");
            let _ = self.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.state = ReplState::Shutdown;
            return false;
        }

        if res.success {
            if let Some(log_id) = last_sent {
                self.matched = log_id;
                self.next_index = log_id.index + 1;
            }
            // Every acknowledgement — heartbeats included — refreshes the leader's lease clock.
            self.report_matched();
            return true;
        }

        // Rejected: walk back per the target's conflict hint, else decrement and retry (§5.3).
        match res.conflict_opt {
            Some(conflict) if conflict.log_id.index <= self.last_log_index => {
                self.next_index = conflict.log_id.index + 1;
                self.matched = conflict.log_id;
            }
            Some(conflict) => {
                tracing::warn!(?conflict, "target reported a conflict beyond the leader's log");
                return false;
            }
            None => {
                self.next_index = self.next_index.saturating_sub(1).max(1);
                self.matched = LogId {
                    term: 0,
                    index: self.next_index - 1,
                };
            }
        }

        // Align the matched term with the local entry. A missing entry means the prefix has
        // been compacted or purged, and the log can no longer serve this target.
        if self.matched.index > 0 {
            match self.storage.try_get_log_entry(self.matched.index).await {
                Ok(Some(entry)) => self.matched.term = entry.log_id.term,
                Ok(None) => self.state = ReplState::Snapshot,
                Err(err) => {
                    tracing::error!(error=?err, "error reading log entry at the conflict point");
                    let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                    self.state = ReplState::Shutdown;
                    return false;
                }
            }
        }
        self.report_matched();
        self.state == ReplState::Replicating
    }

    /// Build the next payload: entries from `next_index` bounded by the configured entry and
    /// byte budgets, or an empty heartbeat when the target is caught up.
    ///
    /// Returns `None` when the replica must leave the replicating state — the target needs a
    /// snapshot, or storage failed.
    async fn next_payload(&mut self) -> Option<Vec<Entry<D>>> {
        if !self.behind() {
            return Some(Vec::new());
        }
        if self.needs_snapshot() {
            self.state = ReplState::Snapshot;
            return None;
        }

        let stop = self.last_log_index.min(self.next_index + self.config.max_payload_entries - 1);
        let mut entries = match self.storage.get_log_entries(self.next_index..=stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error fetching log entries for replication");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.state = ReplState::Shutdown;
                return None;
            }
        };

        // The range must be fully present: compaction holes and snapshot purges leave gaps the
        // log cannot replay, which forces the snapshot path.
        let contiguous = entries.len() as u64 == stop - self.next_index + 1
            && entries.first().map(|entry| entry.log_id.index == self.next_index).unwrap_or(false);
        if !contiguous {
            self.state = ReplState::Snapshot;
            return None;
        }

        // Bound the payload by bytes, always admitting at least one entry so a single large
        // entry can still make progress.
        let mut bytes: u64 = 0;
        let mut keep = 0usize;
        for entry in &entries {
            let size = bincode::serialized_size(entry).unwrap_or(0);
            if keep > 0 && bytes + size > self.config.max_payload_bytes {
                break;
            }
            bytes += size;
            keep += 1;
        }
        entries.truncate(keep);
        Some(entries)
    }

    /// A bare heartbeat, sent while a snapshot is being prepared or streamed so the target's
    /// election timer stays at bay. Rejections are ignored; only a newer term matters here.
    async fn send_heartbeat(&mut self) {
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            entries: Vec::new(),
            leader_commit: self.commit_index,
            global_index: self.global_index,
        };
        if let Ok(Ok(res)) = timeout(self.heartbeat_timeout, self.network.send_append_entries(self.target, rpc)).await
        {
            if res.term > self.term {
                let _ = self.raft_core_tx.send((
                    ReplicaEvent::RevertToFollower {
                        target: self.target,
                        term: res.term,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.state = ReplState::Shutdown;
            } else if res.success {
                self.report_matched();
            }
        }
    }

    /// Obtain a snapshot from the leader and stream it to the target.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshot"))]
    async fn snapshot_loop(&mut self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.raft_core_tx.send((
            ReplicaEvent::NeedsSnapshot {
                target: self.target,
                tx,
            },
            tracing::debug_span!("CH"),
        ));

        let snapshot = match self.await_snapshot(rx).await {
            Some(snapshot) => snapshot,
            // Shutdown, or the snapshot never arrived; the outer loop re-requests if the
            // replica is still in the snapshot state.
            None => return,
        };

        if let Err(err) = self.stream_snapshot(snapshot).await {
            tracing::warn!(error=%err, "error streaming snapshot to target");
        }
    }

    /// Wait for the core to hand over a snapshot, heartbeating the target in the meantime.
    async fn await_snapshot(&mut self, mut rx: oneshot::Receiver<Snapshot<S::SnapshotData>>) -> Option<Snapshot<S::SnapshotData>> {
        loop {
            if self.state != ReplState::Snapshot {
                return None;
            }

            let span = tracing::debug_span!("CHrx:AwaitSnapshot");
            let _ent = span.enter();

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_heartbeat().await,
                event = self.repl_rx.recv() => match event {
                    Some(event) => {
                        self.drain_events(event);
                    }
                    None => {
                        self.state = ReplState::Shutdown;
                        return None;
                    }
                },
                res = &mut rx => return res.ok(),
            }
        }
    }

    /// Stream the snapshot to the target in chunks (§7).
    ///
    /// Once the final chunk is acknowledged the target holds everything through the snapshot,
    /// so the replica reports the snapshot id as matched and resumes log replication from just
    /// past it.
    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(snapshot_id=%snapshot.meta.snapshot_id))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot<S::SnapshotData>) -> RaftResult<()> {
        let total = snapshot.snapshot.seek(SeekFrom::End(0)).await?;
        snapshot.snapshot.seek(SeekFrom::Start(0)).await?;

        let mut offset = 0u64;
        let mut buf = Vec::with_capacity(self.config.snapshot_max_chunk_size as usize);

        loop {
            if self.state != ReplState::Snapshot {
                return Ok(());
            }

            let n_read = snapshot.snapshot.read_buf(&mut buf).await?;
            let done = offset + n_read as u64 == total;

            let rpc = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: snapshot.meta.clone(),
                offset,
                data: buf[..n_read].to_vec(),
                done,
            };
            buf.clear();

            tracing::debug!(offset, chunk = n_read, total, done, "sending snapshot chunk");

            let res = match timeout(
                self.install_snapshot_timeout,
                self.network.send_install_snapshot(self.target, rpc),
            )
            .await
            {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                    snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
                    self.heartbeat.tick().await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!("timeout while sending InstallSnapshot RPC to target");
                    snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
                    self.heartbeat.tick().await;
                    continue;
                }
            };

            if res.term > self.term {
                let _ = self.raft_core_tx.send((
                    ReplicaEvent::RevertToFollower {
                        target: self.target,
                        term: res.term,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.state = ReplState::Shutdown;
                return Ok(());
            }

            if done {
                self.matched = snapshot.meta.last_log_id;
                self.next_index = self.matched.index + 1;
                self.report_matched();
                self.state = ReplState::Replicating;
                return Ok(());
            }

            offset += n_read as u64;
            self.drain_pending_events();
        }
    }
}
