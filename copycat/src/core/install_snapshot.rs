//! Receiving a snapshot stream from the cluster leader (§7).
//!
//! A leader falls back to snapshot transfer when its log can no longer bring this node up to
//! date — the entries were dropped by compaction or a snapshot purge. Chunks arrive strictly in
//! order within one stream; a chunk at offset 0 always opens a fresh stream, superseding both a
//! half-received stream with a different id and any snapshot build running locally. Once the
//! final chunk lands, the storage layer swaps in the snapshot wholesale: state machine, client
//! sessions, and response caches all travel inside it, and the log is purged through the
//! snapshot's last id.

use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft_types::SnapshotId;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftError;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::SnapshotSegmentId;
use crate::Update;

/// A snapshot stream in the process of being received, chunk by chunk.
pub(super) struct SnapshotStream<S> {
    id: SnapshotId,
    /// The offset just past the last byte written.
    offset: u64,
    sink: Box<S>,
}

impl<S> SnapshotStream<S>
where S: tokio::io::AsyncWrite + tokio::io::AsyncSeek + Send + Unpin + 'static
{
    fn begin(id: SnapshotId, sink: Box<S>) -> Self {
        Self { id, offset: 0, sink }
    }

    fn is_for(&self, id: &str) -> bool {
        self.id == id
    }

    fn segment_id(&self) -> SnapshotSegmentId {
        SnapshotSegmentId {
            id: self.id.clone(),
            offset: self.offset,
        }
    }

    /// Write one chunk at its stated offset, seeking first if the stream was rewound.
    async fn accept(&mut self, req: &InstallSnapshotRequest) -> std::io::Result<()> {
        if req.offset != self.offset {
            self.sink.seek(std::io::SeekFrom::Start(req.offset)).await?;
            self.offset = req.offset;
        }
        self.sink.write_all(&req.data).await?;
        self.offset += req.data.len() as u64;
        Ok(())
    }

    fn into_sink(self) -> Box<S> {
        self.sink
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Invoked by the leader to stream chunks of a snapshot to this node (§7).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // A stale leader gets the current term and nothing else.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        // A snapshot stream is leader traffic like any append: it resets the election timer,
        // asserts the sender's leadership, and knocks a candidate or deposed leader back down.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }
        if self.target_state.is_candidate() || self.target_state.is_leader() {
            self.set_target_state(State::Follower);
        }
        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // Route the chunk into the stream it belongs to, or open a fresh one.
        let mut stream = match self.snapshot_state.take() {
            Some(SnapshotState::Streaming(stream)) if stream.is_for(&req.meta.snapshot_id) => stream,
            other => {
                // Only a first chunk may open a stream; anything else is out of order.
                if req.offset != 0 {
                    let expect = match other {
                        Some(SnapshotState::Streaming(stream)) => stream.segment_id(),
                        _ => SnapshotSegmentId {
                            id: req.meta.snapshot_id.clone(),
                            offset: 0,
                        },
                    };
                    return Err(RaftError::SnapshotMismatch {
                        expect,
                        got: SnapshotSegmentId {
                            id: req.meta.snapshot_id.clone(),
                            offset: req.offset,
                        },
                    });
                }
                // Installation from the leader supersedes a local snapshot build.
                if let Some(SnapshotState::Snapshotting { handle, .. }) = other {
                    handle.abort();
                }
                let sink =
                    self.storage.begin_receiving_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
                SnapshotStream::begin(req.meta.snapshot_id.clone(), sink)
            }
        };

        if let Err(err) = stream.accept(&req).await {
            // Keep the stream so the leader can rewind and resend the chunk.
            self.snapshot_state = Some(SnapshotState::Streaming(stream));
            return Err(err.into());
        }

        if req.done {
            self.finish_snapshot_installation(&req, stream).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming(stream));
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    /// Install a fully received snapshot.
    ///
    /// The storage layer replaces its state machine — sessions and cached responses included —
    /// and purges the log through the snapshot. The snapshot's metadata is then authoritative
    /// for this node: its membership becomes the cluster view, and the applied, committed, and
    /// compaction marks all jump to its last id.
    #[tracing::instrument(level = "debug", skip(self, req, stream), fields(snapshot_id=%req.meta.snapshot_id))]
    async fn finish_snapshot_installation(
        &mut self,
        req: &InstallSnapshotRequest,
        stream: SnapshotStream<S::SnapshotData>,
    ) -> RaftResult<()> {
        let mut sink = stream.into_sink();
        sink.as_mut().shutdown().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
        self.storage
            .finalize_snapshot_installation(&req.meta, sink)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        self.update_membership(req.meta.membership.clone())?;

        let last = req.meta.last_log_id;
        self.last_log_id = last;
        self.last_applied = last;
        self.snapshot_last_log_id = last;
        if self.commit_index < last.index {
            self.commit_index = last.index;
        }
        self.global_index = self.global_index.max(last.index);
        self.storage
            .set_commit_bounds(self.commit_index, self.global_index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        tracing::info!(last_log_id=%last, "snapshot installed");
        self.report_metrics(Update::Ignore);
        Ok(())
    }
}
