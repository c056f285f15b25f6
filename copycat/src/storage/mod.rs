//! The Raft storage interface and the segmented log which backs it.

mod buffer;
mod codec;
mod compaction;
mod descriptor;
mod index;
mod log;
mod segment;

use std::error::Error;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

pub use buffer::Buffer;
pub use buffer::BufferPool;
pub(crate) use descriptor::ms_since_epoch;
pub use codec::decode_entry;
pub use compaction::CompactionReport;
pub use codec::encode_entry;
pub use codec::entry_type;
pub use descriptor::Descriptor;
pub use index::OffsetIndex;
pub use log::Log;
pub use log::LogOptions;
pub use segment::Segment;

use crate::raft::Entry;
use crate::raft::Membership;
use crate::raft_types::SnapshotId;
use crate::sessions::Applied;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;

/// Error variants produced by the segmented log.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A short read, bad magic, or CRC mismatch.
    ///
    /// During recovery a corrupt frame terminates a segment's valid prefix; at any other time it
    /// is fatal.
    #[error("corrupt segment: {0}")]
    Corrupt(String),
    #[error("entry of {size} bytes exceeds the configured max entry size of {max}")]
    EntryTooLarge { size: usize, max: u32 },
    #[error("entry codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("index {index} is outside the bounds of the log")]
    OutOfBounds { index: u64 },
}

/// The result type of segmented log operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SnapshotMeta {
    /// Log entries upto which this snapshot includes, inclusive.
    pub last_log_id: LogId,

    /// The latest membership configuration covered by the snapshot.
    pub membership: Membership,

    /// To identify a snapshot when transferring.
    /// Caveat: even when two snapshot is built with the same `last_log_id`, they still could be different in bytes.
    pub snapshot_id: SnapshotId,
}

/// The data associated with the current snapshot.
pub struct Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// metadata of a snapshot
    pub meta: SnapshotMeta,

    /// A read handle to the associated snapshot.
    pub snapshot: Box<S>,
}

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<crate::NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The last entry.
    pub last_log_id: LogId,

    /// The LogId of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest cluster membership configuration found in the log or snapshot, else an empty
    /// config awaiting initialization.
    pub membership: Membership,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId { term: 0, index: 0 },
            last_applied_log: LogId { term: 0, index: 0 },
            hard_state: HardState {
                current_term: 0,
                voted_for: None,
            },
            membership: Membership::default(),
        }
    }
}

/// A trait defining the interface for a Raft storage system.
///
/// The log side of this trait is canonically implemented by wrapping [`Log`], the segmented
/// append-only log in this module. The state machine side is application specific; embedding a
/// [`crate::sessions::Executor`] over the application state machine supplies the session-aware
/// semantics Raft requires (at-most-once command application, deterministic session expiry).
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The storage engine's associated type used for exposing a snapshot for reading & writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// The error type used to indicate to Raft that shutdown is needed when calling the
    /// `apply_to_state_machine` method.
    ///
    /// This error type is only considered for the `apply_to_state_machine` method as it is
    /// the only method which is allowed to return errors normally as part of application logic.
    ///
    /// For all other methods of this trait, returning an error will cause Raft to shutdown.
    type ShutdownError: Error + Send + Sync + 'static;

    /// Get the latest membership config found in the log or snapshot.
    ///
    /// This must always be implemented as a reverse search through the log to find the most
    /// recent membership config to be appended to the log, falling back to the config recorded
    /// in the current snapshot, and finally to an empty config for a pristine node.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_membership_config(&self) -> Result<Membership>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system to
    /// fetch the last known state from stable storage. If no such entry exists due to being the
    /// first time the node has come online, then `InitialState::new_initial` should be used.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive: `[start, stop)`.
    ///
    /// Entries dropped by compaction are simply absent from the result.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get a log entry.
    ///
    /// It does not return an error if the log entry at `log_index` is not found; compacted and
    /// purged entries yield `None`.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Returns the last known log id.
    /// It could be the id of the last entry in log, or the last applied id that is saved in state machine.
    ///
    /// When there is no log or state machine, it returns (0,0)
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Delete all logs in a `range`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be used to
    /// determine its location to be written in the log.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Apply the given payload of committed entries to the state machine, in index order.
    ///
    /// The Raft protocol guarantees that only logs which have been _committed_, that is, logs
    /// which have been replicated to a majority of the cluster, will be applied to the state
    /// machine. Session bookkeeping (registration, keep-alives, duplicate command replay,
    /// deterministic expiry) happens here; embedding a [`crate::sessions::Executor`] supplies it.
    ///
    /// Entries whose effect is superseded once applied (old keep-alives, purged command
    /// responses) should be marked clean in the log so compaction can drop them.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown unless the error is
    /// an instance of `ShutdownError`, which is always fatal.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<Applied<R>>>;

    /// Apply a read-only query against the state machine at its current version.
    ///
    /// Never mutates state machine or session state. Errors are surfaced to the submitter as
    /// application errors; they do not destabilize Raft.
    async fn query(&self, query: &D) -> Result<R>;

    /// Record the commit index and the global (minimum match) index on the log.
    ///
    /// These are advisory marks consumed by the compactor: compaction never crosses either
    /// boundary.
    async fn set_commit_bounds(&self, commit_index: u64, global_index: u64) -> Result<()>;

    /// Run segment compaction over the log, honoring the bounds last recorded via
    /// `set_commit_bounds`.
    ///
    /// Errors returned from this method will be logged and retried.
    async fn compact_log(&self) -> Result<()>;

    /// Build a snapshot of the state machine, returning a handle to the generated snapshot.
    ///
    /// ### implementation guide
    /// When performing log compaction, the compaction can only cover the breadth of the log up to
    /// the last applied log and under write load this value may change quickly. As such, the
    /// storage implementation should export/checkpoint/snapshot its state machine (including its
    /// session executor), and then use the value of that export's last applied log as the
    /// metadata indicating the breadth of the log covered by the snapshot.
    ///
    /// Errors returned from this method will be logged and retried.
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>>;

    /// Create a new blank snapshot, returning a writable handle to the snapshot object.
    ///
    /// Raft will use this handle to receive snapshot data.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>>;

    /// Finalize the installation of a snapshot which has finished streaming from the cluster leader.
    ///
    /// Replace the state machine (and its sessions) with the snapshot contents, then purge the
    /// log of all entries through `meta.last_log_id.index`. All other snapshots should be deleted
    /// at this point.
    ///
    /// ### snapshot
    /// A snapshot created from an earlier call to `begin_receiving_snapshot` which provided the
    /// snapshot. By the time ownership of the snapshot object is returned here, its
    /// `AsyncWriteExt.shutdown()` method will have been called, so no additional writes should be
    /// made to the snapshot.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()>;

    /// Get a readable handle to the current snapshot, along with its metadata.
    ///
    /// ### implementation algorithm
    /// Implementing this method should be straightforward. Check the configured snapshot
    /// directory for any snapshot files. A proper implementation will only ever have one
    /// active snapshot, though another may exist while it is being created. As such, it is
    /// recommended to use a file naming pattern which will allow for easily distinguishing between
    /// the current live snapshot, and any new snapshot which is being created.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> SM;

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState>;
}
