//! A replicated key/value store: the reference `RaftStorage` implementation for `copycat`.
//!
//! The log side delegates to `copycat`'s segmented on-disk log; the state machine is an
//! in-memory map with TTL expiration, wrapped in a session [`Executor`] which supplies
//! at-most-once command semantics and deterministic session expiry. Snapshots serialize the
//! whole executor (map, sessions, applied cursor) with bincode.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use copycat::raft::Entry;
use copycat::raft::Membership;
use copycat::sessions::Applied;
use copycat::sessions::Executor;
use copycat::sessions::StateMachine;
use copycat::storage::HardState;
use copycat::storage::InitialState;
use copycat::storage::Log;
use copycat::storage::LogOptions;
use copycat::storage::RaftStorage;
use copycat::storage::RaftStorageDebug;
use copycat::storage::Snapshot;
use copycat::storage::SnapshotMeta;
use copycat::Config;
use copycat::LogId;
use copycat::NodeId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

/// The operations clients may submit against the key/value store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum KvRequest {
    /// Store a value, optionally expiring after `ttl` milliseconds.
    Put {
        key: String,
        value: String,
        ttl: Option<u64>,
    },
    /// Read a value.
    Get { key: String },
    /// Remove a value.
    Delete { key: String },
    /// The number of live keys.
    Size,
}

impl copycat::AppData for KvRequest {}

/// The response to a [`KvRequest`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum KvResponse {
    /// The value read, removed, or displaced, if any.
    Value(Option<String>),
    /// The number of live keys.
    Size(usize),
}

impl copycat::AppDataResponse for KvResponse {}

/// The error used to trigger Raft shutdown from storage.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("unsafe storage error")]
    UnsafeStorageError,
}

/// A stored value with its optional expiration instant (ms-epoch, in entry time).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct KvValue {
    value: String,
    expires_at: Option<i64>,
}

/// The key/value state machine.
///
/// Time only moves when committed entries carry it forward: TTL eviction is judged against the
/// greatest entry timestamp applied so far, never the wall clock, so all replicas evict at the
/// same point in the log.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KvStateMachine {
    entries: BTreeMap<String, KvValue>,
    /// The greatest entry timestamp applied so far.
    now: i64,
}

impl KvStateMachine {
    fn is_live(&self, value: &KvValue) -> bool {
        value.expires_at.map(|at| at > self.now).unwrap_or(true)
    }

    /// Read a value, hiding expired entries.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).filter(|v| self.is_live(v)).map(|v| v.value.as_str())
    }

    /// The number of live keys.
    pub fn size(&self) -> usize {
        self.entries.values().filter(|v| self.is_live(v)).count()
    }

    fn evict(&mut self) {
        let now = self.now;
        self.entries.retain(|_, v| v.expires_at.map(|at| at > now).unwrap_or(true));
    }
}

impl StateMachine<KvRequest, KvResponse> for KvStateMachine {
    fn apply(&mut self, _index: u64, timestamp: i64, command: &KvRequest) -> Result<KvResponse> {
        if timestamp > self.now {
            self.now = timestamp;
            self.evict();
        }
        let res = match command {
            KvRequest::Put { key, value, ttl } => {
                let stored = KvValue {
                    value: value.clone(),
                    expires_at: ttl.map(|ttl| timestamp + ttl as i64),
                };
                let old = self.entries.insert(key.clone(), stored);
                KvResponse::Value(old.map(|v| v.value))
            }
            KvRequest::Get { key } => KvResponse::Value(self.get(key).map(String::from)),
            KvRequest::Delete { key } => {
                let old = self.entries.remove(key);
                KvResponse::Value(old.map(|v| v.value))
            }
            KvRequest::Size => KvResponse::Size(self.size()),
        };
        Ok(res)
    }

    fn query(&self, query: &KvRequest) -> Result<KvResponse> {
        let res = match query {
            KvRequest::Get { key } => KvResponse::Value(self.get(key).map(String::from)),
            KvRequest::Size => KvResponse::Size(self.size()),
            _ => anyhow::bail!("mutating operation submitted as a query"),
        };
        Ok(res)
    }
}

/// The snapshot object currently held by the store.
#[derive(Clone, Debug)]
pub struct KvSnapshot {
    pub meta: SnapshotMeta,
    /// The bincode serialized session executor (state machine included).
    pub data: Vec<u8>,
}

/// A key/value `RaftStorage` implementation: segmented log on disk, state machine in memory.
pub struct KvStore {
    id: NodeId,
    /// The segmented on-disk Raft log.
    log: Log<KvRequest>,
    /// The session executor wrapping the key/value state machine.
    sm: RwLock<Executor<KvRequest, KvResponse, KvStateMachine>>,
    /// The node's durable hard state file.
    hs_path: PathBuf,
    hs: RwLock<Option<HardState>>,
    /// The current snapshot, held in memory.
    current_snapshot: RwLock<Option<KvSnapshot>>,
    snapshot_idx: Mutex<u64>,
}

impl KvStore {
    /// Open (or create) the store for the given node under the config's storage directory.
    ///
    /// Each node uses its own subdirectory, so a cluster of nodes may share one configured
    /// directory in tests.
    pub fn new(id: NodeId, config: &Config) -> Result<Self> {
        let directory = config.storage_directory.join(format!("node-{}", id));
        let mut options = LogOptions::from_config(config);
        options.directory = directory.clone();
        let log = Log::open(options)?;

        let hs_path = directory.join(format!("{}.meta", config.cluster_name));
        let hs = match std::fs::read(&hs_path) {
            Ok(raw) => Some(bincode::deserialize(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            id,
            log,
            sm: RwLock::new(Executor::new(KvStateMachine::default(), config.session_timeout)),
            hs_path,
            hs: RwLock::new(hs),
            current_snapshot: RwLock::new(None),
            snapshot_idx: Mutex::new(0),
        })
    }

    /// The ID of this store's node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Search the log backwards for the most recent configuration-bearing entry.
    fn last_membership_in_log(&self) -> Result<Option<Membership>> {
        let mut index = self.log.last_index();
        let first = self.log.first_index();
        while index >= first && index > 0 {
            if let Some(entry) = self.log.get(index)? {
                if let Some(membership) = entry.membership() {
                    return Ok(Some(membership.clone()));
                }
            }
            index -= 1;
        }
        Ok(None)
    }
}

#[async_trait]
impl RaftStorage<KvRequest, KvResponse> for KvStore {
    type SnapshotData = Cursor<Vec<u8>>;
    type ShutdownError = ShutdownError;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership_config(&self) -> Result<Membership> {
        if let Some(membership) = self.last_membership_in_log()? {
            return Ok(membership);
        }
        if let Some(snapshot) = self.current_snapshot.read().await.as_ref() {
            return Ok(snapshot.meta.membership.clone());
        }
        Ok(Membership::default())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let sm = self.sm.read().await;
        let hs = self.hs.read().await.clone().unwrap_or_default();
        let mut last_log_id = self.log.last_log_id()?;
        if sm.last_applied().index > last_log_id.index {
            last_log_id = sm.last_applied();
        }
        Ok(InitialState {
            last_log_id,
            last_applied_log: sm.last_applied(),
            hard_state: hs,
            membership,
        })
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        std::fs::write(&self.hs_path, bincode::serialize(hs)?)?;
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<KvRequest>>> {
        let start = match range.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => start + 1,
            Bound::Unbounded => 0,
        };
        let stop = match range.end_bound() {
            Bound::Included(stop) => stop + 1,
            Bound::Excluded(stop) => *stop,
            Bound::Unbounded => self.log.last_index() + 1,
        };
        Ok(self.log.get_range(start, stop)?)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<KvRequest>>> {
        Ok(self.log.get(log_index)?)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_last_log_id(&self) -> Result<LogId> {
        Ok(self.log.last_log_id()?)
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let start = match range.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => start + 1,
            Bound::Unbounded => 1,
        };
        self.log.truncate(start.saturating_sub(1))?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[&Entry<KvRequest>]) -> Result<()> {
        for entry in entries {
            // Overwrites truncate first; each entry's index determines its location.
            if entry.log_id.index <= self.log.last_index() {
                self.log.truncate(entry.log_id.index - 1)?;
            }
            self.log.append(entry)?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<KvRequest>]) -> Result<Vec<Applied<KvResponse>>> {
        let mut sm = self.sm.write().await;
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            outcomes.push(sm.apply_entry(entry));
        }
        // Entries whose effect is now superseded are fodder for the compactor.
        for index in sm.drain_cleanable() {
            self.log.mark_clean(index);
        }
        Ok(outcomes)
    }

    #[tracing::instrument(level = "trace", skip(self, query))]
    async fn query(&self, query: &KvRequest) -> Result<KvResponse> {
        self.sm.read().await.query(query)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn set_commit_bounds(&self, commit_index: u64, global_index: u64) -> Result<()> {
        self.log.set_commit_bounds(commit_index, global_index);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn compact_log(&self) -> Result<()> {
        let report = self.log.compact()?;
        if report.dropped > 0 {
            tracing::debug!(?report, "segment compaction reclaimed entries");
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied);
        {
            let sm = self.sm.read().await;
            data = bincode::serialize(&*sm)?;
            last_applied = sm.last_applied();
        }
        let membership = self.get_membership_config().await?;

        let snapshot_id = {
            let mut snapshot_idx = self.snapshot_idx.lock().await;
            *snapshot_idx += 1;
            format!("{}-{}-{}", last_applied.term, last_applied.index, snapshot_idx)
        };
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            membership,
            snapshot_id,
        };

        {
            let mut current_snapshot = self.current_snapshot.write().await;
            *current_snapshot = Some(KvSnapshot {
                meta: meta.clone(),
                data: data.clone(),
            });
        }

        // The log prefix covered by the snapshot is now redundant.
        self.log.purge_to(last_applied)?;

        tracing::debug!(snapshot_id=%meta.snapshot_id, "snapshot complete");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        let raw = snapshot.into_inner();
        let new_sm: Executor<KvRequest, KvResponse, KvStateMachine> = bincode::deserialize(&raw)?;
        {
            let mut sm = self.sm.write().await;
            *sm = new_sm;
        }
        {
            let mut current_snapshot = self.current_snapshot.write().await;
            *current_snapshot = Some(KvSnapshot {
                meta: meta.clone(),
                data: raw,
            });
        }

        // Everything the snapshot covers is purged from the log.
        self.log.restore_purge_mark(meta.last_log_id);
        self.log.purge_to(meta.last_log_id)?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(Snapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RaftStorageDebug<KvStateMachine> for KvStore {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> KvStateMachine {
        self.sm.read().await.machine().clone()
    }

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copycat::raft::CommandEntry;
    use copycat::raft::EntryPayload;
    use copycat::raft::RegisterEntry;

    fn config(dir: &std::path::Path) -> Config {
        Config::build("kvtest".into()).storage_directory(dir.to_path_buf()).validate().unwrap()
    }

    fn put(key: &str, value: &str, ttl: Option<u64>) -> KvRequest {
        KvRequest::Put {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    fn command_entry(index: u64, request: u64, timestamp: i64, command: KvRequest) -> Entry<KvRequest> {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Command(CommandEntry {
                session: 1,
                request,
                response: 0,
                timestamp,
                command,
            }),
        }
    }

    fn register_entry(index: u64, timestamp: i64) -> Entry<KvRequest> {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Register(RegisterEntry {
                address: copycat::Address::new("client", 7000),
                timestamp,
            }),
        }
    }

    #[tokio::test]
    async fn test_apply_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(1, &config(dir.path())).unwrap();

        let entries = vec![
            register_entry(1, 0),
            command_entry(2, 1, 10, put("foo", "bar", None)),
        ];
        let refs: Vec<_> = entries.iter().collect();
        let outcomes = store.apply_to_state_machine(&refs).await.unwrap();
        assert!(matches!(outcomes[0], Applied::Registered { session: 1 }));
        match &outcomes[1] {
            Applied::Response { result } => assert_eq!(result.clone().unwrap(), KvResponse::Value(None)),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let res = store.query(&KvRequest::Get { key: "foo".into() }).await.unwrap();
        assert_eq!(res, KvResponse::Value(Some("bar".into())));
    }

    #[tokio::test]
    async fn test_ttl_eviction_is_driven_by_entry_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(1, &config(dir.path())).unwrap();

        let entries = vec![
            register_entry(1, 0),
            command_entry(2, 1, 0, put("foo", "v", Some(1000))),
        ];
        let refs: Vec<_> = entries.iter().collect();
        store.apply_to_state_machine(&refs).await.unwrap();

        // Within the TTL the value is visible.
        let res = store.query(&KvRequest::Get { key: "foo".into() }).await.unwrap();
        assert_eq!(res, KvResponse::Value(Some("v".into())));

        // Later entries drive the state machine clock past the TTL.
        let later = vec![command_entry(3, 2, 3000, put("other", "x", None))];
        let refs: Vec<_> = later.iter().collect();
        store.apply_to_state_machine(&refs).await.unwrap();

        let res = store.query(&KvRequest::Get { key: "foo".into() }).await.unwrap();
        assert_eq!(res, KvResponse::Value(None));
        let res = store.query(&KvRequest::Size).await.unwrap();
        assert_eq!(res, KvResponse::Size(1));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(1, &config(dir.path())).unwrap();

        let entry = register_entry(1, 0);
        let cmd = command_entry(2, 1, 10, put("foo", "bar", None));
        store.append_to_log(&[&entry, &cmd]).await.unwrap();
        let refs = vec![&entry, &cmd];
        store.apply_to_state_machine(&refs).await.unwrap();

        let snapshot = store.do_log_compaction().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 2));

        // The snapshot prefix is purged from the log.
        assert!(store.try_get_log_entry(2).await.unwrap().is_none());

        // Install the snapshot into a second, blank store.
        let dir2 = tempfile::tempdir().unwrap();
        let other = KvStore::new(2, &config(dir2.path())).unwrap();
        let data = match store.get_current_snapshot().await.unwrap() {
            Some(current) => current.snapshot.into_inner(),
            None => panic!("snapshot missing"),
        };
        other.finalize_snapshot_installation(&snapshot.meta, Box::new(Cursor::new(data))).await.unwrap();

        let machine = other.get_state_machine().await;
        assert_eq!(machine.get("foo"), Some("bar"));

        // Sessions travel with the snapshot: a duplicate command replays its cached response.
        let dup = command_entry(3, 1, 20, put("foo", "bar", None));
        let outcomes = other.apply_to_state_machine(&[&dup]).await.unwrap();
        match &outcomes[0] {
            Applied::Response { result } => assert_eq!(result.clone().unwrap(), KvResponse::Value(None)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hard_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let store = KvStore::new(1, &cfg).unwrap();
            store
                .save_hard_state(&HardState {
                    current_term: 3,
                    voted_for: Some(42),
                })
                .await
                .unwrap();
        }
        let store = KvStore::new(1, &cfg).unwrap();
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.hard_state.current_term, 3);
        assert_eq!(state.hard_state.voted_for, Some(42));
    }
}
