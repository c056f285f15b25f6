//! Client sessions and the session-aware state machine executor.
//!
//! Committed entries are applied in index order, exactly once per replica. Sessions give
//! commands at-most-once semantics: every command carries `(session, request, response)`
//! sequence numbers, duplicates replay the cached response instead of re-invoking the state
//! machine, and acknowledged responses are purged. All liveness decisions are made against
//! entry timestamps, never wall-clock, so every replica expires a session at exactly the same
//! point in the log.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::raft::Address;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;

/// The application state machine which commands mutate and queries observe.
///
/// Implementations must be deterministic: applying the same committed entries in the same order
/// must produce the same state and the same responses on every replica. Time-dependent behavior
/// must be driven by the entry timestamps passed in, never by reading a clock.
pub trait StateMachine<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Apply a mutating command at the given log index and leader timestamp.
    ///
    /// Errors are cached and surfaced to the submitter like any response; they do not
    /// destabilize Raft.
    fn apply(&mut self, index: u64, timestamp: i64, command: &D) -> anyhow::Result<R>;

    /// Apply a read-only query against current state.
    fn query(&self, query: &D) -> anyhow::Result<R>;
}

/// The outcome of applying one committed entry.
#[derive(Clone, Debug)]
pub enum Applied<R> {
    /// A no-op, configuration, or already-applied entry with no client-visible result.
    NoOp,
    /// A membership entry took effect.
    Configuration,
    /// A session was created.
    Registered { session: u64 },
    /// A session keep-alive took effect.
    KeptAlive { session: u64 },
    /// A command was applied (or replayed from the response cache).
    Response { result: Result<R, String> },
    /// A query ordered through the log was applied.
    Queried { result: Result<R, String> },
    /// The entry referenced a session this replica does not know (typically expired).
    SessionUnknown { session: u64 },
    /// The command was a duplicate whose cached response has already been purged.
    ResponseEvicted { session: u64, request: u64 },
}

/// A response cached for duplicate command replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "R: Serialize", deserialize = "R: serde::de::DeserializeOwned"))]
pub struct CachedResponse<R> {
    /// The index of the command entry which produced the response.
    pub index: u64,
    /// The cached result, errors included: a duplicate must observe the same outcome.
    pub result: Result<R, String>,
}

/// A client session, created by a `Register` entry and kept alive by `KeepAlive` entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "R: Serialize", deserialize = "R: serde::de::DeserializeOwned"))]
pub struct Session<R> {
    /// The session id: the index of the `Register` entry which created it.
    pub id: u64,
    /// The address of the owning client.
    pub address: Address,
    /// The entry timestamp of the session's most recent keep-alive (or registration).
    pub last_keep_alive: i64,
    /// The index of the entry behind `last_keep_alive`; cleanable once superseded.
    keep_alive_index: u64,
    /// The highest command request sequence applied for this session.
    pub sequence: u64,
    /// Cached responses for duplicate replay, keyed by request sequence.
    responses: BTreeMap<u64, CachedResponse<R>>,
}

/// The session-aware executor wrapping an application state machine.
///
/// Storage implementations embed one of these and drive `apply_entry` from
/// `RaftStorage::apply_to_state_machine`. The executor serializes with serde, so a snapshot of
/// the storage layer naturally captures sessions, cached responses, and the applied cursor
/// alongside the application state.
#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "R: Serialize, M: Serialize",
    deserialize = "R: serde::de::DeserializeOwned, M: serde::de::DeserializeOwned"
))]
pub struct Executor<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    /// The session timeout in ms, compared against entry timestamps.
    session_timeout: i64,
    sessions: BTreeMap<u64, Session<R>>,
    last_applied: LogId,
    machine: M,
    /// Indexes of entries whose effect has been superseded; drained by the storage layer into
    /// the log's cleanable set.
    #[serde(skip)]
    cleanable: Vec<u64>,
    #[serde(skip)]
    _marker: std::marker::PhantomData<fn() -> D>,
}

impl<D, R, M> Executor<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    pub fn new(machine: M, session_timeout: u64) -> Self {
        Self {
            session_timeout: session_timeout as i64,
            sessions: BTreeMap::new(),
            last_applied: LogId::default(),
            machine,
            cleanable: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// The id of the last entry applied.
    pub fn last_applied(&self) -> LogId {
        self.last_applied
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    /// The number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: u64) -> Option<&Session<R>> {
        self.sessions.get(&id)
    }

    /// Drain the indexes of entries whose effect has been superseded since the last drain.
    pub fn drain_cleanable(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.cleanable)
    }

    /// Apply a read-only query against the state machine, outside the log.
    pub fn query(&self, query: &D) -> anyhow::Result<R> {
        self.machine.query(query)
    }

    /// Apply one committed entry.
    ///
    /// Entries at or below the applied cursor are ignored, keeping application idempotent in
    /// the face of replays after leader changes.
    pub fn apply_entry(&mut self, entry: &Entry<D>) -> Applied<R> {
        if entry.log_id.index <= self.last_applied.index {
            tracing::debug!(index = entry.log_id.index, "entry already applied, skipping");
            return Applied::NoOp;
        }
        self.last_applied = entry.log_id;

        let index = entry.log_id.index;
        match &entry.payload {
            EntryPayload::NoOp => Applied::NoOp,
            EntryPayload::Configuration(_) => Applied::Configuration,
            EntryPayload::Join(_) | EntryPayload::Leave(_) | EntryPayload::Promote(_) | EntryPayload::Demote(_) => {
                Applied::Configuration
            }
            EntryPayload::Register(reg) => {
                self.expire_sessions(reg.timestamp);
                self.sessions.insert(index, Session {
                    id: index,
                    address: reg.address.clone(),
                    last_keep_alive: reg.timestamp,
                    keep_alive_index: index,
                    sequence: 0,
                    responses: BTreeMap::new(),
                });
                Applied::Registered { session: index }
            }
            EntryPayload::KeepAlive(ka) => {
                self.expire_sessions(ka.timestamp);
                match self.sessions.get_mut(&ka.session) {
                    Some(session) => {
                        // The previous keep-alive no longer matters, but the register entry is
                        // the session's identity and is kept until the session dies.
                        if session.keep_alive_index != session.id {
                            self.cleanable.push(session.keep_alive_index);
                        }
                        session.last_keep_alive = ka.timestamp;
                        session.keep_alive_index = index;
                        Applied::KeptAlive { session: ka.session }
                    }
                    None => {
                        self.cleanable.push(index);
                        Applied::SessionUnknown { session: ka.session }
                    }
                }
            }
            EntryPayload::Command(cmd) => {
                let session = match self.sessions.get_mut(&cmd.session) {
                    Some(session) => session,
                    None => {
                        self.cleanable.push(index);
                        return Applied::SessionUnknown { session: cmd.session };
                    }
                };

                if cmd.request <= session.sequence {
                    // Duplicate submission: replay the cached response without re-applying.
                    self.cleanable.push(index);
                    return match session.responses.get(&cmd.request) {
                        Some(cached) => Applied::Response {
                            result: cached.result.clone(),
                        },
                        None => Applied::ResponseEvicted {
                            session: cmd.session,
                            request: cmd.request,
                        },
                    };
                }

                let result = self.machine.apply(index, cmd.timestamp, &cmd.command).map_err(|err| err.to_string());
                session.sequence = cmd.request;
                session.responses.insert(cmd.request, CachedResponse {
                    index,
                    result: result.clone(),
                });

                // Purge responses the client has acknowledged; the entries behind them are
                // superseded.
                let acked: Vec<u64> = session.responses.range(..=cmd.response).map(|(req, _)| *req).collect();
                for req in acked {
                    if let Some(cached) = session.responses.remove(&req) {
                        self.cleanable.push(cached.index);
                    }
                }

                Applied::Response { result }
            }
            EntryPayload::Query(query) => {
                // Persisted only to force ordering; never retained.
                self.cleanable.push(index);
                let result = self.machine.query(&query.query).map_err(|err| err.to_string());
                Applied::Queried { result }
            }
        }
    }

    /// Expire sessions whose last keep-alive is older than the session timeout, judged at the
    /// given entry timestamp.
    fn expire_sessions(&mut self, now: i64) {
        let expired: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.last_keep_alive + self.session_timeout < now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                tracing::debug!(session = id, "session expired");
                // Everything the session left in the log is now dead weight.
                self.cleanable.push(session.id);
                if session.keep_alive_index != session.id {
                    self.cleanable.push(session.keep_alive_index);
                }
                for cached in session.responses.values() {
                    self.cleanable.push(cached.index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::CommandEntry;
    use crate::raft::KeepAliveEntry;
    use crate::raft::RegisterEntry;

    /// A counter which adds the command operand to its total.
    #[derive(Default, Serialize, Deserialize)]
    struct Counter {
        total: u64,
        applies: u64,
    }

    impl StateMachine<u64, u64> for Counter {
        fn apply(&mut self, _index: u64, _timestamp: i64, command: &u64) -> anyhow::Result<u64> {
            self.applies += 1;
            self.total += *command;
            Ok(self.total)
        }

        fn query(&self, _query: &u64) -> anyhow::Result<u64> {
            Ok(self.total)
        }
    }

    fn register(index: u64, timestamp: i64) -> Entry<u64> {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Register(RegisterEntry {
                address: Address::new("client", 9000),
                timestamp,
            }),
        }
    }

    fn keep_alive(index: u64, session: u64, timestamp: i64) -> Entry<u64> {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::KeepAlive(KeepAliveEntry { session, timestamp }),
        }
    }

    fn command(index: u64, session: u64, request: u64, response: u64, operand: u64) -> Entry<u64> {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Command(CommandEntry {
                session,
                request,
                response,
                timestamp: index as i64,
                command: operand,
            }),
        }
    }

    fn executor() -> Executor<u64, u64, Counter> {
        Executor::new(Counter::default(), 1000)
    }

    #[test]
    fn test_register_and_command() {
        let mut ex = executor();
        assert!(matches!(ex.apply_entry(&register(1, 0)), Applied::Registered { session: 1 }));

        match ex.apply_entry(&command(2, 1, 1, 0, 5)) {
            Applied::Response { result } => assert_eq!(result.unwrap(), 5),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(ex.machine().applies, 1);
        assert_eq!(ex.last_applied(), LogId::new(1, 2));
    }

    #[test]
    fn test_duplicate_command_replays_cached_response() {
        let mut ex = executor();
        ex.apply_entry(&register(1, 0));

        match ex.apply_entry(&command(2, 1, 1, 0, 1)) {
            Applied::Response { result } => assert_eq!(result.unwrap(), 1),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The duplicate reaches the log at a later index but must not re-apply.
        match ex.apply_entry(&command(3, 1, 1, 0, 1)) {
            Applied::Response { result } => assert_eq!(result.unwrap(), 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(ex.machine().applies, 1);
        assert_eq!(ex.machine().total, 1);

        // The duplicate entry itself is cleanable.
        assert!(ex.drain_cleanable().contains(&3));
    }

    #[test]
    fn test_acknowledged_responses_are_purged() {
        let mut ex = executor();
        ex.apply_entry(&register(1, 0));
        ex.apply_entry(&command(2, 1, 1, 0, 1));
        ex.apply_entry(&command(3, 1, 2, 1, 1));
        ex.drain_cleanable();

        // Request 1 was acknowledged by response=1 above; a late duplicate finds it evicted.
        match ex.apply_entry(&command(4, 1, 1, 0, 1)) {
            Applied::ResponseEvicted { session: 1, request: 1 } => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(ex.machine().applies, 2);
    }

    #[test]
    fn test_sessions_expire_on_entry_timestamps() {
        let mut ex = executor();
        ex.apply_entry(&register(1, 0));
        ex.apply_entry(&keep_alive(2, 1, 500));
        assert_eq!(ex.session_count(), 1);

        // A keep-alive for another session at t=1501 expires session 1 (500 + 1000 < 1501).
        ex.apply_entry(&register(3, 1400));
        assert_eq!(ex.session_count(), 2);
        ex.apply_entry(&keep_alive(4, 3, 1501));
        assert_eq!(ex.session_count(), 1);
        assert!(ex.session(1).is_none());

        // Commands against the dead session are refused.
        match ex.apply_entry(&command(5, 1, 1, 0, 1)) {
            Applied::SessionUnknown { session: 1 } => {}
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The dead session's entries became cleanable.
        let cleanable = ex.drain_cleanable();
        assert!(cleanable.contains(&1));
        assert!(cleanable.contains(&2));
    }

    #[test]
    fn test_superseded_keep_alives_are_cleanable() {
        let mut ex = executor();
        ex.apply_entry(&register(1, 0));
        ex.apply_entry(&keep_alive(2, 1, 100));
        ex.apply_entry(&keep_alive(3, 1, 200));
        let cleanable = ex.drain_cleanable();
        assert!(cleanable.contains(&2));
        assert!(!cleanable.contains(&1));
    }

    #[test]
    fn test_replayed_entries_are_ignored() {
        let mut ex = executor();
        ex.apply_entry(&register(1, 0));
        ex.apply_entry(&command(2, 1, 1, 0, 5));
        assert!(matches!(ex.apply_entry(&command(2, 1, 1, 0, 5)), Applied::NoOp));
        assert_eq!(ex.machine().applies, 1);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_sessions() {
        let mut ex = executor();
        ex.apply_entry(&register(1, 0));
        ex.apply_entry(&command(2, 1, 1, 0, 7));

        let raw = bincode::serialize(&ex).unwrap();
        let mut restored: Executor<u64, u64, Counter> = bincode::deserialize(&raw).unwrap();
        assert_eq!(restored.session_count(), 1);
        assert_eq!(restored.last_applied(), LogId::new(1, 2));
        assert_eq!(restored.machine().total, 7);

        // Duplicate replay works against the restored cache.
        match restored.apply_entry(&command(3, 1, 1, 0, 7)) {
            Applied::Response { result } => assert_eq!(result.unwrap(), 7),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(restored.machine().applies, 1);
    }
}
