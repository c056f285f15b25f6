//! Raft runtime configuration.

use std::path::PathBuf;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT: u64 = 500;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 250;
/// Default threshold for when to trigger a snapshot.
pub const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default maximum number of bytes per replication payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1024 * 1024;
/// Default snapshot chunksize.
pub const DEFAULT_SNAPSHOT_CHUNKSIZE: u64 = 1024 * 1024 * 3;
/// Default maximum size of a single serialized entry, in bytes.
pub const DEFAULT_MAX_ENTRY_SIZE: u32 = 1024 * 1024;
/// Default maximum size of a log segment file, in bytes.
pub const DEFAULT_MAX_SEGMENT_SIZE: u32 = 1024 * 1024 * 32;
/// Default maximum number of entries in a log segment.
pub const DEFAULT_MAX_ENTRIES_PER_SEGMENT: u32 = 1024 * 1024;

/// Log compaction and snapshot policy.
///
/// This governs when periodic snapshots will be taken, and also governs the conditions which
/// would cause a leader to send an `InstallSnapshot` RPC to a follower based on replication lag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST)
    }
}

/// The runtime configuration for a Raft node.
///
/// The default values used by this type should generally work well for Raft clusters which will
/// be running with nodes in multiple datacenter availability zones with low inter-AZ latency. If
/// this is not the case, then the available configuration options may need to be updated to best
/// suit the needs of the target environment.
///
/// When building the Raft configuration for your application, remember this inequality from the
/// Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    ///
    /// Election timers are randomized in `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: u64,
    /// The heartbeat interval in milliseconds at which leaders will send heartbeats to followers.
    ///
    /// **NOTE WELL:** it is very important that this value be less than half of
    /// `election_timeout`, else the cluster will never have a stable leader.
    pub heartbeat_interval: u64,
    /// The number of milliseconds a client session may go without a keep-alive before it is
    /// expired by the state machine.
    ///
    /// Expiration is judged on entry timestamps, never wall-clock, so every replica expires a
    /// session at exactly the same point in the log.
    pub session_timeout: u64,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: u64,
    /// The maximum number of bytes per replication payload.
    pub max_payload_bytes: u64,
    /// The directory where the segmented log stores its files.
    pub storage_directory: PathBuf,
    /// The maximum size of a single serialized entry, in bytes.
    pub max_entry_size: u32,
    /// The maximum size of a log segment file, in bytes.
    pub max_segment_size: u32,
    /// The maximum number of entries in a single log segment.
    pub max_entries_per_segment: u32,
    /// The snapshot policy to use for a Raft node.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size allowed when transmitting snapshots (in bytes).
    pub snapshot_max_chunk_size: u64,
    /// The timeout for sending a snapshot segment, in milliseconds.
    pub install_snapshot_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    ///
    /// The directory where the log files of the node are stored will be based on the value of
    /// `storage_directory`; every segment file written there carries the cluster name.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout: None,
            heartbeat_interval: None,
            session_timeout: None,
            max_payload_entries: None,
            max_payload_bytes: None,
            storage_directory: None,
            max_entry_size: None,
            max_segment_size: None,
            max_entries_per_segment: None,
            snapshot_policy: None,
            snapshot_max_chunk_size: None,
            install_snapshot_timeout: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout..self.election_timeout * 2)
    }
}

/// A configuration builder to ensure that runtime config is valid.
///
/// For election timeout config & heartbeat interval configuration, it is recommended that §5.6 of
/// the Raft spec is considered in order to set the appropriate values.
#[derive(Debug)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout: Option<u64>,
    /// The interval at which leaders will send heartbeats to followers to avoid election timeout.
    pub heartbeat_interval: Option<u64>,
    /// The session timeout, in milliseconds.
    pub session_timeout: Option<u64>,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: Option<u64>,
    /// The maximum number of bytes per replication payload.
    pub max_payload_bytes: Option<u64>,
    /// The directory where the segmented log stores its files.
    pub storage_directory: Option<PathBuf>,
    /// The maximum size of a single serialized entry.
    pub max_entry_size: Option<u32>,
    /// The maximum size of a log segment file.
    pub max_segment_size: Option<u32>,
    /// The maximum number of entries in a single log segment.
    pub max_entries_per_segment: Option<u32>,
    /// The snapshot policy.
    pub snapshot_policy: Option<SnapshotPolicy>,
    /// The maximum snapshot chunk size.
    pub snapshot_max_chunk_size: Option<u64>,
    /// The timeout for sending a snapshot segment, in milliseconds.
    pub install_snapshot_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout`.
    pub fn election_timeout(mut self, val: u64) -> Self {
        self.election_timeout = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `session_timeout`.
    pub fn session_timeout(mut self, val: u64) -> Self {
        self.session_timeout = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `max_payload_bytes`.
    pub fn max_payload_bytes(mut self, val: u64) -> Self {
        self.max_payload_bytes = Some(val);
        self
    }

    /// Set the directory where the segmented log stores its files.
    pub fn storage_directory(mut self, val: PathBuf) -> Self {
        self.storage_directory = Some(val);
        self
    }

    /// Set the desired value for `max_entry_size`.
    pub fn max_entry_size(mut self, val: u32) -> Self {
        self.max_entry_size = Some(val);
        self
    }

    /// Set the desired value for `max_segment_size`.
    pub fn max_segment_size(mut self, val: u32) -> Self {
        self.max_segment_size = Some(val);
        self
    }

    /// Set the desired value for `max_entries_per_segment`.
    pub fn max_entries_per_segment(mut self, val: u32) -> Self {
        self.max_entries_per_segment = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `snapshot_max_chunk_size`.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Validate the state of this builder, returning a usable `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        // Roll a random election timeout, then validate invariants.
        let election_timeout = self.election_timeout.unwrap_or(DEFAULT_ELECTION_TIMEOUT);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval * 2 > election_timeout {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        let session_timeout = self.session_timeout.unwrap_or(heartbeat_interval * 5);
        if session_timeout < heartbeat_interval {
            return Err(ConfigError::InvalidSessionTimeout);
        }
        let max_entry_size = self.max_entry_size.unwrap_or(DEFAULT_MAX_ENTRY_SIZE);
        let max_segment_size = self.max_segment_size.unwrap_or(DEFAULT_MAX_SEGMENT_SIZE);
        if max_segment_size <= max_entry_size {
            return Err(ConfigError::InvalidSegmentSize);
        }
        let max_entries_per_segment = self.max_entries_per_segment.unwrap_or(DEFAULT_MAX_ENTRIES_PER_SEGMENT);
        if max_entries_per_segment == 0 {
            return Err(ConfigError::InvalidSegmentSize);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout,
            heartbeat_interval,
            session_timeout,
            max_payload_entries: self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES),
            max_payload_bytes: self.max_payload_bytes.unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES),
            storage_directory: self.storage_directory.unwrap_or_else(|| PathBuf::from(".")),
            max_entry_size,
            max_segment_size,
            max_entries_per_segment,
            snapshot_policy: self.snapshot_policy.unwrap_or_default(),
            snapshot_max_chunk_size: self.snapshot_max_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_CHUNKSIZE),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL * 4),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        assert_eq!(cfg.election_timeout, DEFAULT_ELECTION_TIMEOUT);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.session_timeout, DEFAULT_HEARTBEAT_INTERVAL * 5);
        assert_eq!(cfg.max_entry_size, DEFAULT_MAX_ENTRY_SIZE);
        assert_eq!(cfg.max_segment_size, DEFAULT_MAX_SEGMENT_SIZE);
    }

    #[test]
    fn test_invalid_heartbeat_interval() {
        let res = Config::build("cluster0".into()).election_timeout(100).heartbeat_interval(90).validate();
        assert!(matches!(res, Err(ConfigError::InvalidHeartbeatInterval)));
    }

    #[test]
    fn test_rand_election_timeout_within_range() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout && t < cfg.election_timeout * 2);
        }
    }
}
