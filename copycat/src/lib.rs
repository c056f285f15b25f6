#![doc = include_str!("../README.md")]
#![cfg_attr(feature = "docinclude", feature(external_doc))]

pub mod client;
mod config;
mod core;
pub mod error;
pub mod metrics;
mod quorum;
pub mod raft;
mod raft_types;
mod replication;
pub mod sessions;
pub mod storage;

use std::fmt::Debug;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use async_trait;

pub use crate::client::RaftClient;
pub use crate::client::SessionNetwork;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::State;
pub use crate::error::ChangeConfigError;
pub use crate::error::InitializeError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::metrics::RaftMetrics;
pub use crate::raft::Address;
pub use crate::raft::AppendEntriesRequest;
pub use crate::raft::AppendEntriesResponse;
pub use crate::raft::ConsistencyLevel;
pub use crate::raft::InstallSnapshotRequest;
pub use crate::raft::InstallSnapshotResponse;
pub use crate::raft::Membership;
pub use crate::raft::PollRequest;
pub use crate::raft::PollResponse;
pub use crate::raft::Raft;
pub use crate::raft::VoteRequest;
pub use crate::raft::VoteResponse;
pub use crate::raft_types::LogId;
pub use crate::replication::ReplicationMetrics;
pub use crate::raft_types::MessageSummary;
pub use crate::raft_types::SnapshotId;
pub use crate::raft_types::SnapshotSegmentId;
pub use crate::raft_types::Update;
pub use crate::storage::RaftStorage;
pub use crate::storage::RaftStorageDebug;

/// A Raft node's ID: the stable hash of its address.
pub type NodeId = u64;

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types throughout their application without having to serialize and
/// deserialize their data as it goes through Raft. Instead, applications can present their data
/// models as-is to Raft, Raft will present it to the application's `RaftStorage` impl when ready,
/// and the application may then deal with the data directly in the storage engine without having
/// to do a preliminary deserialization.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types for returning response data from the storage layer when an
/// entry is applied to the state machine as part of a client request (this is not used during
/// replication). This allows applications to seamlessly return application specific data from
/// their storage layer, up through Raft, and back into their application for returning
/// data to clients.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining the interface for a Raft network between cluster members.
///
/// Typically, the network implementation as such will be hidden behind a `Box<T>` or `Arc<T>` and
/// this interface implemented on the `Box<T>` or `Arc<T>`.
// Plain integers stand in for application data in the storage unit tests.
#[cfg(test)]
impl AppData for u64 {}
#[cfg(test)]
impl AppDataResponse for u64 {}

#[async_trait::async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a Poll RPC to the target Raft node.
    ///
    /// A poll is the pre-vote probe sent before a prospective candidate disrupts the cluster by
    /// incrementing its term. Receivers answer with the same up-to-date check used for votes, but
    /// without mutating any local state.
    async fn send_poll(&self, target: NodeId, rpc: PollRequest) -> Result<PollResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
