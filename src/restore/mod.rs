//! Catch-up protocol between a lagging follower and its partition
//! leader: restore-info negotiation, log replication in bounded ranges,
//! and chunked snapshot transfer. The server side is stateless per
//! request; the follower drives the multi-step session.

pub mod client;
pub mod server;

pub use client::{RestoreClient, RestoreOptions, RestoreResult, RestoreState};
pub use server::{RestoreGrpcService, RestoreServer};

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::log::{LogEntry, LogStreamError};
use crate::restore_pb;
use crate::snapshot::SnapshotError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("no leader known for partition {0}")]
    NoLeader(u32),
    #[error("partition {0} not served here")]
    UnknownPartition(u32),
    #[error("network failure: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid response: {0}")]
    Validation(String),
    #[error("restore failed after {attempts} attempts, last failure: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error(transparent)]
    LogStream(#[from] LogStreamError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Failures that do not poison the session: the request is simply issued
/// again. Decode/validation failures are unrecoverable for the one
/// response but recoverable at the session level by re-requesting.
pub fn is_recoverable(err: &RestoreError) -> bool {
    matches!(
        err,
        RestoreError::Network(_)
            | RestoreError::Timeout
            | RestoreError::Validation(_)
            | RestoreError::Snapshot(SnapshotError::ChunkOutOfOrder { .. })
    )
}

/// Leader addressing, owned by cluster membership outside this crate.
/// Addresses are connectable endpoint URIs.
pub trait Membership: Send + Sync {
    fn resolve_leader(&self, partition_id: u32) -> Option<String>;
}

/// Request/response substrate of the protocol. The gRPC implementation
/// lives in `connections`; tests drive the client against an in-process
/// server through the same seam.
#[tonic::async_trait]
pub trait RestoreTransport: Send + Sync {
    async fn restore_info(
        &self,
        leader: &str,
        req: restore_pb::RestoreInfoRequest,
    ) -> Result<restore_pb::RestoreInfoResponse, RestoreError>;

    async fn replicate_log(
        &self,
        leader: &str,
        req: restore_pb::LogReplicationRequest,
    ) -> Result<restore_pb::LogReplicationResponse, RestoreError>;

    async fn snapshot_chunk(
        &self,
        leader: &str,
        req: restore_pb::SnapshotChunkRequest,
    ) -> Result<restore_pb::SnapshotChunkResponse, RestoreError>;
}

impl From<&LogEntry> for restore_pb::LogEntry {
    fn from(entry: &LogEntry) -> Self {
        restore_pb::LogEntry {
            position: entry.position,
            source_index: entry.source_index,
            metadata: entry.metadata.to_vec(),
            value: entry.value.to_vec(),
        }
    }
}

impl From<restore_pb::LogEntry> for LogEntry {
    fn from(entry: restore_pb::LogEntry) -> Self {
        LogEntry {
            position: entry.position,
            source_index: entry.source_index,
            metadata: Bytes::from(entry.metadata),
            value: Bytes::from(entry.value),
        }
    }
}
