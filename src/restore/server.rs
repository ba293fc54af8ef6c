use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use super::RestoreError;
use crate::partition::{Partition, PartitionRegistry};
use crate::restore_pb::restore_service_server::RestoreService;
use crate::restore_pb::{
    LogReplicationRequest, LogReplicationResponse, RestoreInfoRequest, RestoreInfoResponse,
    SnapshotChunkRequest, SnapshotChunkResponse,
};

const DEFAULT_REPLICATION_BATCH: u32 = 100;

/// Leader side of the restore protocol. Stateless per request: every
/// answer is derived from the partition's log stream, block index and
/// snapshot store at request time, and no follower progress is tracked
/// between requests. An abandoned follower session leaves nothing
/// behind here.
pub struct RestoreServer {
    partitions: Arc<PartitionRegistry>,
}

impl RestoreServer {
    pub fn new(partitions: Arc<PartitionRegistry>) -> Self {
        Self { partitions }
    }

    async fn partition(&self, id: u32) -> Result<Arc<Partition>, RestoreError> {
        self.partitions
            .get(id)
            .await
            .ok_or(RestoreError::UnknownPartition(id))
    }

    pub async fn restore_info(
        &self,
        req: RestoreInfoRequest,
    ) -> Result<RestoreInfoResponse, RestoreError> {
        let partition = self.partition(req.partition_id).await?;

        let snapshot = partition.snapshots.latest().await?;
        let resp = RestoreInfoResponse {
            first_position: partition.stream.first_position().unwrap_or(0),
            last_position: partition.stream.last_position(),
            snapshot_available: snapshot.is_some(),
            snapshot_position: snapshot.map(|s| s.position).unwrap_or(0),
            snapshot_length: snapshot.map(|s| s.length).unwrap_or(0),
            snapshot_chunk_count: snapshot.map(|s| s.chunk_count).unwrap_or(0),
        };

        info!(
            "restore info for partition {}: follower at {}, serving range [{}, {}], snapshot at {:?}",
            req.partition_id,
            req.last_position,
            resp.first_position,
            resp.last_position,
            snapshot.map(|s| s.position),
        );

        Ok(resp)
    }

    pub async fn replicate_log(
        &self,
        req: LogReplicationRequest,
    ) -> Result<LogReplicationResponse, RestoreError> {
        let partition = self.partition(req.partition_id).await?;
        let max_entries = if req.max_entries == 0 {
            DEFAULT_REPLICATION_BATCH
        } else {
            req.max_entries
        };

        let mut reader = partition.stream.new_reader();
        reader.seek_to_next_event(req.from_position_exclusive).await?;

        let mut entries = Vec::new();
        while entries.len() < max_entries as usize {
            match reader.next().await? {
                None => break,
                Some(entry) => entries.push((&entry).into()),
            }
        }
        let more_available = reader.has_next().await?;

        debug!(
            "replicating {} entries of partition {} from position {} exclusive, more: {}",
            entries.len(),
            req.partition_id,
            req.from_position_exclusive,
            more_available,
        );

        Ok(LogReplicationResponse {
            entries,
            more_available,
        })
    }

    pub async fn snapshot_chunk(
        &self,
        req: SnapshotChunkRequest,
    ) -> Result<SnapshotChunkResponse, RestoreError> {
        let partition = self.partition(req.partition_id).await?;

        let meta = partition
            .snapshots
            .latest()
            .await?
            .ok_or_else(|| RestoreError::Validation("no snapshot available".into()))?;
        let chunk = partition
            .snapshots
            .read_chunk(meta.position, req.chunk_index)
            .await?;

        Ok(SnapshotChunkResponse {
            chunk: chunk.data.to_vec(),
            chunk_index: chunk.chunk_index,
            last_chunk: chunk.last,
            snapshot_position: chunk.position,
            chunk_count: chunk.chunk_count,
            total_length: chunk.total_length,
        })
    }
}

fn to_status(err: RestoreError) -> Status {
    warn!("restore request failed: {err}");
    match err {
        RestoreError::UnknownPartition(_) => Status::not_found(err.to_string()),
        RestoreError::Validation(_) => Status::failed_precondition(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// Thin tonic wrapper around `RestoreServer`.
pub struct RestoreGrpcService {
    server: RestoreServer,
}

impl RestoreGrpcService {
    pub fn new(server: RestoreServer) -> Self {
        Self { server }
    }
}

#[tonic::async_trait]
impl RestoreService for RestoreGrpcService {
    async fn restore_info(
        &self,
        req: Request<RestoreInfoRequest>,
    ) -> Result<Response<RestoreInfoResponse>, Status> {
        self.server
            .restore_info(req.into_inner())
            .await
            .map(Response::new)
            .map_err(to_status)
    }

    async fn replicate_log(
        &self,
        req: Request<LogReplicationRequest>,
    ) -> Result<Response<LogReplicationResponse>, Status> {
        self.server
            .replicate_log(req.into_inner())
            .await
            .map(Response::new)
            .map_err(to_status)
    }

    async fn snapshot_chunk(
        &self,
        req: Request<SnapshotChunkRequest>,
    ) -> Result<Response<SnapshotChunkResponse>, Status> {
        self.server
            .snapshot_chunk(req.into_inner())
            .await
            .map(Response::new)
            .map_err(to_status)
    }
}
