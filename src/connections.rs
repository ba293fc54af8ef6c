use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::timeout;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::restore::{RestoreError, RestoreTransport, DEFAULT_REQUEST_TIMEOUT};
use crate::restore_pb;
use crate::restore_pb::restore_service_client::RestoreServiceClient;

/// Cached gRPC clients, one per leader address. Clients are cheap to
/// clone; the underlying channel multiplexes requests.
#[derive(Default)]
pub struct ConnectionPool {
    conns: RwLock<HashMap<String, RestoreServiceClient<Channel>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn get(&self, addr: &str) -> Result<RestoreServiceClient<Channel>, RestoreError> {
        if let Some(c) = self.conns.read().await.get(addr) {
            return Ok(c.clone());
        }

        debug!("connecting to {addr}");
        let client = RestoreServiceClient::connect(addr.to_string())
            .await
            .map_err(|e| RestoreError::Network(e.to_string()))?;

        self.conns
            .write()
            .await
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Drops the cached client so the next `get` reconnects.
    pub async fn forget(&self, addr: &str) {
        self.conns.write().await.remove(addr);
    }
}

/// `RestoreTransport` over tonic channels with a per-request deadline.
/// A failed request evicts the cached connection; retrying is the
/// caller's concern.
pub struct GrpcRestoreTransport {
    pool: ConnectionPool,
    request_timeout: Duration,
}

impl Default for GrpcRestoreTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcRestoreTransport {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(request_timeout: Duration) -> Self {
        Self {
            pool: ConnectionPool::new(),
            request_timeout,
        }
    }

    async fn failed(&self, leader: &str, err: tonic::Status) -> RestoreError {
        warn!("request to {leader} failed: {err}");
        self.pool.forget(leader).await;
        RestoreError::Network(err.to_string())
    }
}

#[tonic::async_trait]
impl RestoreTransport for GrpcRestoreTransport {
    async fn restore_info(
        &self,
        leader: &str,
        req: restore_pb::RestoreInfoRequest,
    ) -> Result<restore_pb::RestoreInfoResponse, RestoreError> {
        let mut client = self.pool.get(leader).await?;
        match timeout(self.request_timeout, client.restore_info(req)).await {
            Err(_) => Err(RestoreError::Timeout),
            Ok(Err(status)) => Err(self.failed(leader, status).await),
            Ok(Ok(resp)) => Ok(resp.into_inner()),
        }
    }

    async fn replicate_log(
        &self,
        leader: &str,
        req: restore_pb::LogReplicationRequest,
    ) -> Result<restore_pb::LogReplicationResponse, RestoreError> {
        let mut client = self.pool.get(leader).await?;
        match timeout(self.request_timeout, client.replicate_log(req)).await {
            Err(_) => Err(RestoreError::Timeout),
            Ok(Err(status)) => Err(self.failed(leader, status).await),
            Ok(Ok(resp)) => Ok(resp.into_inner()),
        }
    }

    async fn snapshot_chunk(
        &self,
        leader: &str,
        req: restore_pb::SnapshotChunkRequest,
    ) -> Result<restore_pb::SnapshotChunkResponse, RestoreError> {
        let mut client = self.pool.get(leader).await?;
        match timeout(self.request_timeout, client.snapshot_chunk(req)).await {
            Err(_) => Err(RestoreError::Timeout),
            Ok(Err(status)) => Err(self.failed(leader, status).await),
            Ok(Ok(resp)) => Ok(resp.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_address_is_network_error() {
        let pool = ConnectionPool::new();
        let err = pool.get("http://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, RestoreError::Network(_)));
    }
}
