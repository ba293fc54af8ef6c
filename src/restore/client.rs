use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use super::{is_recoverable, Membership, RestoreError, RestoreTransport};
use crate::log::{LogEntry, LogStream, LogStreamWriter};
use crate::restore_pb;
use crate::retry::BackoffRetryStrategy;
use crate::snapshot::{SnapshotReceiver, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Negotiating,
    ReplicatingLog,
    RestoringSnapshot,
    CaughtUp,
    Failed,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RestoreOptions {
    #[builder(default = 100)]
    pub max_entries_per_request: u32,
    /// Attempts per request before the session fails.
    #[builder(default = 10)]
    pub max_attempts: u32,
    #[builder(default_code = "Duration::from_millis(100)")]
    pub backoff_initial: Duration,
    #[builder(default_code = "Duration::from_secs(5)")]
    pub backoff_max: Duration,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreResult {
    pub state: RestoreState,
    pub last_position: i64,
}

/// Follower side of the restore protocol. Drives the session state
/// machine against the current leader until the local log and snapshot
/// have caught up, or retries are exhausted. The session exists only for
/// the duration of `run`; the leader never learns about it.
pub struct RestoreClient {
    partition_id: u32,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn RestoreTransport>,
    options: RestoreOptions,
    backoff: BackoffRetryStrategy,
}

impl RestoreClient {
    pub fn new(
        partition_id: u32,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn RestoreTransport>,
        options: RestoreOptions,
    ) -> Self {
        let backoff = BackoffRetryStrategy::new(options.backoff_initial, options.backoff_max);
        Self {
            partition_id,
            membership,
            transport,
            options,
            backoff,
        }
    }

    /// Runs one restore session. On success the local log holds every
    /// leader position up to the negotiated end, appended in order with
    /// the leader's own position assignment. On failure the partition is
    /// left visibly not caught up; partial progress (installed snapshot,
    /// already appended ranges) is kept and the session can be re-run.
    pub async fn run(
        &self,
        stream: &LogStream,
        snapshots: &SnapshotStore,
    ) -> Result<RestoreResult, RestoreError> {
        let leader = self
            .membership
            .resolve_leader(self.partition_id)
            .ok_or(RestoreError::NoLeader(self.partition_id))?;

        info!(
            "starting restore of partition {} from leader {leader}, local position {}",
            self.partition_id,
            stream.last_position(),
        );

        self.drive(&leader, stream, snapshots)
            .await
            .inspect_err(|e| {
                error!(
                    "restore of partition {} from {leader} failed: {e}",
                    self.partition_id
                )
            })
    }

    async fn drive(
        &self,
        leader: &str,
        stream: &LogStream,
        snapshots: &SnapshotStore,
    ) -> Result<RestoreResult, RestoreError> {
        let writer = stream.new_writer();
        let mut state = RestoreState::Negotiating;
        let mut remote = restore_pb::RestoreInfoResponse::default();
        let mut cursor = stream.last_position();
        let mut session_retries = 0u32;

        loop {
            state = match state {
                RestoreState::Negotiating => {
                    let local_last = stream.last_position();
                    let local_snapshot = snapshots
                        .latest()
                        .await?
                        .map(|s| s.position)
                        .unwrap_or(0);

                    remote = self
                        .request(|| {
                            self.transport.restore_info(
                                leader,
                                restore_pb::RestoreInfoRequest {
                                    partition_id: self.partition_id,
                                    last_position: local_last,
                                    last_snapshot_position: local_snapshot,
                                },
                            )
                        })
                        .await?;

                    cursor = local_last;

                    if remote.last_position <= local_last {
                        info!(
                            "partition {} already caught up at position {local_last}",
                            self.partition_id
                        );
                        RestoreState::CaughtUp
                    } else if local_last + 1 < remote.first_position {
                        // The leader compacted past us; replay alone
                        // cannot bridge the gap.
                        if !remote.snapshot_available || remote.snapshot_position <= local_last {
                            return Err(RestoreError::Validation(format!(
                                "leader log starts at {} but offers no usable snapshot",
                                remote.first_position
                            )));
                        }
                        RestoreState::RestoringSnapshot
                    } else {
                        RestoreState::ReplicatingLog
                    }
                }

                RestoreState::RestoringSnapshot => {
                    match self.restore_snapshot(leader, snapshots, &remote).await {
                        Ok(position) => {
                            cursor = position;
                            RestoreState::ReplicatingLog
                        }
                        Err(e) => self.renegotiate_or_fail(e, &mut session_retries)?,
                    }
                }

                RestoreState::ReplicatingLog => {
                    match self.replicate(leader, &writer, cursor).await {
                        Ok(last) => {
                            cursor = last;
                            RestoreState::CaughtUp
                        }
                        Err(e) => self.renegotiate_or_fail(e, &mut session_retries)?,
                    }
                }

                RestoreState::CaughtUp => {
                    info!(
                        "restore of partition {} caught up at position {cursor}",
                        self.partition_id
                    );
                    return Ok(RestoreResult {
                        state: RestoreState::CaughtUp,
                        last_position: cursor,
                    });
                }

                RestoreState::Failed => unreachable!("failures surface as errors"),
            };
        }
    }

    /// A corrupted response that already passed transport retries does
    /// not fail the session outright: the state machine goes back to
    /// negotiating from current local state, a bounded number of times.
    fn renegotiate_or_fail(
        &self,
        err: RestoreError,
        session_retries: &mut u32,
    ) -> Result<RestoreState, RestoreError> {
        if !is_recoverable(&err) || *session_retries >= self.options.max_attempts {
            return Err(err);
        }
        *session_retries += 1;
        warn!("restore session failure, renegotiating: {err}");
        Ok(RestoreState::Negotiating)
    }

    /// Replicates entries past `cursor` batch by batch until the leader
    /// reports no more; returns the position of the last appended entry.
    async fn replicate(
        &self,
        leader: &str,
        writer: &LogStreamWriter,
        mut cursor: i64,
    ) -> Result<i64, RestoreError> {
        loop {
            let resp = self
                .request(|| {
                    self.transport.replicate_log(
                        leader,
                        restore_pb::LogReplicationRequest {
                            partition_id: self.partition_id,
                            from_position_exclusive: cursor,
                            max_entries: self.options.max_entries_per_request,
                        },
                    )
                })
                .await?;

            let more_available = resp.more_available;
            if resp.entries.is_empty() {
                if more_available {
                    return Err(RestoreError::Validation(
                        "leader reported more entries but sent none".into(),
                    ));
                }
                return Ok(cursor);
            }

            let entries: Vec<LogEntry> = resp.entries.into_iter().map(Into::into).collect();
            cursor = writer.append_with_positions(entries).await?;

            if !more_available {
                return Ok(cursor);
            }
        }
    }

    /// Transfers and installs the leader's snapshot; returns its log
    /// position, the new replication cursor. Chunks are requested
    /// strictly sequentially and only committed as whole validated
    /// units, so an interrupted transfer leaves no partial snapshot.
    async fn restore_snapshot(
        &self,
        leader: &str,
        snapshots: &SnapshotStore,
        remote: &restore_pb::RestoreInfoResponse,
    ) -> Result<i64, RestoreError> {
        info!(
            "restoring snapshot of partition {} at position {}, {} chunks",
            self.partition_id, remote.snapshot_position, remote.snapshot_chunk_count
        );

        let mut receiver = SnapshotReceiver::begin(
            snapshots,
            remote.snapshot_position,
            remote.snapshot_length,
            remote.snapshot_chunk_count,
        )
        .await?;

        loop {
            let chunk_index = receiver.next_chunk();
            let resp = match self
                .request(|| {
                    self.transport.snapshot_chunk(
                        leader,
                        restore_pb::SnapshotChunkRequest {
                            partition_id: self.partition_id,
                            chunk_index,
                        },
                    )
                })
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    receiver.abort().await;
                    return Err(e);
                }
            };

            if resp.chunk_index != chunk_index
                || resp.snapshot_position != remote.snapshot_position
            {
                receiver.abort().await;
                return Err(RestoreError::Validation(format!(
                    "snapshot chunk mismatch: requested {chunk_index} of position {}, got {} of {}",
                    remote.snapshot_position, resp.chunk_index, resp.snapshot_position
                )));
            }

            match receiver.apply_chunk(chunk_index, &resp.chunk).await {
                Ok(None) => continue,
                Ok(Some(meta)) => return Ok(meta.position),
                Err(e) => {
                    receiver.abort().await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Issues one request through the backoff retry strategy: recoverable
    /// failures are retried up to `max_attempts` with increasing delay,
    /// anything else fails the session immediately.
    async fn request<T, F, Fut>(&self, mut op: F) -> Result<T, RestoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RestoreError>>,
    {
        let out: Mutex<Option<T>> = Mutex::new(None);
        let fatal: Mutex<Option<RestoreError>> = Mutex::new(None);
        let last_failure: Mutex<Option<String>> = Mutex::new(None);
        let attempts = AtomicU32::new(0);

        let _ = self
            .backoff
            .run_with_retry(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let fut = op();
                    async {
                        match fut.await {
                            Ok(v) => {
                                *out.lock() = Some(v);
                                Ok::<bool, RestoreError>(true)
                            }
                            Err(e) if is_recoverable(&e) => {
                                warn!("restore request failed, will retry: {e}");
                                *last_failure.lock() = Some(e.to_string());
                                Ok(false)
                            }
                            Err(e) => {
                                *fatal.lock() = Some(e);
                                Ok(true)
                            }
                        }
                    }
                },
                || attempts.load(Ordering::SeqCst) >= self.options.max_attempts,
            )
            .await;

        if let Some(e) = fatal.lock().take() {
            return Err(e);
        }
        if let Some(v) = out.lock().take() {
            return Ok(v);
        }

        let last = last_failure
            .lock()
            .take()
            .unwrap_or_else(|| "request kept failing".into());
        Err(RestoreError::RetriesExhausted {
            attempts: attempts.load(Ordering::SeqCst),
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::partition::{Partition, PartitionRegistry};
    use crate::restore::server::RestoreServer;
    use crate::restore_pb;
    use crate::storage::MemStorage;

    struct FixedLeader(&'static str);

    impl Membership for FixedLeader {
        fn resolve_leader(&self, _partition_id: u32) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    struct NoLeader;

    impl Membership for NoLeader {
        fn resolve_leader(&self, _partition_id: u32) -> Option<String> {
            None
        }
    }

    /// Calls the stateless server directly, standing in for the gRPC
    /// substrate.
    struct LocalTransport {
        server: RestoreServer,
    }

    #[tonic::async_trait]
    impl RestoreTransport for LocalTransport {
        async fn restore_info(
            &self,
            _leader: &str,
            req: restore_pb::RestoreInfoRequest,
        ) -> Result<restore_pb::RestoreInfoResponse, RestoreError> {
            self.server.restore_info(req).await
        }

        async fn replicate_log(
            &self,
            _leader: &str,
            req: restore_pb::LogReplicationRequest,
        ) -> Result<restore_pb::LogReplicationResponse, RestoreError> {
            self.server.replicate_log(req).await
        }

        async fn snapshot_chunk(
            &self,
            _leader: &str,
            req: restore_pb::SnapshotChunkRequest,
        ) -> Result<restore_pb::SnapshotChunkResponse, RestoreError> {
            self.server.snapshot_chunk(req).await
        }
    }

    struct UnreachableTransport;

    #[tonic::async_trait]
    impl RestoreTransport for UnreachableTransport {
        async fn restore_info(
            &self,
            _leader: &str,
            _req: restore_pb::RestoreInfoRequest,
        ) -> Result<restore_pb::RestoreInfoResponse, RestoreError> {
            Err(RestoreError::Network("connection refused".into()))
        }

        async fn replicate_log(
            &self,
            _leader: &str,
            _req: restore_pb::LogReplicationRequest,
        ) -> Result<restore_pb::LogReplicationResponse, RestoreError> {
            Err(RestoreError::Network("connection refused".into()))
        }

        async fn snapshot_chunk(
            &self,
            _leader: &str,
            _req: restore_pb::SnapshotChunkRequest,
        ) -> Result<restore_pb::SnapshotChunkResponse, RestoreError> {
            Err(RestoreError::Network("connection refused".into()))
        }
    }

    /// Delegates to the in-process server, corrupting selected responses
    /// exactly once.
    struct CorruptOnce {
        inner: LocalTransport,
        empty_replication: std::sync::atomic::AtomicBool,
        shifted_chunk: std::sync::atomic::AtomicBool,
    }

    impl CorruptOnce {
        fn new(server: RestoreServer) -> Self {
            Self {
                inner: LocalTransport { server },
                empty_replication: false.into(),
                shifted_chunk: false.into(),
            }
        }
    }

    #[tonic::async_trait]
    impl RestoreTransport for CorruptOnce {
        async fn restore_info(
            &self,
            leader: &str,
            req: restore_pb::RestoreInfoRequest,
        ) -> Result<restore_pb::RestoreInfoResponse, RestoreError> {
            self.inner.restore_info(leader, req).await
        }

        async fn replicate_log(
            &self,
            leader: &str,
            req: restore_pb::LogReplicationRequest,
        ) -> Result<restore_pb::LogReplicationResponse, RestoreError> {
            if self.empty_replication.swap(false, Ordering::SeqCst) {
                return Ok(restore_pb::LogReplicationResponse {
                    entries: vec![],
                    more_available: true,
                });
            }
            self.inner.replicate_log(leader, req).await
        }

        async fn snapshot_chunk(
            &self,
            leader: &str,
            req: restore_pb::SnapshotChunkRequest,
        ) -> Result<restore_pb::SnapshotChunkResponse, RestoreError> {
            let mut resp = self.inner.snapshot_chunk(leader, req).await?;
            if self.shifted_chunk.swap(false, Ordering::SeqCst) {
                resp.chunk_index += 1;
            }
            Ok(resp)
        }
    }

    struct Replica {
        stream: Arc<LogStream>,
        snapshots: Arc<SnapshotStore>,
        _dir: tempfile::TempDir,
    }

    async fn replica_with_positions(positions: Option<std::ops::RangeInclusive<i64>>) -> Replica {
        let stream = Arc::new(
            LogStream::open(1, Arc::new(MemStorage::new()), Default::default())
                .await
                .unwrap(),
        );
        if let Some(positions) = positions {
            let writer = stream.new_writer();
            let entries: Vec<LogEntry> = positions
                .map(|p| LogEntry::new(p, Bytes::new(), Bytes::from(format!("v{p}"))))
                .collect();
            writer.append_with_positions(entries).await.unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let snapshots = Arc::new(SnapshotStore::open(dir.path().join("snapshots")).await.unwrap());

        Replica {
            stream,
            snapshots,
            _dir: dir,
        }
    }

    async fn server_for(leader: &Replica) -> RestoreServer {
        let registry = Arc::new(PartitionRegistry::new());
        registry
            .insert(Arc::new(Partition::new(
                1,
                leader.stream.clone(),
                leader.snapshots.clone(),
            )))
            .await;
        RestoreServer::new(registry)
    }

    fn client_for(server: RestoreServer) -> RestoreClient {
        RestoreClient::new(
            1,
            Arc::new(FixedLeader("leader-1")),
            Arc::new(LocalTransport { server }),
            RestoreOptions::builder()
                .max_entries_per_request(7)
                .build(),
        )
    }

    async fn read_all_positions(stream: &LogStream) -> Vec<i64> {
        let mut reader = stream.new_reader();
        let mut positions = vec![];
        while let Some(entry) = reader.next().await.unwrap() {
            positions.push(entry.position);
        }
        positions
    }

    #[tokio::test]
    async fn test_log_replication_roundtrip() {
        let leader = replica_with_positions(Some(1..=100)).await;
        let follower = replica_with_positions(Some(1..=40)).await;

        let client = client_for(server_for(&leader).await);
        let result = client
            .run(&follower.stream, &follower.snapshots)
            .await
            .unwrap();

        assert_eq!(result.state, RestoreState::CaughtUp);
        assert_eq!(result.last_position, 100);

        // Exactly [1..=100], no duplicates or gaps.
        let positions = read_all_positions(&follower.stream).await;
        assert_eq!(positions, (1..=100).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_snapshot_then_log_restore() {
        // Leader compacted everything below 50 and snapshotted at 50.
        let leader = replica_with_positions(Some(51..=100)).await;
        leader
            .snapshots
            .write_snapshot(50, b"derived state at 50")
            .await
            .unwrap();
        let follower = replica_with_positions(None).await;

        let client = client_for(server_for(&leader).await);
        let result = client
            .run(&follower.stream, &follower.snapshots)
            .await
            .unwrap();

        assert_eq!(result.state, RestoreState::CaughtUp);
        assert_eq!(result.last_position, 100);

        let installed = follower.snapshots.latest().await.unwrap().unwrap();
        assert_eq!(installed.position, 50);

        let positions = read_all_positions(&follower.stream).await;
        assert_eq!(positions, (51..=100).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_caught_up_is_noop() {
        let leader = replica_with_positions(Some(1..=10)).await;
        let follower = replica_with_positions(Some(1..=10)).await;

        let client = client_for(server_for(&leader).await);

        for _ in 0..2 {
            let result = client
                .run(&follower.stream, &follower.snapshots)
                .await
                .unwrap();
            assert_eq!(result.state, RestoreState::CaughtUp);
            assert_eq!(result.last_position, 10);
        }

        assert_eq!(follower.stream.last_position(), 10);
        assert_eq!(read_all_positions(&follower.stream).await.len(), 10);
    }

    #[tokio::test]
    async fn test_bad_replication_response_renegotiates() {
        let leader = replica_with_positions(Some(1..=20)).await;
        let follower = replica_with_positions(None).await;

        // First batch claims more entries but carries none.
        let transport = CorruptOnce::new(server_for(&leader).await);
        transport.empty_replication.store(true, Ordering::SeqCst);

        let client = RestoreClient::new(
            1,
            Arc::new(FixedLeader("leader-1")),
            Arc::new(transport),
            RestoreOptions::builder().max_entries_per_request(7).build(),
        );

        let result = client
            .run(&follower.stream, &follower.snapshots)
            .await
            .unwrap();
        assert_eq!(result.state, RestoreState::CaughtUp);
        assert_eq!(result.last_position, 20);
        assert_eq!(
            read_all_positions(&follower.stream).await,
            (1..=20).collect::<Vec<i64>>()
        );
    }

    #[tokio::test]
    async fn test_snapshot_chunk_mismatch_renegotiates() {
        let leader = replica_with_positions(Some(51..=100)).await;
        leader
            .snapshots
            .write_snapshot(50, b"derived state at 50")
            .await
            .unwrap();
        let follower = replica_with_positions(None).await;

        // First chunk response carries the wrong chunk index.
        let transport = CorruptOnce::new(server_for(&leader).await);
        transport.shifted_chunk.store(true, Ordering::SeqCst);

        let client = RestoreClient::new(
            1,
            Arc::new(FixedLeader("leader-1")),
            Arc::new(transport),
            Default::default(),
        );

        let result = client
            .run(&follower.stream, &follower.snapshots)
            .await
            .unwrap();
        assert_eq!(result.state, RestoreState::CaughtUp);
        assert_eq!(result.last_position, 100);

        let installed = follower.snapshots.latest().await.unwrap().unwrap();
        assert_eq!(installed.position, 50);
    }

    #[tokio::test]
    async fn test_persistent_bad_responses_fail_session() {
        let leader = replica_with_positions(Some(1..=5)).await;
        let follower = replica_with_positions(None).await;

        // Every batch is bad; renegotiation must not loop forever.
        let transport = CorruptOnce::new(server_for(&leader).await);

        struct AlwaysEmpty(CorruptOnce);

        #[tonic::async_trait]
        impl RestoreTransport for AlwaysEmpty {
            async fn restore_info(
                &self,
                leader: &str,
                req: restore_pb::RestoreInfoRequest,
            ) -> Result<restore_pb::RestoreInfoResponse, RestoreError> {
                self.0.restore_info(leader, req).await
            }

            async fn replicate_log(
                &self,
                _leader: &str,
                _req: restore_pb::LogReplicationRequest,
            ) -> Result<restore_pb::LogReplicationResponse, RestoreError> {
                Ok(restore_pb::LogReplicationResponse {
                    entries: vec![],
                    more_available: true,
                })
            }

            async fn snapshot_chunk(
                &self,
                leader: &str,
                req: restore_pb::SnapshotChunkRequest,
            ) -> Result<restore_pb::SnapshotChunkResponse, RestoreError> {
                self.0.snapshot_chunk(leader, req).await
            }
        }

        let client = RestoreClient::new(
            1,
            Arc::new(FixedLeader("leader-1")),
            Arc::new(AlwaysEmpty(transport)),
            RestoreOptions::builder().max_attempts(2).build(),
        );

        let err = client
            .run(&follower.stream, &follower.snapshots)
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Validation(_)));
        assert_eq!(follower.stream.last_position(), 0);
    }

    #[tokio::test]
    async fn test_compacted_leader_without_snapshot_fails() {
        let leader = replica_with_positions(Some(51..=60)).await;
        let follower = replica_with_positions(None).await;

        let client = client_for(server_for(&leader).await);
        let err = client
            .run(&follower.stream, &follower.snapshots)
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_leader_exhausts_retries() {
        let follower = replica_with_positions(None).await;

        let client = RestoreClient::new(
            1,
            Arc::new(FixedLeader("leader-1")),
            Arc::new(UnreachableTransport),
            RestoreOptions::builder().max_attempts(3).build(),
        );

        let err = client
            .run(&follower.stream, &follower.snapshots)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RestoreError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_no_leader() {
        let follower = replica_with_positions(None).await;

        let client = RestoreClient::new(
            1,
            Arc::new(NoLeader),
            Arc::new(UnreachableTransport),
            Default::default(),
        );

        let err = client
            .run(&follower.stream, &follower.snapshots)
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::NoLeader(1)));
    }
}
