use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::entry::{LogEntry, NO_SOURCE_INDEX};
use super::flow_control::FlowControl;
use super::{AppendRequest, LogStreamError, StreamState};

/// One record to append. `source_index` links a follow-up record to the
/// command at that offset of the same batch, or `NO_SOURCE_INDEX`.
#[derive(Debug, Clone)]
pub struct AppendItem {
    pub metadata: Bytes,
    pub value: Bytes,
    pub source_index: i32,
}

impl AppendItem {
    pub fn new(metadata: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            metadata: metadata.into(),
            value: value.into(),
            source_index: NO_SOURCE_INDEX,
        }
    }

    pub fn with_source_index(mut self, source_index: i32) -> Self {
        self.source_index = source_index;
        self
    }
}

/// Handle onto the partition's single append task. Cheap to clone; all
/// clones feed the same task, which is what keeps positions strictly
/// increasing.
#[derive(Clone)]
pub struct LogStreamWriter {
    input: mpsc::Sender<AppendRequest>,
    flow: Arc<FlowControl>,
    state: Arc<StreamState>,
}

impl LogStreamWriter {
    pub(crate) fn new(
        input: mpsc::Sender<AppendRequest>,
        flow: Arc<FlowControl>,
        state: Arc<StreamState>,
    ) -> Self {
        Self { input, flow, state }
    }

    /// Appends one batch, assigning positions at write time. Suspends on
    /// flow control until capacity is available; resolves once the batch
    /// is durable, with the position of its last entry.
    pub async fn append(&self, batch: Vec<AppendItem>) -> Result<i64, LogStreamError> {
        let entries = batch
            .into_iter()
            .map(|item| LogEntry {
                position: 0, // assigned by the append task
                source_index: item.source_index,
                metadata: item.metadata,
                value: item.value,
            })
            .collect();

        self.submit(entries, true).await
    }

    pub async fn append_entry(
        &self,
        metadata: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<i64, LogStreamError> {
        self.append(vec![AppendItem::new(metadata, value)]).await
    }

    /// Appends entries that already carry positions, e.g. entries
    /// replicated from a leader during restore. Positions are preserved
    /// verbatim, and rejected unless strictly increasing above the
    /// current last position.
    pub async fn append_with_positions(
        &self,
        entries: Vec<LogEntry>,
    ) -> Result<i64, LogStreamError> {
        self.submit(entries, false).await
    }

    /// Position of the newest durably visible entry.
    pub fn last_position(&self) -> i64 {
        self.state.last_position()
    }

    async fn submit(
        &self,
        entries: Vec<LogEntry>,
        assign_positions: bool,
    ) -> Result<i64, LogStreamError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(LogStreamError::Closed);
        }

        let permit = self.flow.admit().await.map_err(|_| LogStreamError::Closed)?;

        let (done_tx, done_rx) = oneshot::channel();
        self.input
            .send(AppendRequest {
                entries,
                assign_positions,
                permit,
                done: done_tx,
            })
            .await
            .map_err(|_| LogStreamError::Closed)?;

        done_rx.await.map_err(|_| LogStreamError::Closed)?
    }
}
