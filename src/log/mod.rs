pub mod block_index;
pub mod entry;
pub mod flow_control;
mod reader;
mod writer;

pub use block_index::{BlockIndex, IndexError};
pub use entry::{LogEntry, FRAME_HEADER_LEN, NO_SOURCE_INDEX};
pub use flow_control::{FlowControl, FlowControlOptions};
pub use reader::LogStreamReader;
pub use writer::{AppendItem, LogStreamWriter};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};
use typed_builder::TypedBuilder;

use crate::storage::{LogStorage, StorageError};
use flow_control::AppendPermit;

const APPEND_CHANNEL_LEN: usize = 1024;

#[derive(Error, Debug)]
pub enum LogStreamError {
    #[error("log stream closed")]
    Closed,
    #[error("empty append batch")]
    EmptyBatch,
    #[error("entry positions must be strictly increasing and above {last}")]
    InvalidPositions { last: i64 },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct LogStreamOptions {
    #[builder(default = 4096)]
    pub block_index_capacity: usize,
    #[builder(default)]
    pub flow_control: FlowControlOptions,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Shared between the single append task and all readers. The last
/// published position is the visibility boundary: readers never return
/// entries above it.
pub(crate) struct StreamState {
    pub(crate) partition_id: u32,
    pub(crate) last_position: AtomicI64,
    pub(crate) closed: AtomicBool,
}

impl StreamState {
    pub(crate) fn last_position(&self) -> i64 {
        self.last_position.load(Ordering::Acquire)
    }
}

pub type RecordAvailableListener = Box<dyn Fn(i64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerRegistry = parking_lot::RwLock<HashMap<u64, RecordAvailableListener>>;

pub(crate) struct AppendRequest {
    pub(crate) entries: Vec<LogEntry>,
    pub(crate) assign_positions: bool,
    pub(crate) permit: AppendPermit,
    pub(crate) done: oneshot::Sender<Result<i64, LogStreamError>>,
}

/// Append-only, position-addressed log of one partition. Owns the single
/// writer task; hands out independent readers.
pub struct LogStream {
    storage: Arc<dyn LogStorage>,
    index: Arc<BlockIndex>,
    state: Arc<StreamState>,
    flow: Arc<FlowControl>,
    listeners: Arc<ListenerRegistry>,
    next_listener_id: AtomicU64,

    input: mpsc::Sender<AppendRequest>,
    stop_tx: mpsc::Sender<()>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LogStream {
    /// Opens the partition log over `storage`, rebuilding the block index
    /// and the write cursor from whatever blocks already exist.
    pub async fn open(
        partition_id: u32,
        storage: Arc<dyn LogStorage>,
        options: LogStreamOptions,
    ) -> Result<LogStream, LogStreamError> {
        let index = Arc::new(BlockIndex::new(options.block_index_capacity));
        let last_position = index.recover(storage.as_ref()).await?;

        let state = Arc::new(StreamState {
            partition_id,
            last_position: AtomicI64::new(last_position.unwrap_or(0)),
            closed: AtomicBool::new(false),
        });

        let flow = Arc::new(FlowControl::new(&options.flow_control));
        let listeners: Arc<ListenerRegistry> = Arc::new(Default::default());

        let (input_tx, input_rx) = mpsc::channel(APPEND_CHANNEL_LEN);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let task = tokio::spawn(run_append_task(
            storage.clone(),
            index.clone(),
            state.clone(),
            listeners.clone(),
            input_rx,
            stop_rx,
        ));

        info!(
            "opened log stream for partition {}, last position: {}",
            partition_id,
            state.last_position()
        );

        Ok(LogStream {
            storage,
            index,
            state,
            flow,
            listeners,
            next_listener_id: AtomicU64::new(1),
            input: input_tx,
            stop_tx,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub fn partition_id(&self) -> u32 {
        self.state.partition_id
    }

    /// Position of the newest durably visible entry, 0 for an empty log.
    pub fn last_position(&self) -> i64 {
        self.state.last_position()
    }

    /// Position of the oldest entry still present, `None` for an empty
    /// log. Everything below it has been compacted away.
    pub fn first_position(&self) -> Option<i64> {
        self.index.log_position(0).ok()
    }

    pub fn block_index(&self) -> &Arc<BlockIndex> {
        &self.index
    }

    pub fn new_writer(&self) -> LogStreamWriter {
        LogStreamWriter::new(self.input.clone(), self.flow.clone(), self.state.clone())
    }

    pub fn new_reader(&self) -> LogStreamReader {
        LogStreamReader::new(self.storage.clone(), self.index.clone(), self.state.clone())
    }

    /// The listener is invoked with the newly published last position
    /// after each durable batch, from the append task. It must return
    /// quickly and tolerate duplicate notifications.
    pub fn register_record_available_listener(&self, listener: RecordAvailableListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, listener);
        ListenerId(id)
    }

    pub fn remove_record_available_listener(&self, id: ListenerId) {
        self.listeners.write().remove(&id.0);
    }

    /// Stops the append task. Does not return before queued appends are
    /// either durable or reported closed; subsequent writer and reader
    /// calls fail.
    pub async fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.flow.close();
        let _ = self.stop_tx.send(()).await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("append task for partition {} panicked: {e}", self.partition_id());
            }
        }

        info!("closed log stream for partition {}", self.partition_id());
    }
}

async fn run_append_task(
    storage: Arc<dyn LogStorage>,
    index: Arc<BlockIndex>,
    state: Arc<StreamState>,
    listeners: Arc<ListenerRegistry>,
    mut input_rx: mpsc::Receiver<AppendRequest>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let partition_id = state.partition_id;
    info!("start append task for partition {}", partition_id);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            req = input_rx.recv() => {
                let Some(req) = req else { break };
                let res = handle_append(&storage, &index, &state, &req.entries, req.assign_positions).await;

                if let Ok(last) = res {
                    for listener in listeners.read().values() {
                        listener(last);
                    }
                }

                // The permit is released once the caller learns the outcome.
                drop(req.permit);
                let _ = req.done.send(res);
            }
        }
    }

    // Fail whatever is still queued instead of leaving callers pending.
    input_rx.close();
    while let Ok(req) = input_rx.try_recv() {
        let _ = req.done.send(Err(LogStreamError::Closed));
    }

    info!("stop append task for partition {}", partition_id);
}

async fn handle_append(
    storage: &Arc<dyn LogStorage>,
    index: &Arc<BlockIndex>,
    state: &Arc<StreamState>,
    entries: &[LogEntry],
    assign_positions: bool,
) -> Result<i64, LogStreamError> {
    if entries.is_empty() {
        return Err(LogStreamError::EmptyBatch);
    }

    let last = state.last_position();

    let batch: Vec<LogEntry> = if assign_positions {
        entries
            .iter()
            .enumerate()
            .map(|(i, e)| LogEntry {
                position: last + 1 + i as i64,
                ..e.clone()
            })
            .collect()
    } else {
        let mut prev = last;
        for e in entries {
            if e.position <= prev {
                return Err(LogStreamError::InvalidPositions { last: prev });
            }
            prev = e.position;
        }
        entries.to_vec()
    };

    let mut buf = BytesMut::new();
    for e in &batch {
        e.encode(&mut buf);
    }

    let address = storage.append_block(buf.freeze()).await?;

    index
        .add_block(batch[0].position, address)
        .inspect_err(|e| error!("failed to index block at {address}: {e}"))?;

    let new_last = batch.last().unwrap().position;
    state.last_position.store(new_last, Ordering::Release);

    Ok(new_last)
}
