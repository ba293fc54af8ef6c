use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::log::entry::LogEntry;
use crate::storage::{BlockRead, LogStorage, StorageError};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("ordering violation: position {given} not greater than last recorded {last}")]
    OrderingViolation { last: i64, given: i64 },
    #[error("block index capacity {0} exhausted")]
    CapacityExhausted(usize),
    #[error("index {idx} out of range, size {size}")]
    OutOfRange { idx: usize, size: usize },
    #[error("storage error during index recovery: {0}")]
    Recovery(#[from] StorageError),
    #[error("corrupt block during index recovery at address {0}")]
    CorruptBlock(u64),
}

/// Sparse mapping from log positions to physical block addresses: one
/// entry per block, keyed by the smallest position appended in that
/// block.
///
/// Single writer, many readers. The published size is the only
/// cross-thread visibility boundary: it is stored last with `Release`
/// and loaded first with `Acquire`, so a reader observing size N sees
/// the first N entries fully written.
pub struct BlockIndex {
    positions: Box<[AtomicI64]>,
    addresses: Box<[AtomicU64]>,
    size: AtomicUsize,
}

impl BlockIndex {
    /// Capacity is fixed for the lifetime of the index. Running out of it
    /// is an operational error, not a retryable condition.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "block index capacity must be positive");

        Self {
            positions: (0..capacity).map(|_| AtomicI64::new(0)).collect(),
            addresses: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn log_position(&self, idx: usize) -> Result<i64, IndexError> {
        let size = self.size();
        if idx >= size {
            return Err(IndexError::OutOfRange { idx, size });
        }
        Ok(self.positions[idx].load(Ordering::Relaxed))
    }

    pub fn address(&self, idx: usize) -> Result<u64, IndexError> {
        let size = self.size();
        if idx >= size {
            return Err(IndexError::OutOfRange { idx, size });
        }
        Ok(self.addresses[idx].load(Ordering::Relaxed))
    }

    /// Records the block holding `log_position` as its smallest entry
    /// position. Positions must arrive strictly increasing; violating
    /// that is an integration bug and fails without mutating the index.
    pub fn add_block(&self, log_position: i64, storage_address: u64) -> Result<usize, IndexError> {
        let size = self.size();

        if size > 0 {
            let last = self.positions[size - 1].load(Ordering::Relaxed);
            if log_position <= last {
                warn!(
                    "rejecting out of order index entry: position {}, last {}",
                    log_position, last
                );
                return Err(IndexError::OrderingViolation {
                    last,
                    given: log_position,
                });
            }
        }

        if size == self.capacity() {
            return Err(IndexError::CapacityExhausted(self.capacity()));
        }

        self.positions[size].store(log_position, Ordering::Relaxed);
        self.addresses[size].store(storage_address, Ordering::Relaxed);
        // Publication point for concurrent readers.
        self.size.store(size + 1, Ordering::Release);

        Ok(size + 1)
    }

    /// Finds the block whose position range contains `position`: the
    /// greatest recorded position that is <= the requested one. The last
    /// block is open ended. `None` when the index is empty or the
    /// position precedes the first block.
    pub fn lookup_block_address(&self, position: i64) -> Option<u64> {
        let size = self.size();
        if size == 0 {
            return None;
        }

        let (mut lo, mut hi) = (0usize, size);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.positions[mid].load(Ordering::Relaxed) <= position {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        // lo is now the count of entries with position <= target.
        if lo == 0 {
            return None;
        }

        Some(self.addresses[lo - 1].load(Ordering::Relaxed))
    }

    /// Rebuilds the index by scanning storage from its first block
    /// forward, one index entry per physical block. Returns the highest
    /// entry position found so the write cursor can be restored.
    pub async fn recover(&self, storage: &dyn LogStorage) -> Result<Option<i64>, IndexError> {
        let mut next = storage.first_block_address().await?;
        let mut last_position = None;

        while let Some(address) = next {
            let (data, next_address) = match storage.read_block(address).await? {
                BlockRead::Found { data, next_address } => (data, next_address),
                BlockRead::NotFound => break,
            };

            let first_position = LogEntry::peek_position(&data)
                .map_err(|_| IndexError::CorruptBlock(address))?;
            // An undersized index is a configuration problem, not data
            // corruption; keep that distinction for the operator.
            self.add_block(first_position, address).map_err(|e| match e {
                IndexError::CapacityExhausted(c) => IndexError::CapacityExhausted(c),
                _ => IndexError::CorruptBlock(address),
            })?;

            // Skip over the fragments to the last position of the block.
            let entries = crate::log::entry::decode_block(data)
                .map_err(|_| IndexError::CorruptBlock(address))?;
            if let Some(last) = entries.last() {
                last_position = Some(last.position);
            }

            next = next_address;
        }

        debug!(
            "recovered block index: {} blocks, last position {:?}",
            self.size(),
            last_position
        );

        Ok(last_position)
    }
}
