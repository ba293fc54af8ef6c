mod file_storage;
mod mem_storage;

pub use file_storage::FileStorage;
pub use mem_storage::MemStorage;

use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage file already exists")]
    FileExists,
    #[error("failed to open storage file: {0}")]
    FailedToOpen(std::io::Error),
    #[error("failed to read storage: {0}")]
    FailedToRead(std::io::Error),
    #[error("failed to write storage: {0}")]
    FailedToWrite(std::io::Error),
    #[error("failed to seek storage: {0}")]
    FailedToSeek(std::io::Error),
    #[error("bad storage header magic")]
    BadMagic,
    #[error("corrupt block frame at address {0}")]
    CorruptBlock(u64),
}

/// Outcome of a block read. Absence is an ordinary result, not an error.
#[derive(Debug)]
pub enum BlockRead {
    Found {
        data: Bytes,
        /// Address of the block written after this one, if any.
        next_address: Option<u64>,
    },
    NotFound,
}

/// Byte-addressable append/read surface the log stream and block index
/// build upon. One block holds the entries of one write batch; addresses
/// are opaque to callers and only obtained from `append_block` or by
/// walking `first_block_address`/`next_address`.
#[tonic::async_trait]
pub trait LogStorage: Send + Sync {
    /// Persists one block and returns its address. The block is durable
    /// when this returns.
    async fn append_block(&self, block: Bytes) -> Result<u64, StorageError>;

    async fn read_block(&self, address: u64) -> Result<BlockRead, StorageError>;

    /// Address of the oldest block still present, or `None` for an empty
    /// storage.
    async fn first_block_address(&self) -> Result<Option<u64>, StorageError>;
}
