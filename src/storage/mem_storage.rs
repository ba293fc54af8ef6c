use bytes::Bytes;
use parking_lot::RwLock;

use super::{BlockRead, LogStorage, StorageError};

/// In-memory block storage. Used by tests and by embedders that keep the
/// log ephemeral; addresses are block ordinals.
#[derive(Default)]
pub struct MemStorage {
    blocks: RwLock<Vec<Bytes>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}

#[tonic::async_trait]
impl LogStorage for MemStorage {
    async fn append_block(&self, block: Bytes) -> Result<u64, StorageError> {
        let mut blocks = self.blocks.write();
        blocks.push(block);
        Ok(blocks.len() as u64 - 1)
    }

    async fn read_block(&self, address: u64) -> Result<BlockRead, StorageError> {
        let blocks = self.blocks.read();
        match blocks.get(address as usize) {
            None => Ok(BlockRead::NotFound),
            Some(data) => Ok(BlockRead::Found {
                data: data.clone(),
                next_address: if (address as usize) + 1 < blocks.len() {
                    Some(address + 1)
                } else {
                    None
                },
            }),
        }
    }

    async fn first_block_address(&self) -> Result<Option<u64>, StorageError> {
        if self.blocks.read().is_empty() {
            Ok(None)
        } else {
            Ok(Some(0))
        }
    }
}
