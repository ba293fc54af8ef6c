use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::info;

use crate::log::{LogStream, LogStreamOptions};
use crate::snapshot::SnapshotStore;
use crate::storage::FileStorage;

/// One partition replica: its log stream plus its snapshot store.
pub struct Partition {
    pub id: u32,
    pub stream: Arc<LogStream>,
    pub snapshots: Arc<SnapshotStore>,
}

impl Partition {
    /// Opens (or initializes) the partition under
    /// `<data_dir>/partition-<id>/`.
    pub async fn open(
        id: u32,
        data_dir: impl AsRef<Path>,
        options: LogStreamOptions,
    ) -> Result<Partition> {
        let dir = data_dir.as_ref().join(format!("partition-{id}"));
        tokio::fs::create_dir_all(&dir).await?;

        let storage = Arc::new(FileStorage::open(dir.join("log")).await?);
        let stream = Arc::new(LogStream::open(id, storage, options).await?);
        let snapshots = Arc::new(SnapshotStore::open(dir.join("snapshots")).await?);

        info!("opened partition {id} at {dir:?}");

        Ok(Partition {
            id,
            stream,
            snapshots,
        })
    }

    pub fn new(id: u32, stream: Arc<LogStream>, snapshots: Arc<SnapshotStore>) -> Partition {
        Partition {
            id,
            stream,
            snapshots,
        }
    }
}

/// Partitions served by this member, injected into the restore server
/// rather than held in process-wide statics.
#[derive(Default)]
pub struct PartitionRegistry {
    partitions: RwLock<HashMap<u32, Arc<Partition>>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn insert(&self, partition: Arc<Partition>) {
        self.partitions.write().await.insert(partition.id, partition);
    }

    pub async fn get(&self, id: u32) -> Option<Arc<Partition>> {
        self.partitions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: u32) -> Option<Arc<Partition>> {
        self.partitions.write().await.remove(&id)
    }

    pub async fn close_all(&self) {
        for partition in self.partitions.write().await.values() {
            partition.stream.close().await;
        }
    }
}
