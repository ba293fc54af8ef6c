//! Snapshots are opaque checkpoints of derived state at a known log
//! position. They bound how far back restore must replicate the log:
//! nothing below an installed snapshot's position is ever replayed.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

pub const SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;

const SNAPSHOT_PREFIX: &str = "snapshot-";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no snapshot at position {0}")]
    NoSnapshot(i64),
    #[error("chunk index {idx} out of range, chunk count {count}")]
    ChunkOutOfRange { idx: u32, count: u32 },
    #[error("chunk {given} received, expected {expected}")]
    ChunkOutOfOrder { expected: u32, given: u32 },
    #[error("snapshot length mismatch: expected {expected}, received {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub position: i64,
    pub length: u64,
    pub chunk_count: u32,
}

#[derive(Debug, Clone)]
pub struct SnapshotChunk {
    pub position: i64,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub total_length: u64,
    pub data: Bytes,
    pub last: bool,
}

fn chunk_count_for(length: u64) -> u32 {
    (length.div_ceil(SNAPSHOT_CHUNK_SIZE as u64)).max(1) as u32
}

/// Directory of snapshot files, one file per snapshot, named by the log
/// position the checkpoint covers. Installation is atomic: a snapshot is
/// either fully present or absent.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<SnapshotStore, SnapshotError> {
        fs::create_dir_all(dir.as_ref()).await?;
        Ok(SnapshotStore {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn snapshot_path(&self, position: i64) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_PREFIX}{position}"))
    }

    /// Newest installed snapshot, or `None` when there is none yet.
    pub async fn latest(&self) -> Result<Option<SnapshotMeta>, SnapshotError> {
        let mut newest: Option<i64> = None;

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(ent) = entries.next_entry().await? {
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(SNAPSHOT_PREFIX) else {
                continue;
            };
            let Ok(position) = rest.parse::<i64>() else {
                warn!("ignoring unparsable snapshot file name: {name}");
                continue;
            };

            if newest.map(|n| position > n).unwrap_or(true) {
                newest = Some(position);
            }
        }

        match newest {
            None => Ok(None),
            Some(position) => self.meta(position).await.map(Some),
        }
    }

    pub async fn meta(&self, position: i64) -> Result<SnapshotMeta, SnapshotError> {
        let length = fs::metadata(self.snapshot_path(position))
            .await
            .map_err(|_| SnapshotError::NoSnapshot(position))?
            .len();

        Ok(SnapshotMeta {
            position,
            length,
            chunk_count: chunk_count_for(length),
        })
    }

    /// Serves one fixed-size chunk of an installed snapshot; stateless,
    /// chunks may be requested in any order and re-requested.
    pub async fn read_chunk(
        &self,
        position: i64,
        chunk_index: u32,
    ) -> Result<SnapshotChunk, SnapshotError> {
        let meta = self.meta(position).await?;
        if chunk_index >= meta.chunk_count {
            return Err(SnapshotError::ChunkOutOfRange {
                idx: chunk_index,
                count: meta.chunk_count,
            });
        }

        let offset = chunk_index as u64 * SNAPSHOT_CHUNK_SIZE as u64;
        let len = (meta.length - offset).min(SNAPSHOT_CHUNK_SIZE as u64) as usize;

        let mut file = File::open(self.snapshot_path(position)).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data).await?;

        Ok(SnapshotChunk {
            position,
            chunk_index,
            chunk_count: meta.chunk_count,
            total_length: meta.length,
            data: data.into(),
            last: chunk_index + 1 == meta.chunk_count,
        })
    }

    /// Writes a complete snapshot directly, for the side producing
    /// checkpoints locally.
    pub async fn write_snapshot(
        &self,
        position: i64,
        data: &[u8],
    ) -> Result<SnapshotMeta, SnapshotError> {
        let tmp = self.dir.join(format!("{SNAPSHOT_PREFIX}{position}.tmp"));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        drop(file);

        fs::rename(&tmp, self.snapshot_path(position)).await?;
        info!("wrote snapshot at position {position}, {} bytes", data.len());

        Ok(SnapshotMeta {
            position,
            length: data.len() as u64,
            chunk_count: chunk_count_for(data.len() as u64),
        })
    }
}

/// Accumulates transferred chunks into a temporary file and installs the
/// snapshot atomically once the last chunk arrived and validated.
/// Dropping the receiver before completion leaves no trace behind the
/// next `begin`.
pub struct SnapshotReceiver {
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: File,
    meta: SnapshotMeta,
    next_chunk: u32,
    written: u64,
}

impl SnapshotReceiver {
    pub async fn begin(
        store: &SnapshotStore,
        position: i64,
        total_length: u64,
        chunk_count: u32,
    ) -> Result<SnapshotReceiver, SnapshotError> {
        let tmp_path = store.dir.join(format!("restore-{position}.tmp"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;

        Ok(SnapshotReceiver {
            final_path: store.snapshot_path(position),
            tmp_path,
            file,
            meta: SnapshotMeta {
                position,
                length: total_length,
                chunk_count,
            },
            next_chunk: 0,
            written: 0,
        })
    }

    pub fn next_chunk(&self) -> u32 {
        self.next_chunk
    }

    /// Applies the next sequential chunk. Returns the installed meta once
    /// the last chunk passed validation, `None` while more chunks remain.
    pub async fn apply_chunk(
        &mut self,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<Option<SnapshotMeta>, SnapshotError> {
        if chunk_index != self.next_chunk {
            return Err(SnapshotError::ChunkOutOfOrder {
                expected: self.next_chunk,
                given: chunk_index,
            });
        }

        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        self.next_chunk += 1;

        if self.next_chunk < self.meta.chunk_count {
            return Ok(None);
        }

        if self.written != self.meta.length {
            return Err(SnapshotError::LengthMismatch {
                expected: self.meta.length,
                actual: self.written,
            });
        }

        self.file.sync_data().await?;
        fs::rename(&self.tmp_path, &self.final_path).await?;
        info!(
            "installed snapshot at position {}, {} bytes",
            self.meta.position, self.written
        );

        Ok(Some(self.meta))
    }

    /// Discards the partial download.
    pub async fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.tmp_path).await;
    }
}
