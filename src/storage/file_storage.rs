use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::slice;

use bytes::Bytes;
use derivative::Derivative;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{BlockRead, LogStorage, StorageError};

const STORAGE_MAGIC: u64 = 0x464c_4f47; // "FLOG"
const BLOCK_FRAME_LEN: u64 = 4;

#[derive(Derivative)]
#[derivative(Debug)]
#[repr(C, packed)]
struct StorageHeader {
    magic: u64,
    format: u8,
    first_block_offset: u64, // always 4096

    #[derivative(Debug = "ignore")]
    padding_: [u8; 4096 - 17],
} // 4k fixed

struct StorageInner {
    file: File,
    next_offset: u64,
}

/// Append-only block file. Each block is framed as `[u32 len][bytes]`;
/// the block address is the file offset of its frame.
pub struct FileStorage {
    path: PathBuf,
    inner: Mutex<StorageInner>,
}

impl FileStorage {
    pub async fn create(path: impl AsRef<Path>) -> Result<FileStorage, StorageError> {
        if path.as_ref().exists() {
            error!("storage file {:?} already exists", path.as_ref());
            return Err(StorageError::FileExists);
        }

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(path.as_ref())
            .await
            .map_err(StorageError::FailedToOpen)?;

        let header = StorageHeader {
            magic: STORAGE_MAGIC,
            format: 0x1,
            first_block_offset: 4096,
            padding_: [0; 4079],
        };

        let header_data = unsafe {
            slice::from_raw_parts(
                &header as *const _ as *const u8,
                std::mem::size_of::<StorageHeader>(),
            )
        };

        file.write_all(header_data)
            .await
            .map_err(StorageError::FailedToWrite)?;
        file.sync_data().await.map_err(StorageError::FailedToWrite)?;

        info!("created storage file at {:?}", path.as_ref());

        Ok(FileStorage {
            path: path.as_ref().to_path_buf(),
            inner: Mutex::new(StorageInner {
                file,
                next_offset: 4096,
            }),
        })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<FileStorage, StorageError> {
        let mut file = OpenOptions::new()
            .write(true)
            .read(true)
            .open(path.as_ref())
            .await
            .map_err(StorageError::FailedToOpen)?;

        let mut header: StorageHeader = unsafe { std::mem::zeroed() };
        let header_data = unsafe {
            slice::from_raw_parts_mut(
                &mut header as *mut _ as *mut u8,
                std::mem::size_of::<StorageHeader>(),
            )
        };
        file.read_exact(header_data)
            .await
            .map_err(StorageError::FailedToRead)?;

        if { header.magic } != STORAGE_MAGIC {
            return Err(StorageError::BadMagic);
        }

        // Walk the block frames to find the append offset, like an
        // unsealed wal load.
        let file_len = file
            .metadata()
            .await
            .map_err(StorageError::FailedToRead)?
            .len();

        let mut offset = header.first_block_offset;
        loop {
            if offset + BLOCK_FRAME_LEN > file_len {
                break;
            }

            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(StorageError::FailedToSeek)?;
            let len = file.read_u32_le().await.map_err(StorageError::FailedToRead)?;
            if len == 0 || offset + BLOCK_FRAME_LEN + len as u64 > file_len {
                break;
            }

            offset += BLOCK_FRAME_LEN + len as u64;
        }

        debug!(
            "loaded storage file {:?}, append offset: {}",
            path.as_ref(),
            offset
        );

        Ok(FileStorage {
            path: path.as_ref().to_path_buf(),
            inner: Mutex::new(StorageInner {
                file,
                next_offset: offset,
            }),
        })
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<FileStorage, StorageError> {
        if path.as_ref().exists() {
            Self::load(path).await
        } else {
            Self::create(path).await
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[tonic::async_trait]
impl LogStorage for FileStorage {
    async fn append_block(&self, block: Bytes) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().await;

        let address = inner.next_offset;
        inner
            .file
            .seek(SeekFrom::Start(address))
            .await
            .map_err(StorageError::FailedToSeek)?;

        inner
            .file
            .write_u32_le(block.len() as u32)
            .await
            .map_err(StorageError::FailedToWrite)?;
        inner
            .file
            .write_all(&block)
            .await
            .map_err(StorageError::FailedToWrite)?;
        inner
            .file
            .sync_data()
            .await
            .map_err(StorageError::FailedToWrite)?;

        inner.next_offset = address + BLOCK_FRAME_LEN + block.len() as u64;

        Ok(address)
    }

    async fn read_block(&self, address: u64) -> Result<BlockRead, StorageError> {
        let mut inner = self.inner.lock().await;

        if address + BLOCK_FRAME_LEN > inner.next_offset {
            return Ok(BlockRead::NotFound);
        }

        inner
            .file
            .seek(SeekFrom::Start(address))
            .await
            .map_err(StorageError::FailedToSeek)?;
        let len = inner
            .file
            .read_u32_le()
            .await
            .map_err(StorageError::FailedToRead)? as u64;

        if address + BLOCK_FRAME_LEN + len > inner.next_offset {
            return Err(StorageError::CorruptBlock(address));
        }

        let mut data = vec![0u8; len as usize];
        inner
            .file
            .read_exact(&mut data)
            .await
            .map_err(StorageError::FailedToRead)?;

        let next = address + BLOCK_FRAME_LEN + len;
        Ok(BlockRead::Found {
            data: data.into(),
            next_address: if next < inner.next_offset {
                Some(next)
            } else {
                None
            },
        })
    }

    async fn first_block_address(&self) -> Result<Option<u64>, StorageError> {
        let inner = self.inner.lock().await;
        if inner.next_offset > 4096 {
            Ok(Some(4096))
        } else {
            Ok(None)
        }
    }
}
