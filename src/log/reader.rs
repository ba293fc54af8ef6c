use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::block_index::BlockIndex;
use super::entry::{decode_block, LogEntry};
use super::{LogStreamError, StreamState};
use crate::storage::{BlockRead, LogStorage};

/// Independent read cursor over the partition log. Readers only ever
/// observe the published prefix of the log and return positions in
/// strictly increasing order per reader instance.
pub struct LogStreamReader {
    storage: Arc<dyn LogStorage>,
    index: Arc<BlockIndex>,
    state: Arc<StreamState>,

    /// Decoded entries of the current block, pruned to positions past the
    /// cursor.
    buffer: VecDeque<LogEntry>,
    /// Position of the last returned entry (or the seek point minus one).
    position: i64,
}

impl LogStreamReader {
    pub(crate) fn new(
        storage: Arc<dyn LogStorage>,
        index: Arc<BlockIndex>,
        state: Arc<StreamState>,
    ) -> Self {
        Self {
            storage,
            index,
            state,
            buffer: VecDeque::new(),
            position: 0,
        }
    }

    /// Position of the entry most recently returned by `next`.
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Positions the reader at `position`, or at the next existing entry
    /// when that exact position is absent. Returns whether the exact
    /// position exists.
    pub async fn seek(&mut self, position: i64) -> Result<bool, LogStreamError> {
        self.check_open()?;

        self.buffer.clear();
        self.position = position.saturating_sub(1);
        self.fill_buffer().await?;

        Ok(self
            .buffer
            .front()
            .map(|e| e.position == position)
            .unwrap_or(false))
    }

    /// Positions the reader strictly past `position`; a negative input
    /// seeks to the first entry. Returns whether a next entry exists.
    pub async fn seek_to_next_event(&mut self, position: i64) -> Result<bool, LogStreamError> {
        if position < 0 {
            self.seek_to_first_event().await?;
        } else {
            self.seek(position + 1).await?;
        }
        Ok(!self.buffer.is_empty())
    }

    /// Positions the reader at the first recorded entry. Returns whether
    /// the log holds any entry at all.
    pub async fn seek_to_first_event(&mut self) -> Result<bool, LogStreamError> {
        self.check_open()?;

        match self.index.log_position(0) {
            Ok(first) => self.seek(first).await,
            Err(_) => {
                // Empty log; well defined, not an error.
                self.buffer.clear();
                self.position = 0;
                Ok(false)
            }
        }
    }

    /// Positions the reader past the newest published entry and returns
    /// that entry's position (0 for an empty log).
    pub async fn seek_to_end(&mut self) -> Result<i64, LogStreamError> {
        self.check_open()?;

        let last = self.state.last_position();
        self.buffer.clear();
        self.position = last;
        Ok(last)
    }

    pub async fn has_next(&mut self) -> Result<bool, LogStreamError> {
        self.check_open()?;
        self.fill_buffer().await?;
        Ok(!self.buffer.is_empty())
    }

    pub async fn peek_next(&mut self) -> Result<Option<LogEntry>, LogStreamError> {
        self.check_open()?;
        self.fill_buffer().await?;
        Ok(self.buffer.front().cloned())
    }

    pub async fn next(&mut self) -> Result<Option<LogEntry>, LogStreamError> {
        self.check_open()?;
        self.fill_buffer().await?;

        match self.buffer.pop_front() {
            None => Ok(None),
            Some(entry) => {
                self.position = entry.position;
                Ok(Some(entry))
            }
        }
    }

    fn check_open(&self) -> Result<(), LogStreamError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(LogStreamError::Closed);
        }
        Ok(())
    }

    /// Ensures the buffer front is the next published entry past the
    /// cursor, walking block by block. Leaves the buffer empty when no
    /// such entry exists yet.
    async fn fill_buffer(&mut self) -> Result<(), LogStreamError> {
        let published = self.state.last_position();

        while let Some(front) = self.buffer.front() {
            if front.position <= self.position {
                self.buffer.pop_front();
            } else if front.position > published {
                self.buffer.clear();
            } else {
                return Ok(());
            }
        }

        let target = self.position + 1;
        let mut address = match self.index.lookup_block_address(target) {
            Some(a) => a,
            None => {
                if self.index.is_empty() {
                    return Ok(());
                }
                // Target precedes the first block; clamp to it.
                self.index.address(0)?
            }
        };

        loop {
            let (data, next_address) = match self.storage.read_block(address).await? {
                BlockRead::Found { data, next_address } => (data, next_address),
                BlockRead::NotFound => return Ok(()),
            };

            let mut entries = decode_block(data).map_err(|_| {
                LogStreamError::Storage(crate::storage::StorageError::CorruptBlock(address))
            })?;
            entries.retain(|e| e.position >= target && e.position <= published);

            if !entries.is_empty() {
                self.buffer = entries.into();
                return Ok(());
            }

            match next_address {
                Some(next) => address = next,
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::log::{AppendItem, LogEntry, LogStream};
    use crate::storage::MemStorage;

    async fn stream_with(batches: &[&[i64]]) -> LogStream {
        let stream = LogStream::open(1, Arc::new(MemStorage::new()), Default::default())
            .await
            .unwrap();
        let writer = stream.new_writer();
        for batch in batches {
            let entries: Vec<LogEntry> = batch
                .iter()
                .map(|p| LogEntry::new(*p, Bytes::new(), Bytes::from(format!("v{p}"))))
                .collect();
            writer.append_with_positions(entries).await.unwrap();
        }
        stream
    }

    #[tokio::test]
    async fn test_sequential_read_in_order() {
        let stream = stream_with(&[&[1, 2, 3], &[4], &[5, 6]]).await;
        let mut reader = stream.new_reader();

        let mut positions = vec![];
        while let Some(entry) = reader.next().await.unwrap() {
            positions.push(entry.position);
        }
        assert_eq!(positions, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(reader.position(), 6);
        assert!(!reader.has_next().await.unwrap());
    }

    #[tokio::test]
    async fn test_seek_exact_and_gap() {
        // Positions with a gap: 10, 12.
        let stream = stream_with(&[&[10, 12]]).await;
        let mut reader = stream.new_reader();

        assert!(reader.seek(10).await.unwrap());
        assert_eq!(reader.next().await.unwrap().unwrap().position, 10);

        // Absent position advances to the next existing entry.
        assert!(!reader.seek(11).await.unwrap());
        assert_eq!(reader.next().await.unwrap().unwrap().position, 12);
    }

    #[tokio::test]
    async fn test_seek_clamps_before_first() {
        let stream = stream_with(&[&[20, 21]]).await;
        let mut reader = stream.new_reader();

        assert!(!reader.seek(5).await.unwrap());
        assert_eq!(reader.next().await.unwrap().unwrap().position, 20);
    }

    #[tokio::test]
    async fn test_seek_past_end() {
        let stream = stream_with(&[&[1, 2]]).await;
        let mut reader = stream.new_reader();

        assert!(!reader.seek(100).await.unwrap());
        assert!(!reader.has_next().await.unwrap());
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_seek_to_next_event() {
        let stream = stream_with(&[&[1, 2, 3]]).await;
        let mut reader = stream.new_reader();

        assert!(reader.seek_to_next_event(1).await.unwrap());
        assert_eq!(reader.next().await.unwrap().unwrap().position, 2);

        // Negative input goes to the first entry.
        assert!(reader.seek_to_next_event(-1).await.unwrap());
        assert_eq!(reader.next().await.unwrap().unwrap().position, 1);
    }

    #[tokio::test]
    async fn test_seek_to_end_then_follow() {
        let stream = stream_with(&[&[1, 2]]).await;
        let mut reader = stream.new_reader();

        assert_eq!(reader.seek_to_end().await.unwrap(), 2);
        assert!(!reader.has_next().await.unwrap());

        // New appends become visible to the same reader.
        let writer = stream.new_writer();
        writer
            .append(vec![AppendItem::new(Bytes::new(), Bytes::from_static(b"x"))])
            .await
            .unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap().position, 3);
    }

    #[tokio::test]
    async fn test_empty_log() {
        let stream = stream_with(&[]).await;
        let mut reader = stream.new_reader();

        assert!(!reader.seek_to_first_event().await.unwrap());
        assert_eq!(reader.seek_to_end().await.unwrap(), 0);
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_peek_does_not_advance() {
        let stream = stream_with(&[&[1, 2]]).await;
        let mut reader = stream.new_reader();

        assert_eq!(reader.peek_next().await.unwrap().unwrap().position, 1);
        assert_eq!(reader.peek_next().await.unwrap().unwrap().position, 1);
        assert_eq!(reader.next().await.unwrap().unwrap().position, 1);
    }

    #[tokio::test]
    async fn test_closed_reader() {
        let stream = stream_with(&[&[1]]).await;
        let mut reader = stream.new_reader();
        stream.close().await;

        assert!(reader.next().await.is_err());
    }
}
