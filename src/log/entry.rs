use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed frame header: position (8) + source_index (4) + metadata_len (4)
/// + value_len (4), little endian.
pub const FRAME_HEADER_LEN: usize = 20;

/// An entry fragment links back to the command in the same write batch
/// that caused it, or carries this sentinel.
pub const NO_SOURCE_INDEX: i32 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame header: {0} bytes available")]
    TruncatedHeader(usize),
    #[error("truncated frame body: need {need} bytes, {available} available")]
    TruncatedBody { need: usize, available: usize },
    #[error("invalid frame length fields")]
    InvalidLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub position: i64,
    pub source_index: i32,
    pub metadata: Bytes,
    pub value: Bytes,
}

impl LogEntry {
    pub fn new(position: i64, metadata: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            position,
            source_index: NO_SOURCE_INDEX,
            metadata: metadata.into(),
            value: value.into(),
        }
    }

    /// Total encoded length including the header, used for framing. A
    /// reader can skip to the next entry without decoding this one.
    pub fn fragment_length(&self) -> usize {
        FRAME_HEADER_LEN + self.metadata.len() + self.value.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.fragment_length());
        buf.put_i64_le(self.position);
        buf.put_i32_le(self.source_index);
        buf.put_u32_le(self.metadata.len() as u32);
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.metadata);
        buf.put_slice(&self.value);
    }

    /// Decodes one entry from the front of `buf`, advancing it past the
    /// fragment.
    pub fn decode(buf: &mut Bytes) -> Result<LogEntry, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TruncatedHeader(buf.len()));
        }

        let position = buf.get_i64_le();
        let source_index = buf.get_i32_le();
        let metadata_len = buf.get_u32_le() as usize;
        let value_len = buf.get_u32_le() as usize;

        let need = metadata_len
            .checked_add(value_len)
            .ok_or(FrameError::InvalidLength)?;
        if buf.len() < need {
            return Err(FrameError::TruncatedBody {
                need,
                available: buf.len(),
            });
        }

        let metadata = buf.split_to(metadata_len);
        let value = buf.split_to(value_len);

        Ok(LogEntry {
            position,
            source_index,
            metadata,
            value,
        })
    }

    /// Reads only the position field of the frame at the front of `buf`,
    /// without consuming anything.
    pub fn peek_position(buf: &[u8]) -> Result<i64, FrameError> {
        if buf.len() < 8 {
            return Err(FrameError::TruncatedHeader(buf.len()));
        }
        Ok(i64::from_le_bytes(buf[0..8].try_into().unwrap()))
    }
}

/// Decodes all entries of one block in storage order.
pub fn decode_block(mut data: Bytes) -> Result<Vec<LogEntry>, FrameError> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        entries.push(LogEntry::decode(&mut data)?);
    }
    Ok(entries)
}
