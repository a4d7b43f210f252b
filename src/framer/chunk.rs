//! Chunk wire format and the chunker.
//!
//! ```text
//! +---------+-----------------+-------------+----------------+
//! | Options | Message Id (8B) | Serial (4B) | Data (var)     |
//! +---------+-----------------+-------------+----------------+
//! ```
//!
//! Bit 0 of the options byte marks the last chunk of a message. Every
//! chunk handed to the secure channel additionally carries a 4-byte
//! big-endian length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{
    CHUNK_END_OF_MESSAGE, CHUNK_HEADER_SIZE, CHUNK_LENGTH_PREFIX_SIZE, FramerError, WireError,
};

/// A single parsed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    end_of_message: bool,
    id: u64,
    serial: u32,
    data: Bytes,
}

impl Chunk {
    /// Create a chunk.
    pub fn new(end_of_message: bool, id: u64, serial: u32, data: Bytes) -> Self {
        Self {
            end_of_message,
            id,
            serial,
            data,
        }
    }

    /// Parse a chunk from raw bytes (without length prefix).
    pub fn parse(mut bytes: Bytes) -> Result<Self, FramerError> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(FramerError::ChunkTooSmall(bytes.len()));
        }

        let options = bytes.get_u8();
        let id = bytes.get_u64();
        let serial = bytes.get_u32();

        Ok(Self {
            end_of_message: options & CHUNK_END_OF_MESSAGE != 0,
            id,
            serial,
            data: bytes,
        })
    }

    /// Serialize header and data.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + self.data.len());
        buf.put_u8(if self.end_of_message { CHUNK_END_OF_MESSAGE } else { 0 });
        buf.put_u64(self.id);
        buf.put_u32(self.serial);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Whether this is the last chunk of its message.
    pub fn is_end_of_message(&self) -> bool {
        self.end_of_message
    }

    /// Message id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Position of this chunk within its message.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Chunk payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Splits one message into serialized chunks.
///
/// Each yielded chunk is at most `chunk_size` bytes including the header.
/// An empty message still yields one end-of-message chunk.
#[derive(Debug)]
pub struct Chunker {
    id: u64,
    data: Bytes,
    chunk_data_size: usize,
    serial: u32,
    done: bool,
}

impl Chunker {
    /// Create a chunker for message `id`.
    pub fn new(id: u64, data: Bytes, chunk_size: usize) -> Result<Self, FramerError> {
        if chunk_size <= CHUNK_HEADER_SIZE {
            return Err(FramerError::ChunkSizeTooSmall(chunk_size));
        }
        Ok(Self {
            id,
            data,
            chunk_data_size: chunk_size - CHUNK_HEADER_SIZE,
            serial: 0,
            done: false,
        })
    }

    /// Number of chunks this chunker yields in total.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(self.chunk_data_size).max(1)
    }
}

impl Iterator for Chunker {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }

        let take = self.data.len().min(self.chunk_data_size);
        let data = self.data.split_to(take);
        let end_of_message = self.data.is_empty();
        let chunk = Chunk::new(end_of_message, self.id, self.serial, data);

        self.done = end_of_message;
        self.serial = self.serial.wrapping_add(1);
        Some(chunk.serialize())
    }
}

/// Prefix a serialized chunk with its big-endian length.
pub fn length_prefixed(chunk: &[u8]) -> Result<Bytes, WireError> {
    let declared = u32::try_from(chunk.len()).map_err(|_| WireError::BadLengthPrefix {
        declared: chunk.len(),
        available: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(CHUNK_LENGTH_PREFIX_SIZE + chunk.len());
    buf.put_u32(declared);
    buf.put_slice(chunk);
    Ok(buf.freeze())
}

/// Strip and check the length prefix of an inbound chunk.
pub fn strip_length_prefix(mut frame: Bytes) -> Result<Bytes, WireError> {
    if frame.len() < CHUNK_LENGTH_PREFIX_SIZE {
        return Err(WireError::BadLengthPrefix {
            declared: CHUNK_LENGTH_PREFIX_SIZE,
            available: frame.len(),
        });
    }
    let declared = frame.get_u32() as usize;
    if declared != frame.len() {
        return Err(WireError::BadLengthPrefix {
            declared,
            available: frame.len(),
        });
    }
    Ok(frame)
}
