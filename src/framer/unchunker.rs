//! Reassembly of chunked messages.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::core::FramerError;

use super::Chunk;

/// Collects the chunks belonging to one message.
#[derive(Debug, Clone)]
pub struct ChunkCollector {
    message_length: Option<usize>,
    chunks: Vec<Chunk>,
    last_update: Instant,
}

impl ChunkCollector {
    fn new() -> Self {
        Self {
            message_length: None,
            chunks: Vec::new(),
            last_update: Instant::now(),
        }
    }

    /// Register a chunk for this message.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<(), FramerError> {
        if let Some(first) = self.chunks.first() {
            if first.id() != chunk.id() {
                return Err(FramerError::InconsistentMessageId {
                    expected: first.id(),
                    actual: chunk.id(),
                });
            }
        }

        if chunk.is_end_of_message() {
            self.message_length = Some(chunk.serial() as usize + 1);
        }
        self.chunks.push(chunk);
        self.last_update = Instant::now();
        Ok(())
    }

    /// Whether a chunk with `serial` is already held.
    pub fn contains(&self, serial: u32) -> bool {
        self.chunks.iter().any(|c| c.serial() == serial)
    }

    /// Whether every chunk of the message has arrived.
    pub fn is_complete(&self) -> bool {
        self.message_length == Some(self.chunks.len())
    }

    /// Number of chunks held.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether no chunk is held.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn is_older_than(&self, max_age: Duration) -> bool {
        self.last_update.elapsed() > max_age
    }

    /// Concatenate the chunks in serial order.
    pub fn merge(mut self) -> Result<Bytes, FramerError> {
        if !self.is_complete() {
            return Err(FramerError::MessageNotYetComplete);
        }

        self.chunks.sort_by_key(Chunk::serial);
        let capacity = self.chunks.iter().map(|c| c.data().len()).sum();
        let mut data = BytesMut::with_capacity(capacity);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk.data());
        }
        Ok(data.freeze())
    }
}

/// Merges chunks back into complete messages.
///
/// Assumes chunks of one message arrive on a single ordered stream but
/// tolerates interleaving of different messages and repeated chunks.
#[derive(Debug, Clone, Default)]
pub struct Unchunker {
    collectors: HashMap<u64, ChunkCollector>,
}

impl Unchunker {
    /// Create an empty unchunker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a serialized chunk.
    ///
    /// Returns the reassembled message once its last missing chunk arrives.
    pub fn add_chunk(&mut self, bytes: Bytes) -> Result<Option<Bytes>, FramerError> {
        let chunk = Chunk::parse(bytes)?;

        // Repeated chunks are ignored
        if self
            .collectors
            .get(&chunk.id())
            .is_some_and(|collector| collector.contains(chunk.serial()))
        {
            tracing::trace!(id = chunk.id(), serial = chunk.serial(), "ignoring repeated chunk");
            return Ok(None);
        }

        // Single-chunk message
        if chunk.is_end_of_message() && chunk.serial() == 0 {
            self.collectors.remove(&chunk.id());
            return Ok(Some(chunk.data().clone()));
        }

        let id = chunk.id();
        let collector = self.collectors.entry(id).or_insert_with(ChunkCollector::new);
        collector.add_chunk(chunk)?;

        if collector.is_complete() {
            if let Some(collector) = self.collectors.remove(&id) {
                return collector.merge().map(Some);
            }
        }
        Ok(None)
    }

    /// Drop incomplete messages not updated within `max_age`.
    ///
    /// Returns the number of chunks removed.
    pub fn gc(&mut self, max_age: Duration) -> usize {
        let mut removed = 0;
        self.collectors.retain(|_, collector| {
            if collector.is_older_than(max_age) {
                removed += collector.len();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of incomplete messages held.
    pub fn pending_messages(&self) -> usize {
        self.collectors.len()
    }
}
