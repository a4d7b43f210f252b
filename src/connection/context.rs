//! Per-generation connection bookkeeping.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::core::{CacheError, FramerError};
use crate::framer::{Chunker, Unchunker};

use super::ResumptionInfo;

/// Outgoing chunks kept to answer a resumption request.
///
/// Slots for non-cacheable messages hold `None` so that positions keep
/// matching the peer's chunk count.
#[derive(Debug, Clone, Default)]
pub struct ChunkCache {
    offset: u64,
    slots: VecDeque<Option<Bytes>>,
}

impl ChunkCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the first slot still held.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of chunks ever appended.
    pub fn sequence_number(&self) -> u64 {
        self.offset + self.slots.len() as u64
    }

    /// Number of slots held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is held.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append a chunk, or a placeholder for a non-cacheable one.
    pub fn append(&mut self, chunk: Option<Bytes>) {
        self.slots.push_back(chunk);
    }

    /// Iterate over the held slots, oldest first.
    pub fn slots(&self) -> impl Iterator<Item = Option<&Bytes>> {
        self.slots.iter().map(Option::as_ref)
    }

    /// Drop every slot the peer acknowledged having received.
    pub fn prune(&mut self, acknowledged: u64) -> Result<(), CacheError> {
        if acknowledged < self.offset {
            return Err(CacheError::BehindOffset {
                acknowledged,
                offset: self.offset,
            });
        }
        let sent = self.sequence_number();
        if acknowledged > sent {
            return Err(CacheError::AheadOfSent { acknowledged, sent });
        }

        let count = (acknowledged - self.offset) as usize;
        self.slots.drain(..count);
        self.offset = acknowledged;
        Ok(())
    }

    /// Cached chunks still awaiting acknowledgement, oldest first.
    pub fn transfer(&self) -> Vec<Bytes> {
        self.slots.iter().flatten().cloned().collect()
    }
}

/// How a resumption request was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing to resume.
    Fresh,
    /// The previous generation continues; these chunks must be resent.
    Resumed {
        /// Chunks not acknowledged by the peer.
        resend: Vec<Bytes>,
    },
    /// The peer did not resume our previous generation; it was dropped.
    Discarded,
}

/// Bookkeeping of one connection generation.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    connection_id: Bytes,
    outgoing_counter: u64,
    incoming_sequence: u64,
    chunk_cache: ChunkCache,
    unchunker: Unchunker,
    previous: Option<Box<ConnectionContext>>,
}

impl ConnectionContext {
    /// Create a fresh context for `connection_id`.
    pub fn new(connection_id: Bytes) -> Self {
        Self {
            connection_id,
            outgoing_counter: 0,
            incoming_sequence: 0,
            chunk_cache: ChunkCache::new(),
            unchunker: Unchunker::new(),
            previous: None,
        }
    }

    /// Link the immediately preceding generation.
    ///
    /// Continues its outgoing counter and takes over its reassembly
    /// buffer, dropping partial messages older than `max_age`. Anything
    /// older than `previous` itself is discarded.
    pub fn inherit(&mut self, mut previous: ConnectionContext, max_age: Duration) {
        self.outgoing_counter = previous.outgoing_counter;
        self.unchunker = std::mem::take(&mut previous.unchunker);
        let dropped = self.unchunker.gc(max_age);
        if dropped > 0 {
            tracing::debug!(dropped, "dropped stale partial messages");
        }
        previous.previous = None;
        self.previous = Some(Box::new(previous));
    }

    /// Connection identifier.
    pub fn connection_id(&self) -> &Bytes {
        &self.connection_id
    }

    /// Id of the next outgoing message.
    pub fn outgoing_counter(&self) -> u64 {
        self.outgoing_counter
    }

    /// Number of inbound chunks accepted.
    pub fn incoming_sequence(&self) -> u64 {
        self.incoming_sequence
    }

    /// Resumption chunk cache.
    pub fn chunk_cache(&self) -> &ChunkCache {
        &self.chunk_cache
    }

    /// The preceding generation, if linked.
    pub fn previous(&self) -> Option<&ConnectionContext> {
        self.previous.as_deref()
    }

    /// The local resumption record for this generation.
    pub fn resumption_info(&self) -> ResumptionInfo {
        ResumptionInfo {
            current_id: self.connection_id.clone(),
            previous_id: self.previous.as_ref().map(|p| p.connection_id.clone()),
            previous_sequence: self.previous.as_ref().map(|p| p.incoming_sequence),
        }
    }

    /// Chunk an outgoing message and record it.
    ///
    /// Chunks are cached here, before they are handed to the channel.
    pub fn chunk_message(
        &mut self,
        data: Bytes,
        chunk_size: usize,
        cacheable: bool,
    ) -> Result<Vec<Bytes>, FramerError> {
        let chunks: Vec<Bytes> = Chunker::new(self.outgoing_counter, data, chunk_size)?.collect();
        for chunk in &chunks {
            self.chunk_cache.append(cacheable.then(|| chunk.clone()));
        }
        self.outgoing_counter += 1;
        Ok(chunks)
    }

    /// Feed an inbound chunk to the reassembly buffer.
    pub fn add_incoming(&mut self, chunk: Bytes) -> Result<Option<Bytes>, FramerError> {
        let message = self.unchunker.add_chunk(chunk)?;
        self.incoming_sequence += 1;
        Ok(message)
    }

    /// Answer the peer's resumption record and unlink the previous generation.
    pub fn resume(&mut self, remote: &ResumptionInfo) -> Result<ResumeOutcome, CacheError> {
        let Some(mut previous) = self.previous.take() else {
            return Ok(ResumeOutcome::Fresh);
        };

        match (&remote.previous_id, remote.previous_sequence) {
            (Some(id), Some(acknowledged)) if *id == previous.connection_id => {
                previous.chunk_cache.prune(acknowledged)?;
                let resend = previous.chunk_cache.transfer();
                for chunk in &resend {
                    self.chunk_cache.append(Some(chunk.clone()));
                }
                Ok(ResumeOutcome::Resumed { resend })
            }
            _ => {
                self.unchunker = Unchunker::new();
                Ok(ResumeOutcome::Discarded)
            }
        }
    }
}
