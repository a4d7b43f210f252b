//! Error types for relaypair.

use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Key material has the wrong length or is otherwise unusable.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Nonce counter exhausted - channel must terminate.
    #[error("nonce counter exhausted - channel must terminate")]
    CounterExhaustion,

    /// Frame counter did not match the expected next value.
    #[error("unexpected frame counter: expected {expected}, got {actual}")]
    OutOfOrder {
        /// Expected counter.
        expected: u64,
        /// Received counter.
        actual: u64,
    },

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// The peer handshake has not completed yet.
    #[error("session keys not established")]
    NotKeyed,
}

/// Errors raised by the chunker and unchunker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramerError {
    /// Chunk is smaller than the header length.
    #[error("chunk too small: {0} bytes")]
    ChunkTooSmall(usize),

    /// A chunk collector can only collect chunks belonging to the same message.
    #[error("inconsistent message id: collector holds {expected}, chunk has {actual}")]
    InconsistentMessageId {
        /// Id held by the collector.
        expected: u64,
        /// Id of the offending chunk.
        actual: u64,
    },

    /// Configured chunk size leaves no room for data.
    #[error("chunk size {0} leaves no room for data")]
    ChunkSizeTooSmall(usize),

    /// Not all chunks of a message have arrived yet.
    #[error("message not yet complete")]
    MessageNotYetComplete,
}

/// Errors encoding or decoding wire envelopes.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack encoding failed.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Length prefix does not match the payload.
    #[error("bad length prefix: declared {declared}, available {available}")]
    BadLengthPrefix {
        /// Declared length.
        declared: usize,
        /// Bytes actually available.
        available: usize,
    },
}

/// Errors pruning the resumption chunk cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Peer acknowledged less than what was already pruned.
    #[error("peer travelled back in time: acknowledged {acknowledged}, cache starts at {offset}")]
    BehindOffset {
        /// Sequence number acknowledged by the peer.
        acknowledged: u64,
        /// First sequence number still held.
        offset: u64,
    },

    /// Peer acknowledged more than was ever sent.
    #[error("peer travelled forward in time: acknowledged {acknowledged}, sent {sent}")]
    AheadOfSent {
        /// Sequence number acknowledged by the peer.
        acknowledged: u64,
        /// Sequence number of the local cache.
        sent: u64,
    },
}

/// Errors on the secure channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Channel could not be initialised (bad keys, resources).
    #[error("channel initialisation failed: {0}")]
    Init(String),

    /// I/O error on the relay link.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Crypto failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire encoding failure on the link.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Relay or peer violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Channel has been closed.
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// Check if this error ends the channel.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::Wire(WireError::Decode(_)))
    }
}

/// Errors sending on a connection.
#[derive(Debug, Error)]
pub enum SendError {
    /// Non-control message attempted while the connection is not ready.
    #[error("connection not ready (state {0:?})")]
    NotReady(ConnectionState),

    /// No connection context exists yet.
    #[error("no connection context")]
    NoContext,

    /// Send primitive is gone.
    #[error("channel closed")]
    ChannelClosed,

    /// The owning session was dropped before the message could be sent.
    #[error("session closed")]
    SessionClosed,

    /// Envelope encoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Chunking failed.
    #[error("framer error: {0}")]
    Framer(#[from] FramerError),
}

/// Errors processing an inbound chunk.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Length prefix or envelope could not be decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Chunk stream is malformed.
    #[error("framer error: {0}")]
    Framer(#[from] FramerError),

    /// Peer's resumption request does not match the chunk cache.
    #[error("resumption failed: {0}")]
    Cache(#[from] CacheError),

    /// Resending cached chunks failed.
    #[error("resend failed: {0}")]
    Send(#[from] SendError),

    /// Chunk arrived before the connection context exists.
    #[error("no connection context")]
    NoContext,
}

/// Top-level relaypair errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Configuration error (missing keys and the like).
    #[error("configuration error: {0}")]
    Config(String),

    /// Secure channel handshake error.
    #[error("handshake error: {0}")]
    Handshake(#[from] ChannelError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Send error.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
