//! Lifecycle events and inbound messages emitted by a secure channel.

use bytes::Bytes;

use crate::core::ChannelError;

/// Lifecycle event on the event stream.
///
/// Each event is read exactly once; the reader re-arms until
/// [`ChannelEvent::PeerDisconnected`] is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Connecting to the relay server.
    Connecting,
    /// Authenticated with the relay server.
    ServerHandshakeComplete {
        /// Whether the peer was already connected to the relay.
        peer_connected: bool,
    },
    /// Authenticated with the peer; session keys are available.
    PeerHandshakeComplete,
    /// The peer (or the relay link) went away. Terminal.
    PeerDisconnected,
}

impl ChannelEvent {
    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::PeerDisconnected)
    }
}

/// Item on the inbound message stream.
#[derive(Debug)]
pub enum Incoming {
    /// A decrypted, length-prefixed chunk from the peer.
    Data(Bytes),
    /// The relay closed the link with this close code.
    Closed {
        /// WebSocket-style close code.
        code: u16,
    },
    /// Receiving failed; the stream ends after this item.
    Failed(ChannelError),
}
