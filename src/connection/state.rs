//! Connection lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one connection generation.
///
/// States are strictly ordered; a generation only ever moves forward.
/// `Disconnected` is terminal, reconnecting takes a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, `connect` not yet called.
    New = 0,
    /// Connecting to the relay server.
    Connecting = 1,
    /// Authenticated with the relay server.
    ServerHandshakeComplete = 2,
    /// Authenticated with the peer.
    PeerHandshakeComplete = 3,
    /// Local resumption info transmitted.
    ResumeInfoSent = 4,
    /// Peer resumption info received.
    ResumeInfoReceived = 5,
    /// Application messages may flow.
    Ready = 6,
    /// Disconnect notice sent, waiting to tear down.
    Disconnecting = 7,
    /// Torn down.
    Disconnected = 8,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Connecting,
            2 => Self::ServerHandshakeComplete,
            3 => Self::PeerHandshakeComplete,
            4 => Self::ResumeInfoSent,
            5 => Self::ResumeInfoReceived,
            6 => Self::Ready,
            7 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }

    /// Whether teardown has started.
    pub fn is_closing(self) -> bool {
        self >= Self::Disconnecting
    }

    /// Whether the peer handshake has completed and teardown has not begun.
    pub fn is_peer_authenticated(self) -> bool {
        (Self::PeerHandshakeComplete..=Self::Ready).contains(&self)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::ServerHandshakeComplete => "server-handshake-complete",
            Self::PeerHandshakeComplete => "peer-handshake-complete",
            Self::ResumeInfoSent => "resume-info-sent",
            Self::ResumeInfoReceived => "resume-info-received",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Atomically updated [`ConnectionState`].
///
/// Every write is a forward-only compare-and-swap, so concurrent readers
/// always see a state at least as advanced as any they saw before.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell in `New`.
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::New as u8))
    }

    /// Current state.
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if that is strictly ahead of the current state.
    ///
    /// Returns the previous state on success, the current one otherwise.
    pub fn advance(&self, to: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < to as u8).then_some(to as u8)
            })
            .map(ConnectionState::from_u8)
            .map_err(ConnectionState::from_u8)
    }

    /// Move from exactly `from` to `to` (which must be ahead of `from`).
    pub fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), ConnectionState> {
        if to <= from {
            return Err(self.load());
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
