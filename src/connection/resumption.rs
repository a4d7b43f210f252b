//! Resumption records, close reasons and the wire envelope.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{CLOSE_CODE_NORMAL, CLOSE_CODE_PROTOCOL_ERROR, WireError};

/// Record exchanged once per peer handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumptionInfo {
    /// Identifier of the sender's current connection.
    pub current_id: Bytes,
    /// Identifier of the sender's previous connection, if it wants to resume.
    pub previous_id: Option<Bytes>,
    /// Number of chunks the sender received on its previous connection.
    pub previous_sequence: Option<u64>,
}

impl ResumptionInfo {
    /// Whether the sender asks to continue a previous connection.
    pub fn wants_resume(&self) -> bool {
        self.previous_id.is_some() && self.previous_sequence.is_some()
    }
}

/// Why a connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Stopped by the user or because the peer went away.
    Stop,
    /// The pairing is deleted.
    Delete,
    /// The feature was disabled.
    Disable,
    /// Superseded by a new connection of the same session.
    Replace,
    /// Protocol or crypto failure.
    Error,
    /// Temporarily suspended.
    Pause,
}

impl CloseReason {
    /// Whether closing for this reason ends the session's active lifetime.
    pub fn is_terminal(self) -> bool {
        !matches!(self, CloseReason::Replace | CloseReason::Pause)
    }

    /// Close code forwarded to the relay.
    pub fn close_code(self) -> u16 {
        match self {
            CloseReason::Error => CLOSE_CODE_PROTOCOL_ERROR,
            _ => CLOSE_CODE_NORMAL,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Stop => "stop",
            CloseReason::Delete => "delete",
            CloseReason::Disable => "disable",
            CloseReason::Replace => "replace",
            CloseReason::Error => "error",
            CloseReason::Pause => "pause",
        };
        f.write_str(name)
    }
}

/// Options for [`Connection::close`](super::Connection::close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOptions {
    /// Drop the connection context so a later connect starts clean.
    pub close_underlying: bool,
    /// Delete the persisted session key.
    pub forget: bool,
    /// Send a disconnect notice before tearing down.
    pub send_disconnect_notice: bool,
    /// Reason reported to the peer and the logs.
    pub reason: CloseReason,
}

impl CloseOptions {
    /// Close for `reason`, dropping the context, without a notice.
    pub fn new(reason: CloseReason) -> Self {
        Self {
            close_underlying: true,
            forget: false,
            send_disconnect_notice: false,
            reason,
        }
    }

    /// Silent replacement by a new connection; the context survives.
    pub fn replace() -> Self {
        Self::new(CloseReason::Replace).keep_context()
    }

    /// Send a disconnect notice first.
    pub fn with_notice(mut self) -> Self {
        self.send_disconnect_notice = true;
        self
    }

    /// Also delete the persisted session key.
    pub fn forget(mut self) -> Self {
        self.forget = true;
        self
    }

    /// Keep the connection context for a later resumption.
    pub fn keep_context(mut self) -> Self {
        self.close_underlying = false;
        self
    }
}

/// Envelope of everything sent over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Resumption info (control, privileged).
    ConnectionInfo(ResumptionInfo),
    /// Disconnect notice (control, privileged).
    Disconnect {
        /// Why the sender disconnects.
        reason: CloseReason,
    },
    /// Opaque application payload.
    Application {
        /// Payload bytes.
        payload: Bytes,
    },
}

impl WireMessage {
    /// Encode as MessagePack with field names.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    /// Decode from MessagePack.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Bookkeeping for the two independent halves of the exchange.
///
/// Both halves can complete in either order; whichever finishes second
/// hands back the peer's record so the caller can complete resumption.
#[derive(Debug, Default)]
pub struct ResumptionExchange {
    local_sent: bool,
    remote: Option<ResumptionInfo>,
    completed: bool,
}

impl ResumptionExchange {
    /// Record that the local info went out.
    pub fn local_sent(&mut self) -> Option<ResumptionInfo> {
        self.local_sent = true;
        self.take_ready()
    }

    /// Record the peer's info.
    pub fn remote_received(&mut self, info: ResumptionInfo) -> Option<ResumptionInfo> {
        if self.completed || self.remote.is_some() {
            tracing::warn!("ignoring repeated resumption info");
            return None;
        }
        self.remote = Some(info);
        self.take_ready()
    }

    /// Whether resumption has been completed.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn take_ready(&mut self) -> Option<ResumptionInfo> {
        if !self.local_sent || self.completed {
            return None;
        }
        let remote = self.remote.take()?;
        self.completed = true;
        Some(remote)
    }
}
