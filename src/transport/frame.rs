//! Relay link frames.
//!
//! The link to the relay carries length-delimited frames. The first two
//! are the Noise_IK server handshake messages, whose payloads are
//! [`ClientHello`] and [`ServerHello`]. Every later frame is a
//! MessagePack-encoded [`RelayFrame`] sealed with the link keys.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{ChannelError, WireError};
use crate::crypto::FrameCipher;

/// Payload of the first server handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Rendezvous path, the peer's permanent public key.
    pub path: Bytes,
}

/// Payload of the server handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Whether the peer is already connected on the same path.
    pub peer_connected: bool,
}

/// Frame exchanged with the relay after the server handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// The peer connected to the path.
    PeerJoined,
    /// The peer left the path.
    PeerLeft,
    /// Opaque bytes forwarded to or from the peer.
    Relay {
        /// Peer handshake message or sealed peer data.
        data: Bytes,
    },
    /// Keepalive.
    Ping,
    /// Close the link with a WebSocket-style code.
    Close {
        /// Close code.
        code: u16,
    },
}

impl RelayFrame {
    /// Encode and seal with the link cipher.
    pub fn seal(&self, cipher: &mut FrameCipher) -> Result<Bytes, ChannelError> {
        let plaintext = rmp_serde::to_vec(self).map_err(WireError::from)?;
        Ok(Bytes::from(cipher.seal(&plaintext)?))
    }

    /// Open with the link cipher and decode.
    pub fn open(cipher: &mut FrameCipher, frame: &[u8]) -> Result<Self, ChannelError> {
        let plaintext = cipher.open(frame)?;
        let frame = rmp_serde::from_slice(&plaintext).map_err(WireError::from)?;
        Ok(frame)
    }
}
