//! Secure channel to the peer.
//!
//! A [`SecureChannel`] turns a [`ConnectRequest`] into [`ChannelHandles`]:
//! a driver future plus message-passing handles. Initialisation problems
//! (bad keys and the like) fail `connect` synchronously; everything after
//! that surfaces on the event and message streams.

mod event;
mod frame;
mod handles;
#[cfg(feature = "relay")]
mod relayed;

use std::time::Duration;

use bytes::Bytes;

use crate::core::ChannelError;
use crate::crypto::{Keypair, PublicKey};

pub use event::{ChannelEvent, Incoming};
pub use frame::{ClientHello, RelayFrame, ServerHello};
pub use handles::{
    ChannelDriver, ChannelHandles, ChannelSender, Disconnector, DriverEndpoint, channel_pair,
};
#[cfg(feature = "relay")]
pub use relayed::{Connector, RelayConfig, RelayedChannel, TcpConnector};

/// Parameters of one channel generation.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Own permanent keypair.
    pub keypair: Keypair,
    /// Peer's permanent public key.
    pub peer_public_key: PublicKey,
    /// Relay server's permanent public key.
    pub server_public_key: PublicKey,
    /// One-time authentication token for the first pairing.
    pub auth_token: Option<Bytes>,
    /// Keepalive interval on the relay link.
    pub ping_interval: Duration,
}

/// Factory for secure-channel generations.
pub trait SecureChannel: Send + Sync + 'static {
    /// Initialise a channel. The returned driver must be polled to run it.
    fn connect(&self, request: ConnectRequest) -> Result<ChannelHandles, ChannelError>;
}
