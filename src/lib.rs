//! # relaypair
//!
//! Resumable, end-to-end encrypted message channel between an app and a
//! paired peer over an untrusted relay.
//!
//! - **Security**: Noise_IK handshakes with the relay and with the peer;
//!   the relay only ever forwards sealed peer data
//! - **Framing**: arbitrary-length messages are chunked into bounded
//!   frames and reassembled in order
//! - **Resumption**: a reconnecting generation continues the previous
//!   message sequence, resending only what the peer did not receive
//! - **Ordering**: outbound messages reach the channel in submission order
//!
//! ## Feature Flags
//!
//! - `relay` (default): TCP relay transport ([`transport::RelayedChannel`])
//!
//! ## Modules
//!
//! - [`core`]: Constants, error types and collaborator traits
//! - [`crypto`]: Keys, Noise handshakes, AEAD and session keys
//! - [`framer`]: Chunking and reassembly
//! - [`transport`]: Secure channel abstraction and relay transport
//! - [`connection`]: Connection generations, state machine and resumption
//! - [`session`]: Caller-facing session, outbound queue and registry
//!
//! ## Example Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use relaypair::prelude::*;
//!
//! let config = SessionConfig::builder()
//!     .peer_public_key(peer_key)
//!     .server_public_key(relay_key)
//!     .build();
//! let relay = RelayedChannel::new(TcpConnector::new(RelayConfig::new("relay.example:9000")));
//! let (session, mut inbound) = Session::new(
//!     config,
//!     Arc::new(relay),
//!     Arc::new(MemoryKeyStore::new()),
//!     ActiveSessions::new(),
//! )?;
//!
//! session.connect(None).await?;
//! session.send_message(Bytes::from_static(b"hello"), true).await?;
//! while let Some(payload) = inbound.recv().await {
//!     println!("{} bytes from peer", payload.len());
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
pub mod crypto;
pub mod framer;
pub mod transport;
pub mod connection;
pub mod session;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use bytes::Bytes;

    pub use crate::connection::{
        CloseOptions, CloseReason, Connection, ConnectionState, StateChange,
    };
    pub use crate::core::{ChannelError, KeyStore, MemoryKeyStore, SendError, SessionError};
    pub use crate::crypto::{Keypair, PublicKey, SessionId};
    pub use crate::session::{ActiveSessions, Completion, InboundMessages, Session, SessionConfig};
    pub use crate::transport::{ConnectRequest, SecureChannel};

    #[cfg(feature = "relay")]
    pub use crate::transport::{RelayConfig, RelayedChannel, TcpConnector};
}

pub use crate::connection::{CloseOptions, CloseReason, ConnectionState};
pub use crate::core::SessionError;
pub use crate::session::{Session, SessionConfig};
