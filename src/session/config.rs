//! Session configuration.

use std::time::Duration;

use crate::core::{
    CHUNK_HEADER_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_PING_INTERVAL, DEFAULT_REQUEST_MARKER_CAPACITY,
    DISCONNECT_GRACE, MAX_LINK_FRAME_SIZE, PEER_WAIT_TIMEOUT, SessionError, UNCHUNKER_MAX_AGE,
};
use crate::crypto::PublicKey;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Peer's permanent public key.
    pub peer_public_key: Option<PublicKey>,

    /// Relay server's permanent public key.
    pub server_public_key: Option<PublicKey>,

    /// How long to wait for the peer after the server handshake.
    pub peer_wait_timeout: Duration,

    /// Delay between a disconnect notice and the channel teardown.
    pub disconnect_grace: Duration,

    /// Maximum chunk size including the chunk header.
    pub max_chunk_size: usize,

    /// Keepalive interval on the relay link.
    pub ping_interval: Duration,

    /// Partial inbound messages older than this are dropped on reconnect.
    pub unchunker_max_age: Duration,

    /// Capacity of each request marker set.
    pub request_marker_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_public_key: None,
            server_public_key: None,
            peer_wait_timeout: PEER_WAIT_TIMEOUT,
            disconnect_grace: DISCONNECT_GRACE,
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            ping_interval: DEFAULT_PING_INTERVAL,
            unchunker_max_age: UNCHUNKER_MAX_AGE,
            request_marker_capacity: DEFAULT_REQUEST_MARKER_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Start building a configuration.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Check that the configuration can be used to connect.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.peer_public_key.is_none() {
            return Err(SessionError::Config("peer public key missing".into()));
        }
        if self.server_public_key.is_none() {
            return Err(SessionError::Config("server public key missing".into()));
        }
        // Chunks are length-prefixed and sealed before they hit the link
        if self.max_chunk_size <= CHUNK_HEADER_SIZE || self.max_chunk_size > MAX_LINK_FRAME_SIZE / 2
        {
            return Err(SessionError::Config(format!(
                "chunk size {} out of range",
                self.max_chunk_size
            )));
        }
        if self.ping_interval.is_zero() {
            return Err(SessionError::Config("ping interval must be positive".into()));
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the peer's public key.
    pub fn peer_public_key(mut self, key: PublicKey) -> Self {
        self.config.peer_public_key = Some(key);
        self
    }

    /// Set the relay server's public key.
    pub fn server_public_key(mut self, key: PublicKey) -> Self {
        self.config.server_public_key = Some(key);
        self
    }

    /// Set the peer wait timeout.
    pub fn peer_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.peer_wait_timeout = timeout;
        self
    }

    /// Set the disconnect grace delay.
    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace = grace;
        self
    }

    /// Set the maximum chunk size.
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.config.max_chunk_size = size;
        self
    }

    /// Set the keepalive interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Set the maximum age of carried-over partial messages.
    pub fn unchunker_max_age(mut self, age: Duration) -> Self {
        self.config.unchunker_max_age = age;
        self
    }

    /// Set the request marker capacity.
    pub fn request_marker_capacity(mut self, capacity: usize) -> Self {
        self.config.request_marker_capacity = capacity;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> SessionConfig {
        self.config
    }
}
