//! Protocol constants.
//!
//! These values are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Noise handshake hash size (BLAKE2s).
pub const HASH_SIZE: usize = 32;

/// Symmetric key size for XChaCha20-Poly1305.
pub const SESSION_KEY_SIZE: usize = 32;

/// Noise pattern used for both the relay and the peer handshake.
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// HKDF info label for link (relay) keys.
pub const LINK_KEYS_LABEL: &[u8] = b"relaypair v1 link keys";

/// HKDF info label for peer session keys.
pub const PEER_KEYS_LABEL: &[u8] = b"relaypair v1 peer keys";

/// Fixed nonce used to derive the connection identifier.
///
/// Encrypting an empty plaintext under this nonce with the peer session
/// keys yields an identifier bound to the current handshake.
pub const CONNECTION_ID_NONCE: &[u8; AEAD_NONCE_SIZE] = b"connectionidconnectionid";

/// Nonce direction: initiator -> responder.
pub const NONCE_DIR_INITIATOR: u8 = 0x00;

/// Nonce direction: responder -> initiator.
pub const NONCE_DIR_RESPONDER: u8 = 0x01;

// =============================================================================
// FRAMING
// =============================================================================

/// Chunk header: options (1) + message id (8, BE) + serial (4, BE).
pub const CHUNK_HEADER_SIZE: usize = 1 + 8 + 4;

/// End-of-message bit in the chunk options byte.
pub const CHUNK_END_OF_MESSAGE: u8 = 0x01;

/// Default upper bound for a single chunk, header included.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Size of the big-endian length prefix in front of every chunk.
pub const CHUNK_LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame accepted on the relay link.
pub const MAX_LINK_FRAME_SIZE: usize = 2 * DEFAULT_CHUNK_SIZE;

// =============================================================================
// TIMING
// =============================================================================

/// How long to wait for the peer after the relay reports it absent.
pub const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between sending a disconnect notice and tearing the channel down.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Keepalive interval on the relay link.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Incomplete inbound messages older than this are dropped on carry-over.
pub const UNCHUNKER_MAX_AGE: Duration = Duration::from_secs(60);

// =============================================================================
// CLOSE CODES
// =============================================================================

/// Normal closure (WebSocket semantics, forwarded to the relay).
pub const CLOSE_CODE_NORMAL: u16 = 1000;

/// Protocol error.
pub const CLOSE_CODE_PROTOCOL_ERROR: u16 = 3001;

// =============================================================================
// BOOKKEEPING
// =============================================================================

/// Default capacity of each request-marker set.
pub const DEFAULT_REQUEST_MARKER_CAPACITY: usize = 256;

/// Capacity of the per-session state change broadcast.
pub const STATE_EVENT_CAPACITY: usize = 64;
