//! X25519 key management
//!
//! Provides key generation, restoration from persisted private keys, and
//! the session identifier derived from a peer's permanent public key.

use std::fmt;

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{CryptoError, HASH_SIZE, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

/// A permanent X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// A static X25519 keypair for the local identity of a pairing.
///
/// The private key is zeroized on drop.
#[derive(Clone)]
pub struct Keypair {
    /// Private key (32 bytes) - zeroized on drop
    private: [u8; PRIVATE_KEY_SIZE],
    /// Public key (32 bytes)
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(&secret)
    }

    /// Restore a keypair from a persisted private key.
    pub fn restore(private: [u8; PRIVATE_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(private);
        Self::from_secret(&secret)
    }

    fn from_secret(secret: &StaticSecret) -> Self {
        let public = DalekPublicKey::from(secret);
        Self {
            private: secret.to_bytes(),
            public: PublicKey(*public.as_bytes()),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Get the private key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// Session ID - SHA-256 of the peer's permanent public key.
///
/// Identifies a pairing across process restarts and reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId([u8; HASH_SIZE]);

impl SessionId {
    /// Derive the session id for a peer.
    pub fn for_peer(peer: &PublicKey) -> Self {
        let digest = Sha256::digest(peer.as_bytes());
        let mut id = [0u8; HASH_SIZE];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
