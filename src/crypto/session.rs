//! Post-handshake key schedule and frame protection
//!
//! After a Noise_IK handshake both parties expand the handshake hash into
//! directional keys with HKDF-SHA256:
//!
//! ```text
//! (initiator_key, responder_key, connection_id_key) = HKDF-Expand(
//!     handshake_hash,
//!     label,
//!     96
//! )
//! ```
//!
//! [`FrameCipher`] then protects every frame with strictly sequential
//! counters, and [`SessionKeySlot`] exposes the peer session key to the
//! connection layer for deriving connection ids.

use std::sync::OnceLock;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::core::{AEAD_NONCE_SIZE, CryptoError, HASH_SIZE, SESSION_KEY_SIZE};

use super::{
    aead::{decrypt, encrypt, SessionKey},
    nonce::{construct_nonce, Direction},
    HandshakeResult,
};

/// Size of the counter prefix on every protected frame.
const COUNTER_SIZE: usize = 8;

/// Role in the handshake (affects which key is used for send/receive)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiator (the app)
    Initiator,
    /// Responder (relay server or peer)
    Responder,
}

impl Role {
    /// Direction of frames sent by this role.
    pub fn send_direction(self) -> Direction {
        match self {
            Role::Initiator => Direction::InitiatorToResponder,
            Role::Responder => Direction::ResponderToInitiator,
        }
    }
}

/// Session keys derived from a completed handshake.
pub struct SessionKeys {
    /// Key for initiator → responder frames
    pub initiator_key: SessionKey,
    /// Key for responder → initiator frames
    pub responder_key: SessionKey,
    /// Key reserved for deriving connection ids
    pub connection_id_key: SessionKey,
    /// The handshake hash
    pub handshake_hash: [u8; HASH_SIZE],
}

impl SessionKeys {
    /// Derive session keys from the handshake result.
    ///
    /// `label` separates the relay link from the peer channel so the two
    /// hops never share key material.
    pub fn derive(result: &HandshakeResult, label: &[u8]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::from_prk(&result.handshake_hash)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        let mut key_material = [0u8; 3 * SESSION_KEY_SIZE];
        hk.expand(label, &mut key_material)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut initiator_key = [0u8; SESSION_KEY_SIZE];
        let mut responder_key = [0u8; SESSION_KEY_SIZE];
        let mut connection_id_key = [0u8; SESSION_KEY_SIZE];
        initiator_key.copy_from_slice(&key_material[..SESSION_KEY_SIZE]);
        responder_key.copy_from_slice(&key_material[SESSION_KEY_SIZE..2 * SESSION_KEY_SIZE]);
        connection_id_key.copy_from_slice(&key_material[2 * SESSION_KEY_SIZE..]);

        key_material.zeroize();

        Ok(Self {
            initiator_key: SessionKey::from_bytes(initiator_key),
            responder_key: SessionKey::from_bytes(responder_key),
            connection_id_key: SessionKey::from_bytes(connection_id_key),
            handshake_hash: result.handshake_hash,
        })
    }

    /// Get the send key for the given role.
    pub fn send_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.initiator_key,
            Role::Responder => &self.responder_key,
        }
    }

    /// Get the receive key for the given role.
    pub fn recv_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.responder_key,
            Role::Responder => &self.initiator_key,
        }
    }
}

/// Sequential-counter AEAD for one hop of the channel.
///
/// Frames are `counter (8, LE) || ciphertext`. The counter doubles as AAD
/// and must arrive exactly in order; the underlying transport is ordered,
/// so a gap means tampering.
pub struct FrameCipher {
    role: Role,
    send_key: SessionKey,
    recv_key: SessionKey,
    send_counter: u64,
    recv_counter: u64,
}

impl FrameCipher {
    /// Create a cipher for `role` from derived keys.
    pub fn new(keys: &SessionKeys, role: Role) -> Self {
        Self {
            role,
            send_key: keys.send_key(role).clone(),
            recv_key: keys.recv_key(role).clone(),
            send_counter: 0,
            recv_counter: 0,
        }
    }

    /// Protect an outgoing frame.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.send_counter;
        self.send_counter = counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhaustion)?;

        let aad = counter.to_le_bytes();
        let nonce = construct_nonce(self.role.send_direction(), counter);
        let ciphertext = encrypt(&self.send_key, &nonce, &aad, plaintext)?;

        let mut frame = Vec::with_capacity(COUNTER_SIZE + ciphertext.len());
        frame.extend_from_slice(&aad);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Verify and decrypt an incoming frame.
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < COUNTER_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (aad, ciphertext) = frame.split_at(COUNTER_SIZE);
        let mut counter_bytes = [0u8; COUNTER_SIZE];
        counter_bytes.copy_from_slice(aad);
        let counter = u64::from_le_bytes(counter_bytes);

        if counter != self.recv_counter {
            return Err(CryptoError::OutOfOrder {
                expected: self.recv_counter,
                actual: counter,
            });
        }

        let nonce = construct_nonce(self.role.send_direction().opposite(), counter);
        let plaintext = decrypt(&self.recv_key, &nonce, aad, ciphertext)?;

        self.recv_counter = counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhaustion)?;
        Ok(plaintext)
    }
}

/// Access to the peer session key for one-off encryptions.
pub trait SessionCipher: Send + Sync {
    /// Encrypt `plaintext` under the session key with a caller-chosen nonce.
    ///
    /// Fails with [`CryptoError::NotKeyed`] before the peer handshake.
    fn encrypt_with_session_keys(
        &self,
        plaintext: &[u8],
        nonce: &[u8; AEAD_NONCE_SIZE],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Write-once holder for the peer session keys.
#[derive(Default)]
pub struct SessionKeySlot {
    keys: OnceLock<SessionKeys>,
}

impl SessionKeySlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install keys. Returns false if keys were already installed.
    pub fn install(&self, keys: SessionKeys) -> bool {
        self.keys.set(keys).is_ok()
    }

    /// Whether keys have been installed.
    pub fn is_keyed(&self) -> bool {
        self.keys.get().is_some()
    }
}

impl SessionCipher for SessionKeySlot {
    fn encrypt_with_session_keys(
        &self,
        plaintext: &[u8],
        nonce: &[u8; AEAD_NONCE_SIZE],
    ) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys.get().ok_or(CryptoError::NotKeyed)?;
        encrypt(&keys.connection_id_key, nonce, &[], plaintext)
    }
}
