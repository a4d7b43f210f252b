//! Noise_IK handshake
//!
//! Both hops of a pairing authenticate with Noise_IK: the app against the
//! relay server, and the app against the peer through the relay.
//!
//! ```text
//! Noise_IK(s, rs):
//!   <- s             (responder key known in advance)
//!   ...
//!   -> e, es, s, ss  (auth token or ClientHello)
//!   <- e, ee, se     (ServerHello or empty)
//! ```
//!
//! The handshake hash is then fed to [`SessionKeys::derive`](super::SessionKeys::derive).

use snow::params::NoiseParams;
use snow::{Builder, HandshakeState};

use crate::core::{CryptoError, HASH_SIZE, NOISE_PATTERN};

use super::{Keypair, PublicKey};

/// Largest Noise message, as fixed by the Noise framework.
const NOISE_MAX_MESSAGE: usize = 65535;

/// Outcome of a finished handshake.
pub struct HandshakeResult {
    /// Handshake hash `h`, the input to session key derivation.
    pub handshake_hash: [u8; HASH_SIZE],
}

fn noise_error(e: snow::Error) -> CryptoError {
    CryptoError::HandshakeFailed(e.to_string())
}

fn builder(local: &Keypair) -> Result<Builder<'_>, CryptoError> {
    let params: NoiseParams = NOISE_PATTERN.parse().map_err(noise_error)?;
    Ok(Builder::new(params).local_private_key(local.private_key()))
}

fn write(state: &mut HandshakeState, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut message = vec![0u8; NOISE_MAX_MESSAGE];
    let len = state.write_message(payload, &mut message).map_err(noise_error)?;
    message.truncate(len);
    Ok(message)
}

fn read(state: &mut HandshakeState, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut payload = vec![0u8; NOISE_MAX_MESSAGE];
    let len = state.read_message(message, &mut payload).map_err(noise_error)?;
    payload.truncate(len);
    Ok(payload)
}

fn finish(state: HandshakeState) -> Result<HandshakeResult, CryptoError> {
    let mut handshake_hash = [0u8; HASH_SIZE];
    handshake_hash.copy_from_slice(state.get_handshake_hash());

    // Fails if the pattern is not complete
    state.into_transport_mode().map_err(noise_error)?;
    Ok(HandshakeResult { handshake_hash })
}

/// Initiating side: the app, towards the relay or the peer.
pub struct InitiatorHandshake {
    state: HandshakeState,
}

impl InitiatorHandshake {
    /// Start a handshake towards the holder of `remote_public`.
    pub fn new(local_keypair: &Keypair, remote_public: &PublicKey) -> Result<Self, CryptoError> {
        let state = builder(local_keypair)?
            .remote_public_key(remote_public.as_bytes())
            .build_initiator()
            .map_err(noise_error)?;
        Ok(Self { state })
    }

    /// First message, `-> e, es, s, ss`, carrying `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        write(&mut self.state, payload)
    }

    /// Consume the response `<- e, ee, se`.
    ///
    /// Returns the responder's payload and the handshake result.
    pub fn read_message(mut self, message: &[u8]) -> Result<(Vec<u8>, HandshakeResult), CryptoError> {
        let payload = read(&mut self.state, message)?;
        Ok((payload, finish(self.state)?))
    }
}

/// Responding side: the relay server or the peer.
pub struct ResponderHandshake {
    state: HandshakeState,
}

impl ResponderHandshake {
    /// Wait for an initiator that knows `local_keypair`'s public key.
    pub fn new(local_keypair: &Keypair) -> Result<Self, CryptoError> {
        let state = builder(local_keypair)?
            .build_responder()
            .map_err(noise_error)?;
        Ok(Self { state })
    }

    /// Consume the initiator's first message.
    ///
    /// Returns its payload and the initiator's static public key.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(Vec<u8>, PublicKey), CryptoError> {
        let payload = read(&mut self.state, message)?;
        let initiator = self
            .state
            .get_remote_static()
            .ok_or_else(|| CryptoError::HandshakeFailed("initiator static key missing".into()))?;
        Ok((payload, PublicKey::from_slice(initiator)?))
    }

    /// Answer with `payload` and finish.
    pub fn write_message(mut self, payload: &[u8]) -> Result<(Vec<u8>, HandshakeResult), CryptoError> {
        let message = write(&mut self.state, payload)?;
        Ok((message, finish(self.state)?))
    }
}
