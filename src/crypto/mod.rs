//! Security layer
//!
//! - Noise_IK handshake via `snow`
//! - XChaCha20-Poly1305 encrypt/decrypt
//! - Directional nonce construction
//! - Key types with `Zeroize`
//! - HKDF key schedule and sequential frame protection

mod aead;
mod keys;
mod noise;
mod nonce;
mod session;

pub use aead::{SessionKey, decrypt, encrypt};
pub use keys::{Keypair, PublicKey, SessionId};
pub use noise::{HandshakeResult, InitiatorHandshake, ResponderHandshake};
pub use nonce::{Direction, construct_nonce};
pub use session::{FrameCipher, Role, SessionCipher, SessionKeySlot, SessionKeys};
