//! Cryptographic primitives for onionlink.
//!
//! The session cipher suite is fixed for wire compatibility:
//!
//! - **ECDH on NIST P-256**: ephemeral key agreement, one key pair per
//!   session (Perfect Forward Secrecy)
//! - **SHA-512**: key derivation, split into separate encryption and
//!   authentication subkeys
//! - **AES-256-CBC + HMAC-SHA256**: Encrypt-then-MAC authenticated
//!   encryption
//!
//! ## Security Properties
//!
//! - Perfect Forward Secrecy per session
//! - Message confidentiality and integrity
//! - Key zeroization on teardown
//!
//! The key exchange is opportunistic: it binds the session to a key
//! pair, not to a peer identity. An attacker controlling the transport
//! can man-in-the-middle the exchange. Callers needing identity binding
//! must layer it on top.

mod session;

pub use session::{CryptoSession, IV_SIZE, KEY_SIZE, MIN_ENCRYPTED_LEN, TAG_SIZE};

use rand::RngCore;

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}
