//! Ephemeral cryptographic session state.
//!
//! A [`CryptoSession`] lives exactly as long as one connection: a fresh
//! P-256 key pair at construction, subkeys derived once from the peer's
//! public key, and zeroization of everything on teardown.
//!
//! Encrypted payload layout (also the wire layout of message frames):
//!
//! ```text
//! IV (16) || AES-256-CBC ciphertext || HMAC-SHA256(IV || CT) (32)
//! ```
//!
//! The MAC is verified, in constant time, before the block cipher runs.

use crate::error::{Error, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::{EncodedPoint, PublicKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Size of the AES initialization vector in bytes.
pub const IV_SIZE: usize = 16;

/// Size of the HMAC-SHA256 authentication tag in bytes.
pub const TAG_SIZE: usize = 32;

/// Size of each derived subkey in bytes.
pub const KEY_SIZE: usize = 32;

/// Smallest well-formed encrypted payload: IV plus tag.
///
/// A payload of exactly this size still fails (CBC output is never
/// empty), but anything shorter cannot even be split into fields.
pub const MIN_ENCRYPTED_LEN: usize = IV_SIZE + TAG_SIZE;

/// Derived session subkeys. Zeroized when the session ends.
struct SessionKeys {
    aes_key: Zeroizing<[u8; KEY_SIZE]>,
    mac_key: Zeroizing<[u8; KEY_SIZE]>,
}

/// Per-connection cryptographic state.
///
/// The lifecycle is linear: [`new`](CryptoSession::new) →
/// [`derive`](CryptoSession::derive) (exactly once) → any number of
/// [`encrypt`](CryptoSession::encrypt) / [`decrypt`](CryptoSession::decrypt)
/// calls → [`wipe`](CryptoSession::wipe) or drop.
pub struct CryptoSession {
    ephemeral: Option<EphemeralSecret>,
    public_blob: Vec<u8>,
    keys: Option<SessionKeys>,
}

impl CryptoSession {
    /// Create a session with a fresh ephemeral P-256 key pair.
    pub fn new() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_blob = EncodedPoint::from(PublicKey::from(&secret))
            .as_bytes()
            .to_vec();
        Self {
            ephemeral: Some(secret),
            public_blob,
            keys: None,
        }
    }

    /// The local public key in SEC1 form, as sent to the peer.
    pub fn public_key_blob(&self) -> &[u8] {
        &self.public_blob
    }

    /// Whether key derivation has completed.
    pub fn is_initialized(&self) -> bool {
        self.keys.is_some()
    }

    /// Derive the session subkeys from the peer's public key blob.
    ///
    /// Computes the ECDH shared secret, hashes it with SHA-512, and
    /// splits the digest into the encryption key (first half) and the
    /// MAC key (second half). The ephemeral secret is dropped as soon
    /// as the agreement completes.
    ///
    /// Calling this twice, or after [`wipe`](CryptoSession::wipe), is a
    /// state violation.
    pub fn derive(&mut self, peer_public_blob: &[u8]) -> Result<()> {
        if self.keys.is_some() || self.ephemeral.is_none() {
            return Err(Error::KeyExchangeState);
        }

        // Validate the blob before consuming the ephemeral secret, so a
        // rejected key leaves the session able to retry.
        let peer_key = PublicKey::from_sec1_bytes(peer_public_blob)
            .map_err(|_| Error::BadPeerKey)?;
        let secret = self.ephemeral.take().ok_or(Error::KeyExchangeState)?;

        let shared = secret.diffie_hellman(&peer_key);
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&Sha512::digest(shared.raw_secret_bytes()));

        let mut aes_key = Zeroizing::new([0u8; KEY_SIZE]);
        let mut mac_key = Zeroizing::new([0u8; KEY_SIZE]);
        aes_key.copy_from_slice(&digest[..KEY_SIZE]);
        mac_key.copy_from_slice(&digest[KEY_SIZE..]);
        digest.zeroize();

        self.keys = Some(SessionKeys { aes_key, mac_key });
        Ok(())
    }

    /// Encrypt a UTF-8 message for the peer.
    ///
    /// Output is `IV || ciphertext || tag` with a fresh random IV per
    /// call.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let keys = self.keys.as_ref().ok_or(Error::NotInitialized)?;

        let iv: [u8; IV_SIZE] = super::random_bytes();

        let cipher = Aes256CbcEnc::new_from_slices(keys.aes_key.as_slice(), &iv)
            .map_err(|_| Error::Crypto("cipher init failed".into()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut mac = HmacSha256::new_from_slice(keys.mac_key.as_slice())
            .map_err(|_| Error::Crypto("mac init failed".into()))?;
        mac.update(&iv);
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len() + TAG_SIZE);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Decrypt an encrypted payload from the peer.
    ///
    /// The tag is recomputed over `IV || ciphertext` and compared in
    /// constant time; the block cipher only runs on an authentic
    /// payload.
    pub fn decrypt(&self, data: &[u8]) -> Result<String> {
        let keys = self.keys.as_ref().ok_or(Error::NotInitialized)?;

        if data.len() < MIN_ENCRYPTED_LEN {
            return Err(Error::MalformedCiphertext);
        }
        let tag_start = data.len() - TAG_SIZE;

        let mut mac = HmacSha256::new_from_slice(keys.mac_key.as_slice())
            .map_err(|_| Error::Crypto("mac init failed".into()))?;
        mac.update(&data[..tag_start]);
        mac.verify_slice(&data[tag_start..])
            .map_err(|_| Error::IntegrityFailed)?;

        let iv = &data[..IV_SIZE];
        let ciphertext = &data[IV_SIZE..tag_start];

        let cipher = Aes256CbcDec::new_from_slices(keys.aes_key.as_slice(), iv)
            .map_err(|_| Error::Crypto("cipher init failed".into()))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| Error::MalformedCiphertext)?,
        );

        String::from_utf8(plaintext.to_vec()).map_err(|_| Error::MalformedCiphertext)
    }

    /// Destroy all secret material.
    ///
    /// The derived subkeys and any remaining ephemeral secret are
    /// zeroized; the session is unusable afterwards. Dropping the
    /// session has the same effect.
    pub fn wipe(&mut self) {
        self.keys = None;
        self.ephemeral = None;
    }
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("public_key", &hex::encode(&self.public_blob[..8.min(self.public_blob.len())]))
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
