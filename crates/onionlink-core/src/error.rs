//! Error types for onionlink.
//!
//! Cryptographic failures carry no detail beyond their kind: a decrypt
//! error must not reveal whether the tag, the padding, or the encoding
//! was wrong to anyone who can observe the error path.

use thiserror::Error;

/// Core error type for onionlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The SOCKS5 proxy rejected the no-auth method selection.
    #[error("SOCKS5 method negotiation failed")]
    SocksNegotiation,

    /// The SOCKS5 proxy refused the CONNECT request with the given
    /// reply code (RFC 1928 section 6).
    #[error("SOCKS5 connect refused (reply code {0:#04x})")]
    SocksConnect(u8),

    /// The SOCKS5 proxy violated the protocol (bad version byte,
    /// unknown address type, or EOF mid-reply).
    #[error("SOCKS5 protocol violation")]
    SocksProtocol(String),

    /// The peer closed the stream mid-frame or before a frame started.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Wire protocol violation (unexpected frame kind, oversized
    /// length, malformed header).
    #[error("protocol error")]
    Protocol(String),

    /// The peer's public key blob is malformed or not on the curve.
    #[error("invalid peer public key")]
    BadPeerKey,

    /// Message authentication failed. The frame was tampered with or
    /// the channel is out of sync; the session must be torn down.
    #[error("message integrity check failed")]
    IntegrityFailed,

    /// Ciphertext structure is invalid (bad length, padding, or
    /// encoding) despite an intact tag.
    #[error("malformed ciphertext")]
    MalformedCiphertext,

    /// An operation requiring derived session keys ran before key
    /// exchange completed. Programming error; fatal.
    #[error("session keys not initialized")]
    NotInitialized,

    /// Key exchange was driven out of order (second derive, or derive
    /// after teardown). Programming error; fatal.
    #[error("key exchange state violation")]
    KeyExchangeState,

    /// A send was issued while no live session exists.
    #[error("not connected")]
    NotConnected,

    /// A cryptographic backend operation failed.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Peer address failed validation.
    #[error("invalid peer address")]
    Address(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Operation was cancelled by a local shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type alias using onionlink's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
