//! # Onionlink Core Library
//!
//! An anonymous two-party chat endpoint. Peers reach each other over
//! Tor hidden services and speak an end-to-end encrypted, framed binary
//! protocol over a single ordered stream per session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               Application                │
//! ├──────────────────────────────────────────┤
//! │     endpoint (roles, events, dispatch)   │
//! ├────────────────────┬─────────────────────┤
//! │  protocol (wire)   │   socks (dialing)   │
//! ├────────────────────┴─────────────────────┤
//! │         crypto         │     address     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Fresh ECDH key pair per session: Perfect Forward Secrecy
//! - Encrypt-then-MAC: tampering is rejected before decryption
//! - All session secrets zeroized on teardown
//! - **No identity binding**: the key exchange is opportunistic and
//!   does not authenticate who holds the hidden address. An attacker
//!   controlling the transport can man-in-the-middle a session.
//!
//! Tor itself — spawning the daemon, publishing the hidden service,
//! bootstrapping — is the embedding application's responsibility. The
//! core takes a SOCKS endpoint, a listen port, and the peer's hidden
//! address as plain inputs.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod address;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod socks;

pub use address::HiddenAddress;
pub use endpoint::{EndpointConfig, PeerEndpoint, PeerEvent, Phase, Role};
pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upstream limit on chat message length in characters.
///
/// Enforced by the application before sending; the transport itself
/// carries any payload up to the frame cap.
pub const MAX_MESSAGE_CHARS: usize = 280;
