//! Wire protocol for the peer link.
//!
//! A strict binary protocol over one ordered byte stream per session.
//! Framing is the only plaintext the transport ever sees; message
//! payloads are encrypted before they reach the codec.
//!
//! ## Frame kinds
//!
//! ```text
//! 0x01 KeyExchange       ephemeral public key blob
//! 0x02 EncryptedMessage  IV || ciphertext || HMAC tag
//! 0x03 TypingIndicator   empty
//! 0x04 ReadReceipt       empty
//! 0x05 ConnectionAck     empty
//! ```
//!
//! Payloads are capped at 10 MiB; anything larger is a protocol error
//! rejected before allocation.

mod frame;
mod session;

pub use frame::{FrameKind, FrameReader, FrameWriter, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use session::{ProtocolSession, SessionReceiver, SessionSender};
