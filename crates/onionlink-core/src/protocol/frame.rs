//! Length-prefixed frame transport.
//!
//! Wire format, little-endian length:
//!
//! ```text
//! ┌─────────┬───────────────────┬───────────────────┐
//! │  kind   │  length (u32 LE)  │      payload      │
//! │ (1 byte)│     (4 bytes)     │    (variable)     │
//! └─────────┴───────────────────┴───────────────────┘
//! ```
//!
//! The reader validates the declared length against the payload cap
//! before allocating anything. Kind bytes pass through raw; mapping
//! them to [`FrameKind`] is the session layer's job, so a malformed
//! kind and a malformed length surface at the right layers.

use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on frame payloads: 10 MiB.
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024;

/// Frame header size: kind byte plus length prefix.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame kinds of the peer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Ephemeral public key blob for session key agreement.
    KeyExchange = 0x01,
    /// Authenticated-encrypted chat message.
    EncryptedMessage = 0x02,
    /// Peer is typing. Empty payload.
    TypingIndicator = 0x03,
    /// Peer displayed a received message. Empty payload.
    ReadReceipt = 0x04,
    /// Handshake acknowledgement. Empty payload.
    ConnectionAck = 0x05,
}

impl FrameKind {
    /// Parse a frame kind from its wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::KeyExchange),
            0x02 => Ok(Self::EncryptedMessage),
            0x03 => Ok(Self::TypingIndicator),
            0x04 => Ok(Self::ReadReceipt),
            0x05 => Ok(Self::ConnectionAck),
            _ => Err(Error::Protocol(format!("unknown frame kind: {:#04x}", byte))),
        }
    }

    /// The wire byte for this kind.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Reads frames from the receive half of a stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a readable stream half.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one complete frame.
    ///
    /// Returns the raw kind byte and the payload. EOF before or inside
    /// a frame is [`Error::ConnectionClosed`]; a declared length over
    /// the cap fails before any payload storage is allocated.
    pub async fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(map_closed)?;

        let kind = header[0];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[1..5]);
        let length = u32::from_le_bytes(len_bytes) as usize;

        if length > MAX_FRAME_PAYLOAD {
            return Err(Error::Protocol(format!(
                "frame payload of {} bytes exceeds cap",
                length
            )));
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            self.inner
                .read_exact(&mut payload)
                .await
                .map_err(map_closed)?;
        }

        Ok((kind, payload))
    }
}

/// Writes frames to the send half of a stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writable stream half.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one complete frame and flush.
    ///
    /// Header and payload go out as a single buffer so a frame is
    /// never torn by an interleaved writer.
    pub async fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::Protocol(format!(
                "frame payload of {} bytes exceeds cap",
                payload.len()
            )));
        }

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.push(kind.to_byte());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

fn map_closed(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        _ => Error::Io(e.to_string()),
    }
}
