//! Semantic frame exchange bound to a cryptographic session.
//!
//! [`ProtocolSession`] owns both stream halves and the crypto state
//! while the handshake runs. Once both sides have derived keys it is
//! split with [`into_live`](ProtocolSession::into_live) into a cloneable
//! [`SessionSender`] and the single [`SessionReceiver`] driven by the
//! dispatch loop.

use super::frame::{FrameKind, FrameReader, FrameWriter};
use crate::crypto::CryptoSession;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::trace;

/// A protocol session in the handshake phase.
pub struct ProtocolSession<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    crypto: CryptoSession,
}

impl<R, W> ProtocolSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Bind a fresh cryptographic session to a pair of stream halves.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            crypto: CryptoSession::new(),
        }
    }

    /// Whether the peer's key exchange has been processed.
    pub fn is_initialized(&self) -> bool {
        self.crypto.is_initialized()
    }

    /// Send our ephemeral public key.
    pub async fn send_key_exchange(&mut self) -> Result<()> {
        let blob = self.crypto.public_key_blob().to_vec();
        self.writer.write_frame(FrameKind::KeyExchange, &blob).await
    }

    /// Send a handshake acknowledgement.
    pub async fn send_ack(&mut self) -> Result<()> {
        self.writer.write_frame(FrameKind::ConnectionAck, &[]).await
    }

    /// Encrypt and send a chat message.
    pub async fn send_message(&mut self, text: &str) -> Result<()> {
        let payload = self.crypto.encrypt(text)?;
        self.writer
            .write_frame(FrameKind::EncryptedMessage, &payload)
            .await
    }

    /// Send a typing indicator.
    pub async fn send_typing(&mut self) -> Result<()> {
        self.writer
            .write_frame(FrameKind::TypingIndicator, &[])
            .await
    }

    /// Send a read receipt.
    pub async fn send_read_receipt(&mut self) -> Result<()> {
        self.writer.write_frame(FrameKind::ReadReceipt, &[]).await
    }

    /// Receive and interpret one frame.
    ///
    /// A `KeyExchange` frame drives key derivation internally; an
    /// `EncryptedMessage` is decrypted. Control frames carry no text.
    pub async fn receive(&mut self) -> Result<(FrameKind, Option<String>)> {
        let (kind_byte, payload) = self.reader.read_frame().await?;
        let kind = FrameKind::from_byte(kind_byte)?;
        trace!(kind = ?kind, len = payload.len(), "frame received");

        match kind {
            FrameKind::KeyExchange => {
                self.crypto.derive(&payload)?;
                Ok((kind, None))
            }
            FrameKind::EncryptedMessage => {
                let text = self.crypto.decrypt(&payload)?;
                Ok((kind, Some(text)))
            }
            FrameKind::TypingIndicator
            | FrameKind::ReadReceipt
            | FrameKind::ConnectionAck => Ok((kind, None)),
        }
    }

    /// Run the listener's half of the mutual-ack handshake.
    ///
    /// Order is fixed: send key, receive key, send ack, receive ack.
    /// Returning means the connector has confirmed it derived keys, so
    /// encrypted traffic may flow in either direction.
    pub async fn handshake_listener(&mut self) -> Result<()> {
        self.send_key_exchange().await?;
        self.expect_frame(FrameKind::KeyExchange).await?;
        self.send_ack().await?;
        self.expect_frame(FrameKind::ConnectionAck).await?;
        Ok(())
    }

    /// Run the connector's half of the mutual-ack handshake.
    ///
    /// Order is fixed: receive key, send key, receive ack, send ack.
    pub async fn handshake_connector(&mut self) -> Result<()> {
        self.expect_frame(FrameKind::KeyExchange).await?;
        self.send_key_exchange().await?;
        self.expect_frame(FrameKind::ConnectionAck).await?;
        self.send_ack().await?;
        Ok(())
    }

    async fn expect_frame(&mut self, expected: FrameKind) -> Result<()> {
        let (kind, _) = self.receive().await?;
        if kind != expected {
            return Err(Error::Protocol(format!(
                "expected {:?} frame, got {:?}",
                expected, kind
            )));
        }
        Ok(())
    }

    /// Split into the live send and receive halves.
    ///
    /// Must only be called after a successful handshake; the crypto
    /// session is frozen and shared between the halves.
    pub fn into_live(self) -> (SessionSender<W>, SessionReceiver<R>) {
        let crypto = Arc::new(self.crypto);
        let sender = SessionSender {
            writer: Arc::new(Mutex::new(self.writer)),
            crypto: Arc::clone(&crypto),
        };
        let receiver = SessionReceiver {
            reader: self.reader,
            crypto,
        };
        (sender, receiver)
    }
}

/// Cloneable sending half of a live session.
///
/// A mutex around the frame writer serializes concurrent sends so the
/// peer never observes a torn frame.
pub struct SessionSender<W> {
    writer: Arc<Mutex<FrameWriter<W>>>,
    crypto: Arc<CryptoSession>,
}

impl<W> Clone for SessionSender<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            crypto: Arc::clone(&self.crypto),
        }
    }
}

impl<W: AsyncWrite + Unpin> SessionSender<W> {
    /// Encrypt and send a chat message.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let payload = self.crypto.encrypt(text)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_frame(FrameKind::EncryptedMessage, &payload)
            .await
    }

    /// Send a typing indicator.
    pub async fn send_typing(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_frame(FrameKind::TypingIndicator, &[]).await
    }

    /// Send a read receipt.
    pub async fn send_read_receipt(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_frame(FrameKind::ReadReceipt, &[]).await
    }
}

/// Receiving half of a live session, owned by the dispatch loop.
pub struct SessionReceiver<R> {
    reader: FrameReader<R>,
    crypto: Arc<CryptoSession>,
}

impl<R: AsyncRead + Unpin> SessionReceiver<R> {
    /// Receive one live-phase frame.
    ///
    /// Handshake frames are a protocol violation once the session is
    /// live; the channel is torn down rather than resynchronized.
    pub async fn receive(&mut self) -> Result<(FrameKind, Option<String>)> {
        let (kind_byte, payload) = self.reader.read_frame().await?;
        let kind = FrameKind::from_byte(kind_byte)?;

        match kind {
            FrameKind::EncryptedMessage => {
                let text = self.crypto.decrypt(&payload)?;
                Ok((kind, Some(text)))
            }
            FrameKind::TypingIndicator | FrameKind::ReadReceipt => Ok((kind, None)),
            FrameKind::KeyExchange | FrameKind::ConnectionAck => Err(Error::Protocol(
                format!("{:?} frame after handshake", kind),
            )),
        }
    }
}
