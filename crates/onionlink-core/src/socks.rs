//! SOCKS5 client for dialing through the local Tor proxy.
//!
//! Implements the RFC 1928 no-auth CONNECT flow only: Tor's SOCKS port
//! never asks for authentication, and the target is always a domain
//! (the proxy resolves hidden-service names internally).

use crate::address::HiddenAddress;
use crate::error::{Error, Result};
use crate::logging::ShortAddr;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Dials TCP targets through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: SocketAddr,
    io_timeout: Duration,
}

impl Socks5Dialer {
    /// Create a dialer for the given proxy endpoint.
    ///
    /// `io_timeout` bounds the TCP connect and every individual read
    /// and write of the SOCKS exchange.
    pub fn new(proxy_addr: SocketAddr, io_timeout: Duration) -> Self {
        Self {
            proxy_addr,
            io_timeout,
        }
    }

    /// CONNECT to `target:port` through the proxy.
    ///
    /// Returns the stream positioned just past the SOCKS reply; all
    /// subsequent bytes belong to the tunneled connection.
    pub async fn connect(&self, target: &HiddenAddress, port: u16) -> Result<TcpStream> {
        debug!(proxy = %self.proxy_addr, target = %ShortAddr(target.as_str()), port, "dialing through SOCKS5");

        let mut stream = self
            .timed(TcpStream::connect(self.proxy_addr))
            .await?
            .map_err(Error::from)?;

        self.negotiate(&mut stream).await?;
        self.request_connect(&mut stream, target, port).await?;

        debug!(target = %ShortAddr(target.as_str()), "SOCKS5 tunnel established");
        Ok(stream)
    }

    /// Method selection: offer no-auth, require the proxy to pick it.
    async fn negotiate(&self, stream: &mut TcpStream) -> Result<()> {
        self.write_all(stream, &[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
            .await?;

        let mut reply = [0u8; 2];
        self.read_exact(stream, &mut reply).await?;

        if reply != [SOCKS_VERSION, METHOD_NO_AUTH] {
            return Err(Error::SocksNegotiation);
        }
        Ok(())
    }

    /// CONNECT request with a domain target, then drain the bound
    /// address from the reply.
    async fn request_connect(
        &self,
        stream: &mut TcpStream,
        target: &HiddenAddress,
        port: u16,
    ) -> Result<()> {
        let domain = target.as_str().as_bytes();
        if domain.len() > 255 {
            return Err(Error::Address("domain exceeds 255 bytes".into()));
        }

        let mut request = Vec::with_capacity(7 + domain.len());
        request.push(SOCKS_VERSION);
        request.push(CMD_CONNECT);
        request.push(0x00);
        request.push(ATYP_DOMAIN);
        request.push(domain.len() as u8);
        request.extend_from_slice(domain);
        request.extend_from_slice(&port.to_be_bytes());
        self.write_all(stream, &request).await?;

        let mut header = [0u8; 4];
        self.read_exact(stream, &mut header).await?;

        if header[0] != SOCKS_VERSION {
            return Err(Error::SocksProtocol("bad version in reply".into()));
        }
        if header[1] != 0x00 {
            return Err(Error::SocksConnect(header[1]));
        }

        // BND.ADDR varies by address type; it must be consumed even
        // though nothing here uses it.
        match header[3] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 4];
                self.read_exact(stream, &mut buf).await?;
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 16];
                self.read_exact(stream, &mut buf).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.read_exact(stream, &mut len).await?;
                let mut buf = vec![0u8; len[0] as usize];
                self.read_exact(stream, &mut buf).await?;
            }
            _ => {
                return Err(Error::SocksProtocol("unknown address type in reply".into()));
            }
        }

        // BND.PORT.
        let mut bnd_port = [0u8; 2];
        self.read_exact(stream, &mut bnd_port).await?;

        Ok(())
    }

    async fn write_all(&self, stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
        self.timed(stream.write_all(buf))
            .await?
            .map_err(Error::from)
    }

    async fn read_exact(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
        self.timed(stream.read_exact(buf))
            .await?
            .map(|_| ())
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    Error::SocksProtocol("proxy closed mid-reply".into())
                }
                _ => Error::from(e),
            })
    }

    async fn timed<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| Error::Timeout)
    }
}
