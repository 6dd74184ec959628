use std::net::SocketAddr;

use bytes::BytesMut;
use codec::Decoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Frame;
use crate::{Error, ErrorKind};

/// Byte stream socket framed by the STUN/ChannelData header.
pub struct StreamTransport<S> {
    stream: S,
    local: SocketAddr,
    remote: SocketAddr,
    buffer: BytesMut,
    buffer_size: usize,
}

pub trait PeerAddress {
    fn addresses(&self) -> std::io::Result<(SocketAddr, SocketAddr)>;
}

impl PeerAddress for tokio::net::TcpStream {
    fn addresses(&self) -> std::io::Result<(SocketAddr, SocketAddr)> {
        Ok((self.local_addr()?, self.peer_addr()?))
    }
}

#[cfg(feature = "ssl")]
impl PeerAddress for tokio_rustls::client::TlsStream<tokio::net::TcpStream> {
    fn addresses(&self) -> std::io::Result<(SocketAddr, SocketAddr)> {
        self.get_ref().0.addresses()
    }
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + PeerAddress + Unpin,
{
    pub fn new(stream: S, buffer_size: usize) -> Self {
        let (local, remote) = stream
            .addresses()
            .unwrap_or((crate::DEFAULT_BIND, crate::DEFAULT_BIND));

        Self {
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size,
            stream,
            local,
            remote,
        }
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn connected_address(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// A header declaring a frame larger than the receive buffer is a
    /// framing error, the connection can not be resynchronized after it.
    pub async fn recv(&mut self) -> Result<Frame, Error> {
        loop {
            if self.buffer.len() >= 4 {
                let size = Decoder::message_size(&self.buffer, true)
                    .map_err(|_| Error::Kind(ErrorKind::FrameError))?;

                if size > self.buffer_size {
                    log::warn!(
                        "turn frame too large: size={size}, max={}, addr={}",
                        self.buffer_size,
                        self.remote
                    );

                    return Err(Error::Kind(ErrorKind::FrameError));
                }

                if self.buffer.len() >= size {
                    return Ok(Frame {
                        bytes: self.buffer.split_to(size).freeze(),
                        source: self.remote,
                    });
                }
            }

            self.buffer.reserve(self.buffer_size);
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }
}
