use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::UdpSocket;

use super::Frame;
use crate::{Error, ErrorKind, TurnSocketOptions};

/// Unconnected datagram socket with a default destination, so that
/// connectivity checks can reach other targets through the same port.
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
    remote: SocketAddr,
    buffer: BytesMut,
    buffer_size: usize,
}

impl UdpTransport {
    pub async fn connect(options: &TurnSocketOptions, remote: SocketAddr) -> Result<Self, Error> {
        let bind = if options.bind.is_ipv4() == remote.is_ipv4() {
            options.bind
        } else if remote.is_ipv4() {
            crate::DEFAULT_BIND
        } else {
            "[::]:0".parse().map_err(|_| Error::Kind(ErrorKind::NotConnected))?
        };

        let socket = UdpSocket::bind(bind).await?;
        let local = socket.local_addr()?;

        Ok(Self {
            socket,
            local,
            remote,
            buffer: BytesMut::zeroed(options.buffer_size + 1),
            buffer_size: options.buffer_size,
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn connected_address(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(bytes, target).await.map(|_| ())
    }

    /// A datagram larger than the buffer size is dropped and reported as a
    /// framing error. The buffer has one spare byte to tell it apart from
    /// a datagram that fills the buffer exactly.
    pub async fn recv(&mut self) -> Result<Frame, Error> {
        if self.buffer.len() <= self.buffer_size {
            self.buffer.resize(self.buffer_size + 1, 0);
        }

        let (size, source) = self.socket.recv_from(&mut self.buffer).await?;
        if size > self.buffer_size {
            log::warn!(
                "turn datagram too large: max={}, source={source}",
                self.buffer_size
            );

            return Err(Error::Kind(ErrorKind::FrameError));
        }

        Ok(Frame {
            bytes: self.buffer.split_to(size).freeze(),
            source,
        })
    }
}
