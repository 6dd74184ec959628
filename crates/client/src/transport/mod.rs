//! One asynchronous interface over the three transports a TURN client can
//! use to reach its server.
//!
//! Datagram transports deliver one frame per datagram. Stream transports
//! are framed by the 4-byte header shared by STUN and ChannelData messages.

mod blocking;
mod stream;
#[cfg(feature = "ssl")]
mod tls;
mod udp;

pub use self::{blocking::BlockingTransport, stream::StreamTransport, udp::UdpTransport};

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::{TcpSocket, TcpStream, lookup_host};

use crate::{Error, ErrorKind, TurnSocketOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Udp,
    Tcp,
    Tls,
}

impl TransportType {
    /// Reliable transports never retransmit requests.
    pub fn is_reliable(self) -> bool {
        self != Self::Udp
    }
}

/// One frame read from the transport and the address it came from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Bytes,
    pub source: SocketAddr,
}

pub enum Transport {
    Udp(UdpTransport),
    Tcp(StreamTransport<TcpStream>),
    #[cfg(feature = "ssl")]
    Tls(StreamTransport<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    /// Resolve `host` and try every resolved endpoint in order, the last
    /// failure is returned when none succeeds.
    pub async fn connect(options: &TurnSocketOptions, host: &str, port: u16) -> Result<Self, Error> {
        let mut last_error = Error::Kind(ErrorKind::NotConnected);

        for remote in lookup_host((host, port)).await? {
            let result = match options.transport {
                TransportType::Udp => UdpTransport::connect(options, remote).await.map(Self::Udp),
                TransportType::Tcp => connect_tcp(options, remote)
                    .await
                    .map(|stream| Self::Tcp(StreamTransport::new(stream, options.buffer_size))),
                #[cfg(feature = "ssl")]
                TransportType::Tls => match connect_tcp(options, remote).await {
                    Ok(stream) => tls::handshake(options, host, stream)
                        .await
                        .map(|stream| Self::Tls(StreamTransport::new(stream, options.buffer_size))),
                    Err(e) => Err(e),
                },
                #[cfg(not(feature = "ssl"))]
                TransportType::Tls => Err(Error::Kind(ErrorKind::Tls)),
            };

            match result {
                Ok(it) => return Ok(it),
                Err(e) => {
                    log::warn!("turn transport connect failed: remote={remote}, err={e}");

                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    pub fn kind(&self) -> TransportType {
        match self {
            Self::Udp(_) => TransportType::Udp,
            Self::Tcp(_) => TransportType::Tcp,
            #[cfg(feature = "ssl")]
            Self::Tls(_) => TransportType::Tls,
        }
    }

    pub fn local_address(&self) -> SocketAddr {
        match self {
            Self::Udp(it) => it.local_address(),
            Self::Tcp(it) => it.local_address(),
            #[cfg(feature = "ssl")]
            Self::Tls(it) => it.local_address(),
        }
    }

    pub fn connected_address(&self) -> SocketAddr {
        match self {
            Self::Udp(it) => it.connected_address(),
            Self::Tcp(it) => it.connected_address(),
            #[cfg(feature = "ssl")]
            Self::Tls(it) => it.connected_address(),
        }
    }

    /// Write one frame to the connected server.
    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Udp(it) => it.send_to(bytes, it.connected_address()).await,
            Self::Tcp(it) => it.send(bytes).await,
            #[cfg(feature = "ssl")]
            Self::Tls(it) => it.send(bytes).await,
        }
    }

    /// Write one frame to an arbitrary target. Stream transports only have
    /// one destination and ignore `target`.
    pub async fn send_to(&mut self, bytes: &[u8], target: SocketAddr) -> std::io::Result<()> {
        match self {
            Self::Udp(it) => it.send_to(bytes, target).await,
            Self::Tcp(it) => it.send(bytes).await,
            #[cfg(feature = "ssl")]
            Self::Tls(it) => it.send(bytes).await,
        }
    }

    /// Read the next frame. Cancel safe: a frame that is only partially
    /// received stays buffered.
    pub async fn recv(&mut self) -> Result<Frame, Error> {
        match self {
            Self::Udp(it) => it.recv().await,
            Self::Tcp(it) => it.recv().await,
            #[cfg(feature = "ssl")]
            Self::Tls(it) => it.recv().await,
        }
    }
}

async fn connect_tcp(options: &TurnSocketOptions, remote: SocketAddr) -> Result<TcpStream, Error> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if options.bind.is_ipv4() == remote.is_ipv4() {
        socket.bind(options.bind)?;
    }

    let stream = socket.connect(remote).await?;

    if let Err(e) = stream.set_nodelay(true) {
        log::error!("tcp socket set nodelay failed!: addr={remote}, err={e}");
    }

    Ok(stream)
}
