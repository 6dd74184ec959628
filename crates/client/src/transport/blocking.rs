use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use codec::Decoder;

use super::{Frame, TransportType};
use crate::{Error, ErrorKind, TurnSocketOptions};

/// Blocking counterpart of [`super::Transport`], reads take a timeout.
pub enum BlockingTransport {
    Udp {
        socket: UdpSocket,
        remote: SocketAddr,
        buffer: Vec<u8>,
    },
    Tcp(BlockingStream<TcpStream>),
    #[cfg(feature = "ssl")]
    Tls(
        Box<
            BlockingStream<
                tokio_rustls::rustls::StreamOwned<tokio_rustls::rustls::ClientConnection, TcpStream>,
            >,
        >,
    ),
}

impl BlockingTransport {
    pub fn connect(options: &TurnSocketOptions, host: &str, port: u16) -> Result<Self, Error> {
        let mut last_error = Error::Kind(ErrorKind::NotConnected);

        for remote in (host, port).to_socket_addrs()? {
            match Self::connect_to(options, host, remote) {
                Ok(it) => return Ok(it),
                Err(e) => {
                    log::warn!("turn transport connect failed: remote={remote}, err={e}");

                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn connect_to(options: &TurnSocketOptions, host: &str, remote: SocketAddr) -> Result<Self, Error> {
        Ok(match options.transport {
            TransportType::Udp => {
                let bind = if options.bind.is_ipv4() == remote.is_ipv4() {
                    options.bind
                } else if remote.is_ipv4() {
                    crate::DEFAULT_BIND
                } else {
                    SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0)
                };

                Self::Udp {
                    socket: UdpSocket::bind(bind)?,
                    buffer: vec![0u8; options.buffer_size + 1],
                    remote,
                }
            }
            TransportType::Tcp => {
                Self::Tcp(BlockingStream::new(connect_tcp(remote)?, remote, options.buffer_size)?)
            }
            #[cfg(feature = "ssl")]
            TransportType::Tls => {
                use tokio_rustls::rustls::{ClientConnection, StreamOwned};

                let ssl = options.ssl.as_ref().ok_or(Error::Kind(ErrorKind::Tls))?;
                let connection = ClientConnection::new(
                    super::tls::client_config(ssl)?,
                    super::tls::server_name(ssl, host)?,
                )
                .map_err(|e| {
                    log::warn!("tls client connection failed: host={host}, err={e}");

                    Error::Kind(ErrorKind::Tls)
                })?;

                let stream = StreamOwned::new(connection, connect_tcp(remote)?);
                Self::Tls(Box::new(BlockingStream::new(stream, remote, options.buffer_size)?))
            }
            #[cfg(not(feature = "ssl"))]
            TransportType::Tls => {
                let _ = host;
                return Err(Error::Kind(ErrorKind::Tls));
            }
        })
    }

    pub fn kind(&self) -> TransportType {
        match self {
            Self::Udp { .. } => TransportType::Udp,
            Self::Tcp(_) => TransportType::Tcp,
            #[cfg(feature = "ssl")]
            Self::Tls(_) => TransportType::Tls,
        }
    }

    pub fn connected_address(&self) -> SocketAddr {
        match self {
            Self::Udp { remote, .. } => *remote,
            Self::Tcp(it) => it.remote,
            #[cfg(feature = "ssl")]
            Self::Tls(it) => it.remote,
        }
    }

    pub fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let remote = self.connected_address();
        self.send_to(bytes, remote)
    }

    /// Stream transports only have one destination and ignore `target`.
    pub fn send_to(&mut self, bytes: &[u8], target: SocketAddr) -> std::io::Result<()> {
        match self {
            Self::Udp { socket, .. } => socket.send_to(bytes, target).map(|_| ()),
            Self::Tcp(it) => it.send(bytes),
            #[cfg(feature = "ssl")]
            Self::Tls(it) => it.send(bytes),
        }
    }

    /// Wait at most `timeout` for the next frame, [`ErrorKind::ReadTimeout`]
    /// when nothing arrived.
    pub fn recv(&mut self, timeout: Duration) -> Result<Frame, Error> {
        match self {
            Self::Udp { socket, remote, buffer } => {
                socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

                match socket.recv_from(buffer) {
                    Ok((size, source)) if size >= buffer.len() => {
                        log::warn!(
                            "turn datagram too large: max={}, source={source}",
                            buffer.len() - 1
                        );

                        Err(Error::Kind(ErrorKind::FrameError))
                    }
                    Ok((size, source)) => Ok(Frame {
                        bytes: bytes::Bytes::copy_from_slice(&buffer[..size]),
                        source,
                    }),
                    Err(e) if is_timeout(&e) => Err(Error::Kind(ErrorKind::ReadTimeout)),
                    Err(e) => {
                        log::warn!("turn udp read failed: server={remote}, err={e}");

                        Err(e.into())
                    }
                }
            }
            Self::Tcp(it) => it.recv(timeout),
            #[cfg(feature = "ssl")]
            Self::Tls(it) => it.recv(timeout),
        }
    }
}

pub trait ReadTimeout {
    fn set_timeout(&self, timeout: Duration) -> std::io::Result<()>;
}

impl ReadTimeout for TcpStream {
    fn set_timeout(&self, timeout: Duration) -> std::io::Result<()> {
        self.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
    }
}

#[cfg(feature = "ssl")]
impl ReadTimeout
    for tokio_rustls::rustls::StreamOwned<tokio_rustls::rustls::ClientConnection, TcpStream>
{
    fn set_timeout(&self, timeout: Duration) -> std::io::Result<()> {
        self.sock.set_timeout(timeout)
    }
}

/// Byte stream framed by the 4-byte STUN/ChannelData header. A frame only
/// partially read when a timeout fires stays buffered for the next call.
pub struct BlockingStream<S> {
    stream: S,
    remote: SocketAddr,
    buffer: BytesMut,
    buffer_size: usize,
}

impl<S: Read + Write + ReadTimeout> BlockingStream<S> {
    fn new(stream: S, remote: SocketAddr, buffer_size: usize) -> Result<Self, Error> {
        Ok(Self {
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size,
            stream,
            remote,
        })
    }

    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn recv(&mut self, timeout: Duration) -> Result<Frame, Error> {
        let deadline = Instant::now() + timeout;

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

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Kind(ErrorKind::ReadTimeout));
            }

            self.stream.set_timeout(remaining)?;

            let len = self.buffer.len();
            self.buffer.resize(len + self.buffer_size, 0);

            let result = self.stream.read(&mut self.buffer[len..]);
            let size = *result.as_ref().unwrap_or(&0);
            self.buffer.truncate(len + size);

            match result {
                Ok(0) => return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
                Ok(_) => (),
                Err(e) if is_timeout(&e) => return Err(Error::Kind(ErrorKind::ReadTimeout)),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn connect_tcp(remote: SocketAddr) -> Result<TcpStream, Error> {
    let stream = TcpStream::connect(remote)?;
    if let Err(e) = stream.set_nodelay(true) {
        log::error!("tcp socket set nodelay failed!: addr={remote}, err={e}");
    }

    Ok(stream)
}

fn is_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
