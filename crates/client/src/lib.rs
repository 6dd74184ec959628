//! TURN relay client.
//!
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//!
//! [`TurnAsyncSocket`] runs every socket as one tokio task that owns the
//! transport, the outstanding request table, the channel bindings and the
//! allocation timers. Results are delivered to a [`TurnAsyncSocketHandler`].
//! [`sync::TurnSocket`] offers the same protocol behind blocking calls.

pub mod channel;
pub mod handler;
pub mod request;
pub mod socket;
pub mod sync;
pub mod transport;

pub use self::{
    handler::{AllocationInfo, TurnAsyncSocketHandler},
    socket::{AllocationProps, PortProps, TurnAsyncSocket},
    transport::TransportType,
};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The default bind address is unspecified and port 0.
pub const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// The default address is localhost and port 3478.
pub const DEFAULT_ADDRESS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3478);

/// Value of the SOFTWARE attribute carried by every message.
pub const SOFTWARE: &str = concat!("sipturn ", env!("CARGO_PKG_VERSION"));

/// Lifetime and bandwidth value meaning "let the server choose", the
/// attribute is left out of the request.
pub const UNSPECIFIED: u32 = u32::MAX;

/// Why an operation failed, passed to the handler failure callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotConnected,
    AlreadyAllocated,
    NoAllocation,
    NoActiveDestination,
    InvalidRequestedTransport,
    MissingAttributes,
    ResponseTimeout,
    StrayResponse,
    BadMessageIntegrity,
    UnknownRequiredAttributes,
    FrameError,
    UnknownRemoteAddress,
    InvalidChannelNumberReceived,
    ErrorParsingMessage,
    ReadError,
    ReadTimeout,
    BufferTooSmall,
    /// STUN error response, three digit status.
    Stun(u16),
    Io(std::io::ErrorKind),
    Tls,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stun(code) => write!(f, "stun error response {code}"),
            Self::Io(kind) => write!(f, "io error: {kind}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Codec(codec::Error),
    Kind(ErrorKind),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(e) => ErrorKind::Io(e.kind()),
            Self::Codec(_) => ErrorKind::ErrorParsingMessage,
            Self::Kind(kind) => *kind,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<ErrorKind> for Error {
    fn from(value: ErrorKind) -> Self {
        Self::Kind(value)
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// TLS client configuration.
#[derive(Debug, Clone)]
pub struct Ssl {
    /// PEM file with the certificate authorities trusted for the server.
    pub certificate_chain: String,
    /// Name checked against the server certificate, defaults to the host
    /// passed to connect.
    pub server_name: Option<String>,
}

/// Settings shared by the asynchronous and the blocking socket.
#[derive(Debug, Clone)]
pub struct TurnSocketOptions {
    pub transport: TransportType,
    pub bind: SocketAddr,
    /// Largest frame accepted from the transport.
    pub buffer_size: usize,
    /// Interval between ChannelBind refreshes of a confirmed channel.
    pub channel_refresh: std::time::Duration,
    pub ssl: Option<Ssl>,
}

impl Default for TurnSocketOptions {
    fn default() -> Self {
        Self {
            transport: TransportType::Udp,
            bind: DEFAULT_BIND,
            buffer_size: 4096,
            channel_refresh: std::time::Duration::from_secs(240),
            ssl: None,
        }
    }
}

pub struct TurnClientBuilder {
    options: TurnSocketOptions,
}

impl Default for TurnClientBuilder {
    fn default() -> Self {
        Self {
            options: TurnSocketOptions::default(),
        }
    }
}

impl TurnClientBuilder {
    pub fn with_transport(&mut self, transport: TransportType) -> &mut Self {
        self.options.transport = transport;
        self
    }

    pub fn with_bind(&mut self, bind: SocketAddr) -> &mut Self {
        self.options.bind = bind;
        self
    }

    pub fn with_buffer_size(&mut self, size: usize) -> &mut Self {
        self.options.buffer_size = size;
        self
    }

    pub fn with_channel_refresh(&mut self, interval: std::time::Duration) -> &mut Self {
        self.options.channel_refresh = interval;
        self
    }

    pub fn with_ssl(&mut self, ssl: Ssl) -> &mut Self {
        self.options.ssl = Some(ssl);
        self
    }

    pub fn options(&self) -> &TurnSocketOptions {
        &self.options
    }

    /// Spawn the socket task on the current tokio runtime.
    pub fn build<H: TurnAsyncSocketHandler>(&self, handler: H) -> TurnAsyncSocket {
        TurnAsyncSocket::new(self.options.clone(), handler)
    }
}
