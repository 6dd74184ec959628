use std::{fs::read_to_string, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use client::{TransportType, TurnClientBuilder};
use dum::{
    Profile,
    auth::ServerAuthConfig,
    message::{NameAddr, Uri},
};
use serde::Deserialize;

/// TLS configuration of the TURN transport.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ssl {
    ///
    /// PEM file with the certificate authorities trusted for the server.
    ///
    pub certificate_chain: String,
    ///
    /// Name checked against the server certificate, defaults to the server
    /// host.
    ///
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl From<Transport> for TransportType {
    fn from(value: Transport) -> Self {
        match value {
            Transport::Udp => Self::Udp,
            Transport::Tcp => Self::Tcp,
            Transport::Tls => Self::Tls,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Turn {
    ///
    /// turn server host
    ///
    /// A host name is resolved when connecting, the first address is used.
    ///
    #[serde(default = "Turn::server")]
    pub server: String,
    #[serde(default = "Turn::port")]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
    ///
    /// Local address the transport is bound to.
    ///
    #[serde(default = "Turn::bind")]
    pub bind: SocketAddr,
    ///
    /// Long-term credentials, the realm and nonce are learned from the
    /// server's first challenge.
    ///
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    ///
    /// Use the credentials as short-term credentials.
    ///
    #[serde(default)]
    pub short_term: bool,
    ///
    /// Requested allocation lifetime in seconds.
    ///
    #[serde(default = "Turn::lifetime")]
    pub lifetime: u32,
    ///
    /// Seconds between ChannelBind refreshes.
    ///
    #[serde(default = "Turn::channel_refresh")]
    pub channel_refresh: u64,
    ///
    /// Largest frame accepted from the transport.
    ///
    #[serde(default = "Turn::buffer_size")]
    pub buffer_size: usize,
    ///
    /// Peer set as active destination once the allocation exists.
    ///
    #[serde(default)]
    pub peer: Option<SocketAddr>,
    #[serde(default)]
    pub ssl: Option<Ssl>,
}

impl Turn {
    fn server() -> String {
        "localhost".to_string()
    }

    fn port() -> u16 {
        3478
    }

    fn bind() -> SocketAddr {
        client::DEFAULT_BIND
    }

    fn lifetime() -> u32 {
        600
    }

    fn channel_refresh() -> u64 {
        240
    }

    fn buffer_size() -> usize {
        4096
    }

    pub fn builder(&self) -> TurnClientBuilder {
        let mut builder = TurnClientBuilder::default();
        builder
            .with_transport(self.transport.into())
            .with_bind(self.bind)
            .with_buffer_size(self.buffer_size)
            .with_channel_refresh(Duration::from_secs(self.channel_refresh));

        if let Some(ssl) = &self.ssl {
            builder.with_ssl(client::Ssl {
                certificate_chain: ssl.certificate_chain.clone(),
                server_name: ssl.server_name.clone(),
            });
        }

        builder
    }
}

impl Default for Turn {
    fn default() -> Self {
        Self {
            server: Self::server(),
            port: Self::port(),
            transport: Transport::default(),
            bind: Self::bind(),
            username: None,
            password: None,
            short_term: false,
            lifetime: Self::lifetime(),
            channel_refresh: Self::channel_refresh(),
            buffer_size: Self::buffer_size(),
            peer: None,
            ssl: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Sip {
    ///
    /// Address of record put into From, for example `sip:alice@example.com`.
    ///
    #[serde(default = "Sip::identity")]
    pub identity: String,
    ///
    /// Contact of dialog forming requests, defaults to the identity.
    ///
    #[serde(default)]
    pub contact: Option<String>,
    ///
    /// Re-key early dialogs on a changed To tag with the same remote
    /// target.
    ///
    #[serde(default)]
    pub loose_to_tag_matching: bool,
    ///
    /// Session interval in seconds, 0 disables session timers.
    ///
    #[serde(default = "Sip::session_expires")]
    pub session_expires: u32,
    #[serde(default = "Sip::min_se")]
    pub min_se: u32,
    #[serde(default = "Sip::register_expires")]
    pub register_expires: u32,
    #[serde(default = "Sip::allow_update")]
    pub allow_update: bool,
    ///
    /// Realm of the digest challenges this side sends, derived from the
    /// request when missing.
    ///
    #[serde(default)]
    pub realm: Option<String>,
    ///
    /// Seconds a digest nonce stays valid.
    ///
    #[serde(default = "Sip::nonce_lifetime")]
    pub nonce_lifetime: u64,
}

impl Sip {
    fn identity() -> String {
        "sip:anonymous@localhost".to_string()
    }

    fn session_expires() -> u32 {
        1800
    }

    fn min_se() -> u32 {
        90
    }

    fn register_expires() -> u32 {
        3600
    }

    fn allow_update() -> bool {
        true
    }

    fn nonce_lifetime() -> u64 {
        300
    }

    pub fn profile(&self) -> Result<Profile, dum::Error> {
        let identity = Uri::from_str(&self.identity)?;
        let contact = match &self.contact {
            Some(it) => Uri::from_str(it)?,
            None => identity.clone(),
        };

        Ok(Profile {
            identity: NameAddr::new(identity),
            contact: NameAddr::new(contact),
            loose_to_tag_matching: self.loose_to_tag_matching,
            session_expires: self.session_expires,
            min_se: self.min_se,
            register_expires: self.register_expires,
            allow_update: self.allow_update,
            ..Default::default()
        })
    }

    pub fn server_auth(&self) -> ServerAuthConfig {
        ServerAuthConfig {
            realm: self.realm.clone(),
            nonce_lifetime: Duration::from_secs(self.nonce_lifetime),
            ..Default::default()
        }
    }
}

impl Default for Sip {
    fn default() -> Self {
        Self {
            identity: Self::identity(),
            contact: None,
            loose_to_tag_matching: false,
            session_expires: Self::session_expires(),
            min_se: Self::min_se(),
            register_expires: Self::register_expires(),
            allow_update: Self::allow_update(),
            realm: None,
            nonce_lifetime: Self::nonce_lifetime(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub turn: Turn,
    #[serde(default)]
    pub sip: Sip,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: sipturn --config /etc/sipturn/config.json5
    ///
    #[arg(long, short)]
    pub config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If the configuration file path is specified, the configuration is
    /// read from the configuration file, otherwise the default configuration
    /// is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => Self::parse(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }

    pub fn parse(source: &str) -> Result<Self> {
        Ok(serde_json5::from_str::<Self>(source)?)
    }
}
