pub mod config;

pub use client::{self, SOFTWARE};
pub use codec;
pub use dum;

use std::{net::SocketAddr, time::Duration};

use anyhow::anyhow;
use bytes::Bytes;
use client::{AllocationInfo, AllocationProps, ErrorKind, TurnAsyncSocketHandler};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use self::config::Config;

enum Event {
    Connected(SocketAddr),
    Allocated(AllocationInfo),
    Received(SocketAddr, Bytes),
    Failed(&'static str, ErrorKind),
    Closed,
}

/// Forwards the socket callbacks to the session loop.
struct Events(UnboundedSender<Event>);

impl Events {
    fn post(&self, event: Event) {
        let _ = self.0.send(event);
    }
}

impl TurnAsyncSocketHandler for Events {
    fn on_connect_success(&self, connected: SocketAddr) {
        self.post(Event::Connected(connected));
    }

    fn on_connect_failure(&self, error: ErrorKind) {
        self.post(Event::Failed("connect", error));
    }

    fn on_allocation_success(&self, info: AllocationInfo) {
        self.post(Event::Allocated(info));
    }

    fn on_allocation_failure(&self, error: ErrorKind) {
        self.post(Event::Failed("allocate", error));
    }

    fn on_refresh_success(&self, lifetime: u32) {
        log::info!("turn allocation refreshed: lifetime={lifetime}");
    }

    fn on_refresh_failure(&self, error: ErrorKind) {
        self.post(Event::Failed("refresh", error));
    }

    fn on_channel_bind_success(&self, channel: u16, peer: SocketAddr) {
        log::info!("turn channel bound: channel={channel}, peer={peer}");
    }

    fn on_set_active_destination_failure(&self, error: ErrorKind) {
        log::warn!("turn set active destination failed: error={error}");
    }

    fn on_receive_success(&self, source: SocketAddr, data: Bytes) {
        self.post(Event::Received(source, data));
    }

    fn on_receive_failure(&self, error: ErrorKind) {
        log::warn!("turn receive failed: error={error}");
    }

    fn on_closed(&self) {
        self.post(Event::Closed);
    }
}

/// Run one TURN client session until ctrl-c or until the server goes away.
///
/// The session connects, allocates a relayed address and, when a peer is
/// configured, makes it the active destination. Data received through the
/// relay is logged.
pub async fn startup(config: Config) -> anyhow::Result<()> {
    let profile = config.sip.profile()?;
    log::info!(
        "sip profile loaded: identity={}, contact={}",
        profile.identity.uri,
        profile.contact.uri
    );

    let (tx, mut rx) = unbounded_channel();
    let socket = config.turn.builder().build(Events(tx));

    if let (Some(username), Some(password)) = (&config.turn.username, &config.turn.password) {
        socket.set_username_and_password(username, password, config.turn.short_term);
    }

    socket.connect(&config.turn.server, config.turn.port);

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down, releasing the allocation");

                socket.close();
                break;
            }
        };

        match event {
            Some(Event::Connected(address)) => {
                log::info!("turn connected: server={address}");

                socket.create_allocation(AllocationProps {
                    lifetime: config.turn.lifetime,
                    ..Default::default()
                });
            }
            Some(Event::Allocated(info)) => {
                log::info!(
                    "turn allocated: relay={:?}, reflexive={:?}, lifetime={}",
                    info.relay,
                    info.reflexive,
                    info.lifetime
                );

                if let Some(peer) = config.turn.peer {
                    socket.set_active_destination(peer);
                }
            }
            Some(Event::Received(source, data)) => {
                log::info!("turn data received: source={source}, size={}", data.len());
            }
            Some(Event::Failed(operation, error)) => {
                socket.close();

                return Err(anyhow!("turn {operation} failed: {error}"));
            }
            Some(Event::Closed) | None => return Ok(()),
        }
    }

    // Never connected sockets close without a callback.
    let closed = async {
        while let Some(event) = rx.recv().await {
            if let Event::Closed = event {
                break;
            }
        }
    };

    if tokio::time::timeout(Duration::from_secs(10), closed).await.is_err() {
        log::warn!("turn socket did not close in time");
    }

    Ok(())
}
