use std::{future::pending, net::SocketAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use codec::{
    Attributes,
    channel_data::ChannelData,
    crypto::IntegrityKey,
    message::{Message, MessageEncoder, attributes::{error::ErrorType, *}, methods::*},
};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{Instant, sleep_until},
};

use crate::{
    Error, ErrorKind, SOFTWARE, TurnSocketOptions, UNSPECIFIED,
    channel::ChannelManager,
    handler::{AllocationInfo, TurnAsyncSocketHandler},
    request::{
        Credentials, Expiry, RequestAttribute, RequestEntry, RequestTable, StunRequest,
        UDP_MAX_SENDS, transaction_id,
    },
    transport::{Frame, Transport, TransportType},
};

/// Port parity asked of the server for the relayed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortProps {
    #[default]
    None,
    Even,
    /// Even port, and the next port reserved for a second allocation.
    EvenPair,
}

/// Parameters of an Allocate request.
///
/// `lifetime` and `bandwidth` left at [`UNSPECIFIED`] are not sent. When
/// `requested_transport` is `None` the relay uses UDP over a UDP transport
/// and TCP otherwise. A port parity request takes precedence over a
/// reservation token.
#[derive(Debug, Clone, Copy)]
pub struct AllocationProps {
    pub lifetime: u32,
    pub bandwidth: u32,
    pub port_props: PortProps,
    pub reservation_token: Option<u64>,
    pub requested_transport: Option<RequestedTransport>,
}

impl Default for AllocationProps {
    fn default() -> Self {
        Self {
            lifetime: UNSPECIFIED,
            bandwidth: UNSPECIFIED,
            port_props: PortProps::None,
            reservation_token: None,
            requested_transport: None,
        }
    }
}

enum Command {
    Connect {
        host: String,
        port: u16,
    },
    Close,
    SetUsernameAndPassword {
        username: String,
        password: String,
        short_term: bool,
    },
    SetLocalPassword(String),
    BindRequest,
    ConnectivityCheck {
        target: SocketAddr,
        priority: u32,
        controlling: bool,
        retransmits: u32,
    },
    RequestSharedSecret,
    CreateAllocation(AllocationProps),
    RefreshAllocation(u32),
    SetActiveDestination(SocketAddr),
    ClearActiveDestination,
    Send(Bytes),
    SendTo(SocketAddr, Bytes),
}

/// Asynchronous TURN client socket.
///
/// The handle only posts commands to the socket task, results arrive on the
/// [`TurnAsyncSocketHandler`]. Clones share the same task, which stops once
/// every handle is dropped.
///
/// ```no_run
/// use sipturn_client::{TurnAsyncSocket, TurnAsyncSocketHandler, AllocationProps};
///
/// struct Handler;
///
/// impl TurnAsyncSocketHandler for Handler {}
///
/// # async fn run() {
/// let socket = TurnAsyncSocket::new(Default::default(), Handler);
/// socket.set_username_and_password("user1", "test", false);
/// socket.connect("localhost", 3478);
/// socket.create_allocation(AllocationProps::default());
/// # }
/// ```
#[derive(Clone)]
pub struct TurnAsyncSocket {
    tx: UnboundedSender<Command>,
}

impl TurnAsyncSocket {
    /// Spawn the socket task on the current tokio runtime.
    pub fn new<H: TurnAsyncSocketHandler>(options: TurnSocketOptions, handler: H) -> Self {
        let (tx, rx) = unbounded_channel();
        tokio::spawn(Session::new(options, handler).run(rx));

        Self { tx }
    }

    fn post(&self, command: Command) {
        if self.tx.send(command).is_err() {
            log::warn!("turn socket task is gone, command dropped");
        }
    }

    pub fn connect(&self, host: &str, port: u16) {
        self.post(Command::Connect {
            host: host.to_string(),
            port,
        });
    }

    /// Close the transport. An allocation held over UDP is released first.
    pub fn close(&self) {
        self.post(Command::Close);
    }

    /// Short-term credentials take effect immediately. Long-term ones are
    /// used once the server has sent its realm and nonce.
    pub fn set_username_and_password(&self, username: &str, password: &str, short_term: bool) {
        self.post(Command::SetUsernameAndPassword {
            username: username.to_string(),
            password: password.to_string(),
            short_term,
        });
    }

    /// Password checked on incoming Binding requests carrying
    /// MESSAGE-INTEGRITY.
    pub fn set_local_password(&self, password: &str) {
        self.post(Command::SetLocalPassword(password.to_string()));
    }

    pub fn bind_request(&self) {
        self.post(Command::BindRequest);
    }

    /// Send a Binding request with the ICE attributes to `target` instead
    /// of the server, through the same local port.
    pub fn connectivity_check(&self, target: SocketAddr, priority: u32, controlling: bool, retransmits: u32) {
        self.post(Command::ConnectivityCheck {
            target,
            priority,
            controlling,
            retransmits,
        });
    }

    pub fn request_shared_secret(&self) {
        self.post(Command::RequestSharedSecret);
    }

    pub fn create_allocation(&self, props: AllocationProps) {
        self.post(Command::CreateAllocation(props));
    }

    pub fn refresh_allocation(&self, lifetime: u32) {
        self.post(Command::RefreshAllocation(lifetime));
    }

    pub fn destroy_allocation(&self) {
        self.post(Command::RefreshAllocation(0));
    }

    pub fn set_active_destination(&self, peer: SocketAddr) {
        self.post(Command::SetActiveDestination(peer));
    }

    pub fn clear_active_destination(&self) {
        self.post(Command::ClearActiveDestination);
    }

    /// Send to the active destination through the relay, or straight to
    /// the server when there is no allocation.
    pub fn send(&self, data: Bytes) {
        self.post(Command::Send(data));
    }

    pub fn send_to(&self, peer: SocketAddr, data: Bytes) {
        self.post(Command::SendTo(peer, data));
    }
}

struct Allocation {
    lifetime: u32,
    refresh_at: Instant,
}

impl Allocation {
    /// Refreshes go out at 5/8 of the granted lifetime.
    fn new(lifetime: u32) -> Self {
        Self {
            refresh_at: Instant::now() + Duration::from_secs(lifetime as u64 * 5 / 8),
            lifetime,
        }
    }
}

enum Event {
    Command(Option<Command>),
    Frame(Result<Frame, Error>),
    Timer,
}

/// State owned by the socket task.
struct Session<H> {
    options: TurnSocketOptions,
    handler: H,
    transport: Option<Transport>,
    requests: RequestTable,
    channels: ChannelManager,
    credentials: Credentials,
    local_key: Option<IntegrityKey>,
    allocation: Option<Allocation>,
    active_destination: Option<SocketAddr>,
    close_after_destroy: bool,
    tie_breaker: u64,
}

impl<H: TurnAsyncSocketHandler> Session<H> {
    fn new(options: TurnSocketOptions, handler: H) -> Self {
        Self {
            transport: None,
            requests: RequestTable::default(),
            channels: ChannelManager::default(),
            credentials: Credentials::default(),
            local_key: None,
            allocation: None,
            active_destination: None,
            close_after_destroy: false,
            tie_breaker: rand::random(),
            options,
            handler,
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            let event = tokio::select! {
                it = rx.recv() => Event::Command(it),
                it = recv(self.transport.as_mut()) => Event::Frame(it),
                _ = sleep(deadline) => Event::Timer,
            };

            match event {
                Event::Command(Some(command)) => self.on_command(command).await,
                Event::Command(None) => break,
                Event::Frame(Ok(frame)) => self.on_frame(frame).await,
                Event::Frame(Err(e)) if e.kind() == ErrorKind::FrameError && !self.is_reliable() => {
                    self.handler.on_receive_failure(ErrorKind::FrameError);
                }
                Event::Frame(Err(e)) => {
                    log::warn!("turn transport read failed: err={e}");

                    self.handler.on_receive_failure(e.kind());
                    self.actual_close();
                }
                Event::Timer => self.on_timer().await,
            }
        }

        log::info!("turn socket task stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.requests.next_deadline().map(Instant::from_std),
            self.allocation.as_ref().map(|it| it.refresh_at),
            self.channels.next_rebind().map(Instant::from_std),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn transport_kind(&self) -> Option<TransportType> {
        self.transport.as_ref().map(|it| it.kind())
    }

    fn server(&self) -> SocketAddr {
        self.transport
            .as_ref()
            .map(|it| it.connected_address())
            .unwrap_or(crate::DEFAULT_BIND)
    }

    fn is_reliable(&self) -> bool {
        self.transport_kind().is_some_and(|it| it.is_reliable())
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { host, port } => self.connect(&host, port).await,
            Command::Close => self.close().await,
            Command::SetUsernameAndPassword {
                username,
                password,
                short_term,
            } => {
                self.credentials = Credentials {
                    key: short_term.then(|| IntegrityKey::short_term(&password)),
                    username,
                    password,
                    ..Default::default()
                };
            }
            Command::SetLocalPassword(password) => {
                self.local_key = Some(IntegrityKey::short_term(&password));
            }
            Command::BindRequest => {
                if self.transport.is_none() {
                    self.handler.on_bind_failure(ErrorKind::NotConnected, self.server());
                    return;
                }

                self.send_request(StunRequest::new(BINDING_REQUEST), None, UDP_MAX_SENDS)
                    .await;
            }
            Command::ConnectivityCheck {
                target,
                priority,
                controlling,
                retransmits,
            } => {
                if self.transport.is_none() {
                    self.handler.on_bind_failure(ErrorKind::NotConnected, target);
                    return;
                }

                let request = StunRequest::new(BINDING_REQUEST)
                    .with(RequestAttribute::Priority(priority))
                    .with(if controlling {
                        RequestAttribute::IceControlling(self.tie_breaker)
                    } else {
                        RequestAttribute::IceControlled(self.tie_breaker)
                    });

                self.send_request(request, Some(target), retransmits).await;
            }
            Command::RequestSharedSecret => {
                if self.transport.is_none() {
                    self.handler.on_shared_secret_failure(ErrorKind::NotConnected);
                    return;
                }

                self.send_request(StunRequest::new(SHARED_SECRET_REQUEST), None, UDP_MAX_SENDS)
                    .await;
            }
            Command::CreateAllocation(props) => self.create_allocation(props).await,
            Command::RefreshAllocation(lifetime) => {
                if self.allocation.is_none() {
                    self.handler.on_refresh_failure(ErrorKind::NoAllocation);
                    return;
                }

                self.refresh_allocation(lifetime).await;
            }
            Command::SetActiveDestination(peer) => {
                if self.allocation.is_none() {
                    self.handler
                        .on_set_active_destination_failure(ErrorKind::NoAllocation);
                    return;
                }

                if !self.ensure_channel(peer).await {
                    self.handler
                        .on_set_active_destination_failure(ErrorKind::UnknownRemoteAddress);
                    return;
                }

                log::debug!("turn active destination set: peer={peer}");

                self.active_destination = Some(peer);
                self.handler.on_set_active_destination_success();
            }
            Command::ClearActiveDestination => {
                if self.allocation.is_none() {
                    self.handler
                        .on_clear_active_destination_failure(ErrorKind::NoAllocation);
                    return;
                }

                self.active_destination = None;
                self.handler.on_clear_active_destination_success();
            }
            Command::Send(data) => {
                if self.allocation.is_none() {
                    let server = self.server();
                    self.send_raw(data, server).await;
                    return;
                }

                match self.active_destination {
                    Some(peer) => self.relay(peer, data).await,
                    None => self.handler.on_send_failure(ErrorKind::NoActiveDestination),
                }
            }
            Command::SendTo(peer, data) => {
                if self.allocation.is_none() {
                    self.send_raw(data, peer).await;
                } else {
                    self.relay(peer, data).await;
                }
            }
        }
    }

    async fn connect(&mut self, host: &str, port: u16) {
        if self.transport.is_some() {
            log::warn!("turn socket reconnecting: host={host}, port={port}");

            self.reset();
            self.transport = None;
        }

        match Transport::connect(&self.options, host, port).await {
            Ok(transport) => {
                let connected = transport.connected_address();

                log::info!(
                    "turn socket connected: transport={:?}, local={}, server={connected}",
                    transport.kind(),
                    transport.local_address()
                );

                self.transport = Some(transport);
                self.handler.on_connect_success(connected);
            }
            Err(e) => {
                log::error!("turn socket connect failed: host={host}, port={port}, err={e}");

                self.handler.on_connect_failure(e.kind());
            }
        }
    }

    /// Over UDP the server keeps the allocation until it expires, so it is
    /// released before the socket closes. Closing a stream releases it.
    async fn close(&mut self) {
        if self.allocation.is_some() && self.transport_kind() == Some(TransportType::Udp) {
            self.close_after_destroy = true;
            self.refresh_allocation(0).await;
        } else {
            self.actual_close();
        }
    }

    fn reset(&mut self) {
        self.requests.clear();
        self.channels.clear();
        self.allocation = None;
        self.active_destination = None;
        self.close_after_destroy = false;
    }

    fn actual_close(&mut self) {
        self.reset();

        if self.transport.take().is_some() {
            log::info!("turn socket closed");

            self.handler.on_closed();
        }
    }

    fn drop_allocation(&mut self) {
        self.allocation = None;
        self.active_destination = None;
        self.channels.clear();
    }

    async fn create_allocation(&mut self, props: AllocationProps) {
        let Some(kind) = self.transport_kind() else {
            self.handler.on_allocation_failure(ErrorKind::NotConnected);
            return;
        };

        if self.allocation.is_some() {
            self.handler.on_allocation_failure(ErrorKind::AlreadyAllocated);
            return;
        }

        let requested = props.requested_transport.unwrap_or(if kind == TransportType::Udp {
            RequestedTransport::Udp
        } else {
            RequestedTransport::Tcp
        });

        if requested == RequestedTransport::Tcp && kind == TransportType::Udp {
            self.handler
                .on_allocation_failure(ErrorKind::InvalidRequestedTransport);
            return;
        }

        let mut request = StunRequest::new(ALLOCATE_REQUEST)
            .with(RequestAttribute::RequestedTransport(requested));

        if props.lifetime != UNSPECIFIED {
            request = request.with(RequestAttribute::Lifetime(props.lifetime));
        }

        if props.bandwidth != UNSPECIFIED {
            request = request.with(RequestAttribute::Bandwidth(props.bandwidth));
        }

        match (props.port_props, props.reservation_token) {
            (PortProps::Even, _) => request = request.with(RequestAttribute::EvenPort(false)),
            (PortProps::EvenPair, _) => request = request.with(RequestAttribute::EvenPort(true)),
            (PortProps::None, Some(token)) => {
                request = request.with(RequestAttribute::ReservationToken(token))
            }
            (PortProps::None, None) => (),
        }

        self.send_request(request, None, UDP_MAX_SENDS).await;
    }

    async fn refresh_allocation(&mut self, lifetime: u32) {
        let mut request = StunRequest::new(REFRESH_REQUEST);
        if lifetime != UNSPECIFIED {
            request = request.with(RequestAttribute::Lifetime(lifetime));
        }

        self.send_request(request, None, UDP_MAX_SENDS).await;
    }

    /// Lease a channel to `peer` and bind it when it is new or its last
    /// ChannelBind failed. `false` when every channel number is in use.
    async fn ensure_channel(&mut self, peer: SocketAddr) -> bool {
        let unbound = match self.channels.find_by_address(&peer) {
            Some(remote) => remote.is_unbound(),
            None => {
                if self.channels.create_channel_binding(peer).is_none() {
                    return false;
                }

                true
            }
        };

        if unbound {
            self.channel_binding(peer).await;
        }

        true
    }

    /// Send a ChannelBind for a peer already known to the channel manager.
    /// Reliable transports can use the channel right away.
    async fn channel_binding(&mut self, peer: SocketAddr) {
        let reliable = self.is_reliable();
        let refresh = self.options.channel_refresh;

        let Some(remote) = self.channels.find_by_address(&peer) else {
            return;
        };

        let channel = remote.channel();
        remote.set_bind_requested();
        if reliable {
            remote.confirm(clock(), refresh);
        }

        let request = StunRequest::new(CHANNEL_BIND_REQUEST)
            .with(RequestAttribute::ChannelNumber(channel))
            .with(RequestAttribute::XorPeerAddress(peer));

        self.send_request(request, None, UDP_MAX_SENDS).await;
    }

    async fn send_request(&mut self, request: StunRequest, target: Option<SocketAddr>, max_sends: u32) {
        self.send_request_with(request, target, max_sends, false).await;
    }

    async fn send_request_with(
        &mut self,
        request: StunRequest,
        target: Option<SocketAddr>,
        max_sends: u32,
        auth_retried: bool,
    ) {
        let token = transaction_id();
        let bytes = match request.encode(&token, Some(&self.credentials)) {
            Ok(it) => it,
            Err(e) => {
                log::error!("turn request encode failed: method={:?}, err={e}", request.method);

                self.on_request_failure(&request, target, ErrorKind::ErrorParsingMessage);
                return;
            }
        };

        let mut entry = RequestEntry::new(
            request,
            bytes.clone(),
            target,
            self.is_reliable(),
            max_sends,
            clock(),
        );

        entry.auth_retried = auth_retried;
        self.requests.insert(token, entry);
        self.write(&bytes, target).await;
    }

    /// Write one frame, a failure is reported and closes the socket.
    async fn write(&mut self, bytes: &[u8], target: Option<SocketAddr>) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            self.handler.on_send_failure(ErrorKind::NotConnected);
            return false;
        };

        let result = match target {
            Some(target) => transport.send_to(bytes, target).await,
            None => transport.send(bytes).await,
        };

        if let Err(e) = result {
            log::warn!("turn transport write failed: err={e}");

            self.handler.on_send_failure(ErrorKind::Io(e.kind()));
            self.actual_close();
            return false;
        }

        true
    }

    async fn send_raw(&mut self, data: Bytes, target: SocketAddr) {
        if self.write(&data, Some(target)).await {
            self.handler.on_send_success();
        }
    }

    /// Send application data to a peer through the relay: ChannelData once
    /// the channel is confirmed, a Send indication before that.
    async fn relay(&mut self, peer: SocketAddr, data: Bytes) {
        if !self.ensure_channel(peer).await {
            log::error!("turn channel numbers exhausted: peer={peer}");

            self.handler.on_send_failure(ErrorKind::UnknownRemoteAddress);
            return;
        }

        let Some((confirmed, channel)) = self
            .channels
            .find_by_address(&peer)
            .map(|it| (it.is_confirmed(), it.channel()))
        else {
            return;
        };

        let bytes = if confirmed {
            let mut bytes = BytesMut::with_capacity(data.len() + 8);
            ChannelData {
                bytes: &data,
                number: channel,
            }
            .encode(&mut bytes, self.is_reliable());

            bytes.freeze()
        } else {
            let mut indication = StunRequest::new(SEND_INDICATION)
                .with(RequestAttribute::XorPeerAddress(peer));

            if !data.is_empty() {
                indication = indication.with(RequestAttribute::Data(data));
            }

            match indication.encode(&transaction_id(), None) {
                Ok(it) => it,
                Err(e) => {
                    log::error!("turn send indication encode failed: peer={peer}, err={e}");

                    self.handler.on_send_failure(ErrorKind::ErrorParsingMessage);
                    return;
                }
            }
        };

        if self.write(&bytes, None).await {
            self.handler.on_send_success();
        }
    }

    async fn on_timer(&mut self) {
        let now = clock();

        for token in self.requests.expired(now) {
            let Some(entry) = self.requests.get_mut(&token) else {
                continue;
            };

            match entry.on_expired(now) {
                Expiry::Retransmit => {
                    log::debug!(
                        "turn request retransmit: method={:?}, sent={}",
                        entry.request.method,
                        entry.requests_sent()
                    );

                    let (bytes, target) = (entry.bytes.clone(), entry.target);
                    if !self.write(&bytes, target).await {
                        return;
                    }
                }
                Expiry::Timeout => {
                    if let Some(entry) = self.requests.remove(&token) {
                        log::warn!("turn request timeout: method={:?}", entry.request.method);

                        self.on_request_failure(&entry.request, entry.target, ErrorKind::ResponseTimeout);
                    }
                }
            }
        }

        let lifetime = self
            .allocation
            .as_ref()
            .filter(|it| it.refresh_at <= Instant::from_std(now))
            .map(|it| it.lifetime);

        if let Some(lifetime) = lifetime {
            if let Some(allocation) = self.allocation.as_mut() {
                allocation.refresh_at = Instant::now() + Duration::from_secs(lifetime as u64);
            }

            self.refresh_allocation(lifetime).await;
        }

        for peer in self.channels.take_due_rebinds(now) {
            self.channel_binding(peer).await;
        }
    }

    /// Report a failed or timed out request on the callback of its method.
    fn on_request_failure(&mut self, request: &StunRequest, target: Option<SocketAddr>, error: ErrorKind) {
        match request.method {
            Method::Binding(_) => {
                let server = target.unwrap_or_else(|| self.server());
                self.handler.on_bind_failure(error, server);
            }
            Method::SharedSecret(_) => self.handler.on_shared_secret_failure(error),
            Method::Allocate(_) => self.handler.on_allocation_failure(error),
            Method::Refresh(_) => {
                self.handler.on_refresh_failure(error);

                if self.close_after_destroy {
                    self.actual_close();
                } else if error == ErrorKind::Stun(437) {
                    self.drop_allocation();
                }
            }
            Method::ChannelBind(_) => {
                if let Some(peer) = request.get_peer() {
                    if let Some(remote) = self.channels.find_by_address(&peer) {
                        remote.unbind();
                    }

                    self.handler.on_channel_bind_failure(error, peer);
                }
            }
            _ => (),
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        if frame.bytes.len() <= 4 {
            self.handler.on_receive_failure(ErrorKind::FrameError);
            return;
        }

        if frame.bytes[0] >> 6 == 0 {
            let mut attributes = Attributes::default();
            match Message::decode(&frame.bytes, &mut attributes) {
                Ok(message) => self.on_message(&message, &frame).await,
                Err(e) => {
                    log::debug!("turn received data is not stun: source={}, err={e}", frame.source);

                    self.handler
                        .on_receive_success(frame.source, frame.bytes.clone());
                }
            }

            return;
        }

        if self.allocation.is_none() {
            self.handler.on_receive_success(frame.source, frame.bytes);
            return;
        }

        let data = match ChannelData::decode(&frame.bytes) {
            Ok(it) => it,
            Err(_) => {
                log::warn!(
                    "turn channel data shorter than declared: size={}, source={}",
                    frame.bytes.len(),
                    frame.source
                );

                return;
            }
        };

        match self.channels.find_by_channel(data.number()) {
            Some(peer) => {
                let source = peer.address();
                self.handler
                    .on_receive_success(source, frame.bytes.slice_ref(data.as_bytes()));
            }
            None => {
                log::warn!("turn channel data on unknown channel: channel={}", data.number());
            }
        }
    }

    async fn on_message(&mut self, message: &Message<'_>, frame: &Frame) {
        let method = message.method();

        if method.is_request() {
            self.on_incoming_request(message, frame.source).await;
        } else if method.is_indication() {
            if method != DATA_INDICATION {
                return;
            }

            if !message.unknown_required().is_empty() {
                log::warn!("turn data indication with unknown required attributes dropped");
                return;
            }

            let (Some(peer), Some(data)) = (message.get::<XorPeerAddress>(), message.get::<Data>())
            else {
                log::warn!("turn data indication missing attributes: source={}", frame.source);
                return;
            };

            if self.channels.find_by_address(&peer).is_none() {
                log::warn!("turn data from unknown peer discarded: peer={peer}");
                return;
            }

            self.handler
                .on_receive_success(peer, frame.bytes.slice_ref(data));
        } else {
            self.on_response(message, frame.source).await;
        }
    }

    async fn on_incoming_request(&mut self, message: &Message<'_>, source: SocketAddr) {
        let token = message.transaction_id();
        let mut bytes = BytesMut::with_capacity(256);

        if message.method() != BINDING_REQUEST {
            let Some(method) = message.method().error() else {
                return;
            };

            let mut response = MessageEncoder::new(method, &token, &mut bytes);
            response.append::<ErrorCode>(ErrorCode::new(400, "Invalid Request Method"));
            response.append::<Software>(SOFTWARE);
            if response.flush(None).is_ok() {
                self.write(&bytes, Some(source)).await;
            }

            return;
        }

        if !message.unknown_required().is_empty() {
            let mut response = MessageEncoder::new(BINDING_ERROR, &token, &mut bytes);
            response.append::<ErrorCode>(ErrorCode::from(ErrorType::UnknownAttribute));
            response.append::<UnknownAttributes>(message.unknown_required().to_vec());
            response.append::<Software>(SOFTWARE);
            if response.flush(None).is_ok() {
                self.write(&bytes, Some(source)).await;
            }

            return;
        }

        let key = if message.has_integrity() {
            if let Some(key) = &self.local_key {
                if message.checksum(key).is_err() {
                    log::warn!("turn binding request with bad integrity dropped: source={source}");
                    return;
                }
            }

            self.local_key.as_ref()
        } else {
            None
        };

        {
            let mut response = MessageEncoder::new(BINDING_RESPONSE, &token, &mut bytes);
            response.append::<XorMappedAddress>(source);
            response.append::<Software>(SOFTWARE);
            if let Err(e) = response.flush(key) {
                log::error!("turn binding response encode failed: err={e}");
                return;
            }
        }

        if self.write(&bytes, Some(source)).await {
            self.handler.on_incoming_bind_request_processed(source);
        }
    }

    async fn on_response(&mut self, message: &Message<'_>, source: SocketAddr) {
        if !message.unknown_required().is_empty() {
            log::warn!(
                "turn response with unknown required attributes dropped: attributes={:?}",
                message.unknown_required()
            );

            return;
        }

        let token = message.transaction_id();
        if self.requests.get(&token).is_none() {
            log::warn!("turn stray response: token={token:?}, source={source}");
            return;
        }

        if message.has_integrity() {
            if let Some(key) = &self.credentials.key {
                if message.checksum(key).is_err() {
                    log::warn!("turn response integrity check failed: source={source}");
                    return;
                }
            }
        }

        let Some(entry) = self.requests.remove(&token) else {
            return;
        };

        if message.method().is_error() {
            let Some(error) = message.get::<ErrorCode>() else {
                self.on_request_failure(&entry.request, entry.target, ErrorKind::MissingAttributes);
                return;
            };

            let status = error.status();
            let challenged = (status == 401 && self.credentials.key.is_none()) || status == 438;
            if challenged && !entry.auth_retried && !self.credentials.username.is_empty() {
                if let (Some(realm), Some(nonce)) = (message.get::<Realm>(), message.get::<Nonce>()) {
                    log::debug!("turn request challenged: status={status}, realm={realm}");

                    self.credentials.challenge(realm, nonce);
                    let max_sends = entry.max_sends();
                    self.send_request_with(entry.request, entry.target, max_sends, true)
                        .await;

                    return;
                }
            }

            log::warn!(
                "turn error response: method={:?}, status={status}, reason={}",
                entry.request.method,
                error.message
            );

            self.on_request_failure(&entry.request, entry.target, ErrorKind::Stun(status));
            return;
        }

        match entry.request.method {
            Method::Binding(_) => {
                match message
                    .get::<XorMappedAddress>()
                    .or_else(|| message.get::<MappedAddress>())
                {
                    Some(reflexive) => self.handler.on_bind_success(reflexive, source),
                    None => self.handler.on_bind_failure(ErrorKind::MissingAttributes, source),
                }
            }
            Method::SharedSecret(_) => {
                match (message.get::<UserName>(), message.get::<Password>()) {
                    (Some(username), Some(password)) => {
                        self.handler.on_shared_secret_success(username, password)
                    }
                    _ => self
                        .handler
                        .on_shared_secret_failure(ErrorKind::MissingAttributes),
                }
            }
            Method::Allocate(_) => {
                let lifetime = message.get::<Lifetime>().unwrap_or(0);
                if lifetime == 0 {
                    self.handler.on_allocation_failure(ErrorKind::MissingAttributes);
                    return;
                }

                self.allocation = Some(Allocation::new(lifetime));
                self.handler.on_allocation_success(AllocationInfo {
                    reflexive: message.get::<XorMappedAddress>(),
                    relay: message.get::<XorRelayedAddress>(),
                    bandwidth: message.get::<Bandwidth>().unwrap_or(0),
                    reservation_token: message.get::<ReservationToken>().unwrap_or(0),
                    lifetime,
                });
            }
            Method::Refresh(_) => {
                let lifetime = message.get::<Lifetime>().unwrap_or(0);
                if lifetime == 0 {
                    self.drop_allocation();
                } else {
                    self.allocation = Some(Allocation::new(lifetime));
                }

                self.handler.on_refresh_success(lifetime);

                if self.close_after_destroy {
                    self.actual_close();
                }
            }
            Method::ChannelBind(_) => {
                let Some(channel) = entry.request.get_channel() else {
                    return;
                };

                let refresh = self.options.channel_refresh;
                match self.channels.find_by_channel(channel) {
                    Some(peer) => {
                        peer.confirm(clock(), refresh);

                        let address = peer.address();
                        log::debug!("turn channel bound: channel={channel}, peer={address}");

                        self.handler.on_channel_bind_success(channel, address);
                    }
                    None => {
                        log::warn!("turn channel bind response for unknown channel: channel={channel}");
                    }
                }
            }
            _ => (),
        }
    }
}

async fn recv(transport: Option<&mut Transport>) -> Result<Frame, Error> {
    match transport {
        Some(it) => it.recv().await,
        None => pending().await,
    }
}

/// Tokio's clock, in the std type of the request and channel schedules.
fn clock() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep(deadline: Option<Instant>) {
    match deadline {
        Some(it) => sleep_until(it).await,
        None => pending().await,
    }
}
