//! Blocking TURN client.
//!
//! [`TurnSocket`] speaks the same protocol as [`crate::TurnAsyncSocket`]
//! without a runtime: every call runs one transaction to completion on the
//! calling thread while holding the socket lock. Allocation and channel
//! refreshes are not timer driven, they are checked on every receive.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use codec::{
    Attributes,
    channel_data::ChannelData,
    crypto::IntegrityKey,
    message::{Message, MessageEncoder, attributes::{error::ErrorType, *}, methods::*},
};
use parking_lot::Mutex;

use crate::{
    AllocationProps, Error, ErrorKind, SOFTWARE, TurnSocketOptions, UNSPECIFIED,
    channel::ChannelManager,
    handler::AllocationInfo,
    request::{
        Credentials, RELIABLE_TIMEOUT, RequestAttribute, StunRequest, UDP_FINAL_WAIT,
        UDP_MAX_SENDS, UDP_RTO, transaction_id,
    },
    socket::PortProps,
    transport::{BlockingTransport, Frame, TransportType},
};

/// Blocking TURN client socket.
///
/// ```no_run
/// use std::time::Duration;
///
/// use sipturn_client::{AllocationProps, TurnSocketOptions, sync::TurnSocket};
///
/// let socket = TurnSocket::connect(TurnSocketOptions::default(), "localhost", 3478).unwrap();
/// socket.set_username_and_password("user1", "test", false);
///
/// let allocation = socket.create_allocation(AllocationProps::default()).unwrap();
/// socket.set_active_destination("10.0.0.1:5000".parse().unwrap()).unwrap();
/// socket.send(b"hello").unwrap();
///
/// let mut buffer = [0u8; 1500];
/// let (size, source) = socket.receive(&mut buffer, Duration::from_secs(1)).unwrap();
/// # let _ = (allocation, size, source);
/// ```
pub struct TurnSocket(Mutex<Inner>);

impl TurnSocket {
    pub fn connect(options: TurnSocketOptions, host: &str, port: u16) -> Result<Self, Error> {
        let transport = BlockingTransport::connect(&options, host, port)?;

        log::info!(
            "turn socket connected: transport={:?}, server={}",
            transport.kind(),
            transport.connected_address()
        );

        Ok(Self(Mutex::new(Inner {
            channels: ChannelManager::default(),
            credentials: Credentials::default(),
            local_key: None,
            allocation: None,
            active_destination: None,
            transport,
            options,
        })))
    }

    pub fn set_username_and_password(&self, username: &str, password: &str, short_term: bool) {
        self.0.lock().credentials = Credentials {
            key: short_term.then(|| IntegrityKey::short_term(password)),
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        };
    }

    pub fn set_local_password(&self, password: &str) {
        self.0.lock().local_key = Some(IntegrityKey::short_term(password));
    }

    pub fn connected_address(&self) -> SocketAddr {
        self.0.lock().transport.connected_address()
    }

    /// Returns the username and password handed out by the server.
    pub fn request_shared_secret(&self) -> Result<(String, String), Error> {
        let mut inner = self.0.lock();
        let response = inner.transact(StunRequest::new(SHARED_SECRET_REQUEST))?;
        let mut attributes = Attributes::default();
        let message = success(&response, &mut attributes)?;

        match (message.get::<UserName>(), message.get::<Password>()) {
            (Some(username), Some(password)) => Ok((username.to_string(), password.to_string())),
            _ => Err(ErrorKind::MissingAttributes.into()),
        }
    }

    /// Returns the reflexive address.
    pub fn bind_request(&self) -> Result<SocketAddr, Error> {
        let mut inner = self.0.lock();
        let response = inner.transact(StunRequest::new(BINDING_REQUEST))?;
        let mut attributes = Attributes::default();
        let message = success(&response, &mut attributes)?;

        message
            .get::<XorMappedAddress>()
            .or_else(|| message.get::<MappedAddress>())
            .ok_or(ErrorKind::MissingAttributes.into())
    }

    pub fn create_allocation(&self, props: AllocationProps) -> Result<AllocationInfo, Error> {
        self.0.lock().create_allocation(props)
    }

    /// Returns the granted lifetime, zero when the allocation was released.
    pub fn refresh_allocation(&self, lifetime: u32) -> Result<u32, Error> {
        self.0.lock().refresh_allocation(lifetime)
    }

    pub fn destroy_allocation(&self) -> Result<(), Error> {
        self.0.lock().refresh_allocation(0).map(|_| ())
    }

    pub fn set_active_destination(&self, peer: SocketAddr) -> Result<(), Error> {
        let mut inner = self.0.lock();
        if inner.allocation.is_none() {
            return Err(ErrorKind::NoAllocation.into());
        }

        inner.ensure_channel(peer)?;
        inner.active_destination = Some(peer);
        Ok(())
    }

    pub fn clear_active_destination(&self) -> Result<(), Error> {
        let mut inner = self.0.lock();
        if inner.allocation.is_none() {
            return Err(ErrorKind::NoAllocation.into());
        }

        inner.active_destination = None;
        Ok(())
    }

    /// Send to the active destination, or straight to the server when there
    /// is no allocation.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.0.lock();
        if inner.allocation.is_none() {
            return Ok(inner.transport.send(data)?);
        }

        let peer = inner
            .active_destination
            .ok_or(Error::Kind(ErrorKind::NoActiveDestination))?;

        inner.relay(peer, data)
    }

    pub fn send_to(&self, peer: SocketAddr, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.0.lock();
        if inner.allocation.is_none() {
            return Ok(inner.transport.send_to(data, peer)?);
        }

        inner.relay(peer, data)
    }

    /// Wait for application data, copied into `buffer`. Returns its size and
    /// the peer it came from.
    pub fn receive(&self, buffer: &mut [u8], timeout: Duration) -> Result<(usize, SocketAddr), Error> {
        self.0.lock().receive(buffer, timeout, None)
    }

    /// Like [`TurnSocket::receive`], data from other sources is discarded.
    pub fn receive_from(
        &self,
        peer: SocketAddr,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.0
            .lock()
            .receive(buffer, timeout, Some(peer))
            .map(|(size, _)| size)
    }
}

struct Inner {
    options: TurnSocketOptions,
    transport: BlockingTransport,
    channels: ChannelManager,
    credentials: Credentials,
    local_key: Option<IntegrityKey>,
    /// Granted lifetime and when to refresh it.
    allocation: Option<(u32, Instant)>,
    active_destination: Option<SocketAddr>,
}

impl Inner {
    fn is_reliable(&self) -> bool {
        self.transport.kind().is_reliable()
    }

    /// Run one transaction and return the raw response. A challenge is
    /// answered once with a new transaction.
    fn transact(&mut self, request: StunRequest) -> Result<Bytes, Error> {
        let mut auth_retried = false;

        loop {
            let token = transaction_id();
            let bytes = request.encode(&token, Some(&self.credentials))?;
            let response = self.send_request_and_get_response(&token, &bytes)?;

            let mut attributes = Attributes::default();
            let message = Message::decode(&response, &mut attributes)?;

            if !message.unknown_required().is_empty() {
                return Err(ErrorKind::UnknownRequiredAttributes.into());
            }

            if message.has_integrity() {
                if let Some(key) = &self.credentials.key {
                    if message.checksum(key).is_err() {
                        return Err(ErrorKind::BadMessageIntegrity.into());
                    }
                }
            }

            if message.method().is_error() && !auth_retried {
                let status = message.get::<ErrorCode>().map(|it| it.status()).unwrap_or(0);
                let challenged = (status == 401 && self.credentials.key.is_none()) || status == 438;

                if challenged && !self.credentials.username.is_empty() {
                    if let (Some(realm), Some(nonce)) = (message.get::<Realm>(), message.get::<Nonce>()) {
                        log::debug!("turn request challenged: status={status}, realm={realm}");

                        self.credentials.challenge(realm, nonce);
                        auth_retried = true;
                        continue;
                    }
                }
            }

            return Ok(response);
        }
    }

    /// Write the request and read until the matching response arrives.
    /// Frames with other transaction ids are skipped.
    fn send_request_and_get_response(&mut self, token: &[u8; 12], bytes: &[u8]) -> Result<Bytes, Error> {
        let (mut timeout, max_sends) = if self.is_reliable() {
            (RELIABLE_TIMEOUT, 1)
        } else {
            (UDP_RTO, UDP_MAX_SENDS)
        };

        for sent in 1..=max_sends {
            self.transport.send(bytes)?;

            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                let frame = match self.transport.recv(remaining) {
                    Ok(it) => it,
                    Err(Error::Kind(ErrorKind::ReadTimeout)) => break,
                    Err(Error::Kind(ErrorKind::FrameError)) if !self.is_reliable() => continue,
                    Err(e) => return Err(e),
                };

                if frame.bytes.len() >= 20 && frame.bytes[0] >> 6 == 0 && frame.bytes[8..20] == token[..] {
                    return Ok(frame.bytes);
                }

                log::debug!(
                    "turn frame skipped while waiting for response: size={}, source={}",
                    frame.bytes.len(),
                    frame.source
                );
            }

            timeout = if sent + 1 == max_sends {
                UDP_FINAL_WAIT
            } else {
                timeout * 2
            };
        }

        Err(ErrorKind::ResponseTimeout.into())
    }

    fn create_allocation(&mut self, props: AllocationProps) -> Result<AllocationInfo, Error> {
        if self.allocation.is_some() {
            return Err(ErrorKind::AlreadyAllocated.into());
        }

        let kind = self.transport.kind();
        let requested = props.requested_transport.unwrap_or(if kind == TransportType::Udp {
            RequestedTransport::Udp
        } else {
            RequestedTransport::Tcp
        });

        if requested == RequestedTransport::Tcp && kind == TransportType::Udp {
            return Err(ErrorKind::InvalidRequestedTransport.into());
        }

        let mut request = StunRequest::new(ALLOCATE_REQUEST)
            .with(RequestAttribute::RequestedTransport(requested));

        if props.lifetime != UNSPECIFIED {
            request = request.with(RequestAttribute::Lifetime(props.lifetime));
        }

        if props.bandwidth != UNSPECIFIED {
            request = request.with(RequestAttribute::Bandwidth(props.bandwidth));
        }

        request = match (props.port_props, props.reservation_token) {
            (PortProps::Even, _) => request.with(RequestAttribute::EvenPort(false)),
            (PortProps::EvenPair, _) => request.with(RequestAttribute::EvenPort(true)),
            (PortProps::None, Some(token)) => request.with(RequestAttribute::ReservationToken(token)),
            (PortProps::None, None) => request,
        };

        let response = self.transact(request)?;
        let mut attributes = Attributes::default();
        let message = success(&response, &mut attributes)?;

        let lifetime = message.get::<Lifetime>().unwrap_or(0);
        if lifetime == 0 {
            return Err(ErrorKind::MissingAttributes.into());
        }

        self.allocation = Some((lifetime, refresh_at(lifetime)));

        Ok(AllocationInfo {
            reflexive: message.get::<XorMappedAddress>(),
            relay: message.get::<XorRelayedAddress>(),
            bandwidth: message.get::<Bandwidth>().unwrap_or(0),
            reservation_token: message.get::<ReservationToken>().unwrap_or(0),
            lifetime,
        })
    }

    fn refresh_allocation(&mut self, lifetime: u32) -> Result<u32, Error> {
        if self.allocation.is_none() {
            return Err(ErrorKind::NoAllocation.into());
        }

        let mut request = StunRequest::new(REFRESH_REQUEST);
        if lifetime != UNSPECIFIED {
            request = request.with(RequestAttribute::Lifetime(lifetime));
        }

        let response = self.transact(request)?;
        let mut attributes = Attributes::default();
        let message = match success(&response, &mut attributes) {
            Ok(it) => it,
            Err(e) => {
                if matches!(e, Error::Kind(ErrorKind::Stun(437))) {
                    self.drop_allocation();
                }

                return Err(e);
            }
        };

        let granted = message.get::<Lifetime>().unwrap_or(0);
        if granted == 0 {
            self.drop_allocation();
        } else {
            self.allocation = Some((granted, refresh_at(granted)));
        }

        Ok(granted)
    }

    fn drop_allocation(&mut self) {
        self.allocation = None;
        self.active_destination = None;
        self.channels.clear();
    }

    /// Lease a channel to `peer` and bind it when it is new.
    fn ensure_channel(&mut self, peer: SocketAddr) -> Result<(), Error> {
        let unbound = match self.channels.find_by_address(&peer) {
            Some(remote) => remote.is_unbound(),
            None => {
                if self.channels.create_channel_binding(peer).is_none() {
                    return Err(ErrorKind::UnknownRemoteAddress.into());
                }

                true
            }
        };

        if unbound {
            self.channel_bind(peer)?;
        }

        Ok(())
    }

    fn channel_bind(&mut self, peer: SocketAddr) -> Result<(), Error> {
        let reliable = self.is_reliable();
        let refresh = self.options.channel_refresh;

        let channel = match self.channels.find_by_address(&peer) {
            Some(remote) => {
                remote.set_bind_requested();
                if reliable {
                    remote.confirm(Instant::now(), refresh);
                }

                remote.channel()
            }
            None => return Err(ErrorKind::UnknownRemoteAddress.into()),
        };

        let request = StunRequest::new(CHANNEL_BIND_REQUEST)
            .with(RequestAttribute::ChannelNumber(channel))
            .with(RequestAttribute::XorPeerAddress(peer));

        let result = self.transact(request).and_then(|response| {
            let mut attributes = Attributes::default();
            success(&response, &mut attributes).map(|_| ())
        });

        let Some(remote) = self.channels.find_by_channel(channel) else {
            return result;
        };

        match result {
            Ok(()) => remote.confirm(Instant::now(), refresh),
            Err(e) => {
                remote.unbind();
                return Err(e);
            }
        }

        log::debug!("turn channel bound: channel={channel}, peer={peer}");

        Ok(())
    }

    fn relay(&mut self, peer: SocketAddr, data: &[u8]) -> Result<(), Error> {
        self.ensure_channel(peer)?;

        let (confirmed, channel) = self
            .channels
            .find_by_address(&peer)
            .map(|it| (it.is_confirmed(), it.channel()))
            .ok_or(Error::Kind(ErrorKind::UnknownRemoteAddress))?;

        if confirmed {
            let mut bytes = BytesMut::with_capacity(data.len() + 8);
            ChannelData {
                bytes: data,
                number: channel,
            }
            .encode(&mut bytes, self.is_reliable());

            return Ok(self.transport.send(&bytes)?);
        }

        let mut indication = StunRequest::new(SEND_INDICATION)
            .with(RequestAttribute::XorPeerAddress(peer));

        if !data.is_empty() {
            indication = indication.with(RequestAttribute::Data(Bytes::copy_from_slice(data)));
        }

        let bytes = indication.encode(&transaction_id(), None)?;
        Ok(self.transport.send(&bytes)?)
    }

    /// Allocation and channel refreshes that fell due.
    fn refresh_due(&mut self) {
        let now = Instant::now();

        if let Some((lifetime, at)) = self.allocation {
            if at <= now {
                self.allocation = Some((lifetime, now + Duration::from_secs(lifetime as u64)));

                if let Err(e) = self.refresh_allocation(lifetime) {
                    log::warn!("turn allocation refresh failed: err={e}");
                }
            }
        }

        for peer in self.channels.take_due_rebinds(now) {
            if let Err(e) = self.channel_bind(peer) {
                log::warn!("turn channel refresh failed: peer={peer}, err={e}");
            }
        }
    }

    fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
        from: Option<SocketAddr>,
    ) -> Result<(usize, SocketAddr), Error> {
        let deadline = Instant::now() + timeout;

        loop {
            self.refresh_due();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ErrorKind::ReadTimeout.into());
            }

            let frame = self.transport.recv(remaining)?;
            let Some((source, data)) = self.on_frame(frame)? else {
                continue;
            };

            if from.is_some_and(|it| it != source) {
                log::debug!("turn data from other source discarded: source={source}");
                continue;
            }

            if data.len() > buffer.len() {
                return Err(ErrorKind::BufferTooSmall.into());
            }

            buffer[..data.len()].copy_from_slice(&data);
            return Ok((data.len(), source));
        }
    }

    /// Application data carried by a frame, `None` for frames consumed by
    /// the protocol.
    fn on_frame(&mut self, frame: Frame) -> Result<Option<(SocketAddr, Bytes)>, Error> {
        if frame.bytes.len() <= 4 {
            return Err(ErrorKind::ReadError.into());
        }

        if frame.bytes[0] >> 6 == 0 {
            let mut attributes = Attributes::default();
            let message = match Message::decode(&frame.bytes, &mut attributes) {
                Ok(it) => it,
                Err(_) => return Ok(Some((frame.source, frame.bytes.clone()))),
            };

            let method = message.method();
            if method == BINDING_REQUEST {
                self.answer_binding(&message, frame.source)?;
                return Ok(None);
            }

            if method != DATA_INDICATION {
                if method.is_response() {
                    log::warn!("turn stray response: source={}", frame.source);
                }

                return Ok(None);
            }

            if !message.unknown_required().is_empty() {
                return Ok(None);
            }

            let (Some(peer), Some(data)) = (message.get::<XorPeerAddress>(), message.get::<Data>())
            else {
                return Ok(None);
            };

            if self.channels.find_by_address(&peer).is_none() {
                log::warn!("turn data from unknown peer discarded: peer={peer}");
                return Ok(None);
            }

            return Ok(Some((peer, frame.bytes.slice_ref(data))));
        }

        if self.allocation.is_none() {
            return Ok(Some((frame.source, frame.bytes)));
        }

        let data = ChannelData::decode(&frame.bytes).map_err(|_| Error::Kind(ErrorKind::ReadError))?;
        let peer = self
            .channels
            .find_by_channel(data.number())
            .map(|it| it.address())
            .ok_or(Error::Kind(ErrorKind::InvalidChannelNumberReceived))?;

        Ok(Some((peer, frame.bytes.slice_ref(data.as_bytes()))))
    }

    fn answer_binding(&mut self, message: &Message<'_>, source: SocketAddr) -> Result<(), Error> {
        let token = message.transaction_id();
        let mut bytes = BytesMut::with_capacity(256);

        if !message.unknown_required().is_empty() {
            let mut response = MessageEncoder::new(BINDING_ERROR, &token, &mut bytes);
            response.append::<ErrorCode>(ErrorCode::from(ErrorType::UnknownAttribute));
            response.append::<UnknownAttributes>(message.unknown_required().to_vec());
            response.append::<Software>(SOFTWARE);
            response.flush(None)?;
        } else {
            let key = match (message.has_integrity(), &self.local_key) {
                (true, Some(key)) => {
                    if message.checksum(key).is_err() {
                        log::warn!("turn binding request with bad integrity dropped: source={source}");
                        return Ok(());
                    }

                    Some(key)
                }
                _ => None,
            };

            let mut response = MessageEncoder::new(BINDING_RESPONSE, &token, &mut bytes);
            response.append::<XorMappedAddress>(source);
            response.append::<Software>(SOFTWARE);
            response.flush(key)?;
        }

        Ok(self.transport.send_to(&bytes, source)?)
    }
}

fn refresh_at(lifetime: u32) -> Instant {
    Instant::now() + Duration::from_secs(lifetime as u64 * 5 / 8)
}

/// Decode a response, error responses become [`ErrorKind::Stun`].
fn success<'a>(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Message<'a>, Error> {
    let message = Message::decode(bytes, attributes)?;
    if message.method().is_error() {
        return Err(match message.get::<ErrorCode>() {
            Some(error) => ErrorKind::Stun(error.status()).into(),
            None => ErrorKind::MissingAttributes.into(),
        });
    }

    Ok(message)
}
