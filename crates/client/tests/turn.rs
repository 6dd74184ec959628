use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use codec::{
    Attributes,
    channel_data::ChannelData,
    crypto::IntegrityKey,
    message::{Message, MessageEncoder, attributes::*, methods::*},
};
use sipturn_client::{
    AllocationInfo, AllocationProps, ErrorKind, TransportType, TurnAsyncSocket,
    TurnAsyncSocketHandler, TurnSocketOptions,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{Instant, timeout},
};

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Connected,
    Bound(SocketAddr),
    Allocated(AllocationInfo),
    AllocationFailed(ErrorKind),
    Refreshed(u32),
    RefreshFailed(ErrorKind),
    ActiveDestinationSet,
    ActiveDestinationFailed(ErrorKind),
    ChannelBound(u16, SocketAddr),
    ChannelBindFailed(ErrorKind, SocketAddr),
    Sent,
    Received(SocketAddr, Bytes),
    ReceiveFailed(ErrorKind),
    IncomingBind(SocketAddr),
    Closed,
}

struct Recorder(UnboundedSender<Event>);

impl Recorder {
    fn new() -> (Self, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }

    fn push(&self, event: Event) {
        let _ = self.0.send(event);
    }
}

impl TurnAsyncSocketHandler for Recorder {
    fn on_connect_success(&self, _: SocketAddr) {
        self.push(Event::Connected);
    }

    fn on_bind_success(&self, reflexive: SocketAddr, _: SocketAddr) {
        self.push(Event::Bound(reflexive));
    }

    fn on_allocation_success(&self, info: AllocationInfo) {
        self.push(Event::Allocated(info));
    }

    fn on_allocation_failure(&self, error: ErrorKind) {
        self.push(Event::AllocationFailed(error));
    }

    fn on_refresh_success(&self, lifetime: u32) {
        self.push(Event::Refreshed(lifetime));
    }

    fn on_refresh_failure(&self, error: ErrorKind) {
        self.push(Event::RefreshFailed(error));
    }

    fn on_set_active_destination_success(&self) {
        self.push(Event::ActiveDestinationSet);
    }

    fn on_set_active_destination_failure(&self, error: ErrorKind) {
        self.push(Event::ActiveDestinationFailed(error));
    }

    fn on_channel_bind_success(&self, channel: u16, peer: SocketAddr) {
        self.push(Event::ChannelBound(channel, peer));
    }

    fn on_channel_bind_failure(&self, error: ErrorKind, peer: SocketAddr) {
        self.push(Event::ChannelBindFailed(error, peer));
    }

    fn on_send_success(&self) {
        self.push(Event::Sent);
    }

    fn on_receive_success(&self, source: SocketAddr, data: Bytes) {
        self.push(Event::Received(source, data));
    }

    fn on_receive_failure(&self, error: ErrorKind) {
        self.push(Event::ReceiveFailed(error));
    }

    fn on_incoming_bind_request_processed(&self, source: SocketAddr) {
        self.push(Event::IncomingBind(source));
    }

    fn on_closed(&self) {
        self.push(Event::Closed);
    }
}

async fn next(events: &mut UnboundedReceiver<Event>) -> Result<Event> {
    next_within(events, Duration::from_secs(5)).await
}

async fn next_within(events: &mut UnboundedReceiver<Event>, limit: Duration) -> Result<Event> {
    timeout(limit, events.recv())
        .await?
        .ok_or_else(|| anyhow!("socket task stopped"))
}

fn key() -> IntegrityKey {
    IntegrityKey::long_term("user1", "test", "localhost")
}

fn peer() -> SocketAddr {
    "10.0.0.1:5000".parse().unwrap()
}

fn encode<F>(method: Method, token: &[u8; 12], key: Option<&IntegrityKey>, build: F) -> Result<BytesMut>
where
    F: FnOnce(&mut MessageEncoder<'_>),
{
    let mut bytes = BytesMut::with_capacity(1500);

    {
        let mut message = MessageEncoder::new(method, token, &mut bytes);
        build(&mut message);
        message.flush(key)?;
    }

    Ok(bytes)
}

fn unauthorized(method: Method, token: &[u8; 12]) -> Result<BytesMut> {
    encode(method, token, None, |message| {
        message.append::<ErrorCode>(ErrorCode::from(error::ErrorType::Unauthorized));
        message.append::<Realm>("localhost");
        message.append::<Nonce>("b7f2c4d9");
    })
}

async fn udp_server() -> Result<(UdpSocket, TurnAsyncSocket, UnboundedReceiver<Event>)> {
    udp_server_with(TurnSocketOptions::default()).await
}

async fn udp_server_with(
    options: TurnSocketOptions,
) -> Result<(UdpSocket, TurnAsyncSocket, UnboundedReceiver<Event>)> {
    let server = UdpSocket::bind("127.0.0.1:0").await?;
    let (handler, mut events) = Recorder::new();

    let socket = TurnAsyncSocket::new(options, handler);
    socket.set_username_and_password("user1", "test", false);
    socket.connect("127.0.0.1", server.local_addr()?.port());
    assert_eq!(next(&mut events).await?, Event::Connected);

    Ok((server, socket, events))
}

/// Next request of `method`, retransmissions of earlier requests are
/// skipped.
async fn expect(server: &UdpSocket, method: Method) -> Result<(Bytes, SocketAddr)> {
    let mut buf = vec![0u8; 2048];

    loop {
        let (size, client) = server.recv_from(&mut buf).await?;
        let mut attributes = Attributes::default();
        if Message::decode(&buf[..size], &mut attributes)?.method() == method {
            return Ok((Bytes::copy_from_slice(&buf[..size]), client));
        }
    }
}

/// Grant the next Allocate request a 600 second allocation.
async fn allocate(
    server: &UdpSocket,
    socket: &TurnAsyncSocket,
    events: &mut UnboundedReceiver<Event>,
) -> Result<SocketAddr> {
    socket.create_allocation(AllocationProps {
        lifetime: 600,
        ..Default::default()
    });

    let (bytes, client) = expect(server, ALLOCATE_REQUEST).await?;
    let response = {
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        encode(ALLOCATE_RESPONSE, &message.transaction_id(), None, |it| {
            it.append::<XorRelayedAddress>(SocketAddr::from(([127, 0, 0, 1], 49160)));
            it.append::<Lifetime>(600);
        })?
    };

    server.send_to(&response, client).await?;
    match next(events).await? {
        Event::Allocated(info) => assert_eq!(info.lifetime, 600),
        event => return Err(anyhow!("unexpected event: {event:?}")),
    }

    Ok(client)
}

#[tokio::test]
async fn allocate_bind_channel_and_relay_data() -> Result<()> {
    let (server, socket, mut events) = udp_server().await?;
    let relay: SocketAddr = "127.0.0.1:49160".parse()?;
    let mut buf = vec![0u8; 2048];

    socket.create_allocation(AllocationProps {
        lifetime: 600,
        ..Default::default()
    });

    let (size, client) = server.recv_from(&mut buf).await?;
    {
        let mut attributes = Attributes::default();
        let message = Message::decode(&buf[..size], &mut attributes)?;
        assert_eq!(message.method(), ALLOCATE_REQUEST);
        assert!(!message.has_integrity());
        assert_eq!(message.get::<RequestedTransport>(), Some(RequestedTransport::Udp));
        assert_eq!(message.get::<Lifetime>(), Some(600));

        let response = unauthorized(ALLOCATE_ERROR, &message.transaction_id())?;
        server.send_to(&response, client).await?;
    }

    let (size, _) = server.recv_from(&mut buf).await?;
    {
        let mut attributes = Attributes::default();
        let message = Message::decode(&buf[..size], &mut attributes)?;
        assert_eq!(message.method(), ALLOCATE_REQUEST);
        assert_eq!(message.get::<UserName>(), Some("user1"));
        assert_eq!(message.get::<Nonce>(), Some("b7f2c4d9"));
        message.checksum(&key())?;

        let response = encode(ALLOCATE_RESPONSE, &message.transaction_id(), Some(&key()), |it| {
            it.append::<XorRelayedAddress>(relay);
            it.append::<XorMappedAddress>(client);
            it.append::<Lifetime>(600);
        })?;

        server.send_to(&response, client).await?;
    }

    match next(&mut events).await? {
        Event::Allocated(info) => {
            assert_eq!(info.relay, Some(relay));
            assert_eq!(info.reflexive, Some(client));
            assert_eq!(info.lifetime, 600);
        }
        event => return Err(anyhow!("unexpected event: {event:?}")),
    }

    socket.set_active_destination(peer());

    let (size, _) = server.recv_from(&mut buf).await?;
    {
        let mut attributes = Attributes::default();
        let message = Message::decode(&buf[..size], &mut attributes)?;
        assert_eq!(message.method(), CHANNEL_BIND_REQUEST);
        assert_eq!(message.get::<ChannelNumber>(), Some(0x4000));
        assert_eq!(message.get::<XorPeerAddress>(), Some(peer()));
        message.checksum(&key())?;

        let response = encode(CHANNEL_BIND_RESPONSE, &message.transaction_id(), Some(&key()), |_| ())?;
        server.send_to(&response, client).await?;
    }

    assert_eq!(next(&mut events).await?, Event::ActiveDestinationSet);
    assert_eq!(next(&mut events).await?, Event::ChannelBound(0x4000, peer()));

    socket.send(Bytes::from_static(b"hello"));
    assert_eq!(next(&mut events).await?, Event::Sent);

    let (size, _) = server.recv_from(&mut buf).await?;
    assert_eq!(&buf[..size], &[0x40, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);

    let mut bytes = BytesMut::new();
    ChannelData {
        bytes: b"world",
        number: 0x4000,
    }
    .encode(&mut bytes, false);

    server.send_to(&bytes, client).await?;
    assert_eq!(
        next(&mut events).await?,
        Event::Received(peer(), Bytes::from_static(b"world"))
    );

    // unknown channels are dropped
    ChannelData {
        bytes: b"lost",
        number: 0x4001,
    }
    .encode(&mut bytes, false);

    server.send_to(&bytes, client).await?;
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());

    Ok(())
}

#[tokio::test]
async fn reauthentication_is_attempted_once() -> Result<()> {
    let (server, socket, mut events) = udp_server().await?;
    let mut buf = vec![0u8; 2048];

    socket.create_allocation(AllocationProps::default());

    let mut last = None;
    let mut attempt = 0;
    while attempt < 2 {
        let (size, client) = server.recv_from(&mut buf).await?;
        let mut attributes = Attributes::default();
        let message = Message::decode(&buf[..size], &mut attributes)?;
        assert_eq!(message.method(), ALLOCATE_REQUEST);

        // a retransmission of the request already answered
        if last == Some(message.transaction_id()) {
            continue;
        }

        last = Some(message.transaction_id());
        assert_eq!(message.has_integrity(), attempt == 1);

        let response = unauthorized(ALLOCATE_ERROR, &message.transaction_id())?;
        server.send_to(&response, client).await?;
        attempt += 1;
    }

    assert_eq!(
        next(&mut events).await?,
        Event::AllocationFailed(ErrorKind::Stun(401))
    );

    // no third attempt goes out
    assert!(
        timeout(Duration::from_millis(300), server.recv_from(&mut buf))
            .await
            .is_err()
    );

    Ok(())
}

#[tokio::test]
async fn stray_response_is_ignored() -> Result<()> {
    let (server, socket, mut events) = udp_server().await?;
    let mut buf = vec![0u8; 2048];

    socket.bind_request();

    let (size, client) = server.recv_from(&mut buf).await?;
    let mut attributes = Attributes::default();
    let message = Message::decode(&buf[..size], &mut attributes)?;
    assert_eq!(message.method(), BINDING_REQUEST);
    assert_eq!(message.get::<Software>().map(|it| it.starts_with("sipturn")), Some(true));

    let stray = encode(BINDING_RESPONSE, &[7u8; 12], None, |it| {
        it.append::<XorMappedAddress>(peer());
    })?;

    let response = encode(BINDING_RESPONSE, &message.transaction_id(), None, |it| {
        it.append::<XorMappedAddress>(client);
    })?;

    server.send_to(&stray, client).await?;
    server.send_to(&response, client).await?;

    assert_eq!(next(&mut events).await?, Event::Bound(client));
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());

    Ok(())
}

#[tokio::test]
async fn incoming_binding_request_and_raw_data() -> Result<()> {
    let (server, socket, mut events) = udp_server().await?;
    let server_addr = server.local_addr()?;
    let mut buf = vec![0u8; 2048];

    // without an allocation data goes to the server as is
    socket.send(Bytes::from_static(b"ping"));
    assert_eq!(next(&mut events).await?, Event::Sent);

    let (size, client) = server.recv_from(&mut buf).await?;
    assert_eq!(&buf[..size], b"ping");

    let token = [3u8; 12];
    let request = encode(BINDING_REQUEST, &token, None, |_| ())?;
    server.send_to(&request, client).await?;

    let (size, _) = server.recv_from(&mut buf).await?;
    {
        let mut attributes = Attributes::default();
        let message = Message::decode(&buf[..size], &mut attributes)?;
        assert_eq!(message.method(), BINDING_RESPONSE);
        assert_eq!(message.transaction_id(), token);
        assert_eq!(message.get::<XorMappedAddress>(), Some(server_addr));
    }

    assert_eq!(next(&mut events).await?, Event::IncomingBind(server_addr));

    // a request the client does not serve is refused
    let request = encode(ALLOCATE_REQUEST, &token, None, |_| ())?;
    server.send_to(&request, client).await?;

    let (size, _) = server.recv_from(&mut buf).await?;
    {
        let mut attributes = Attributes::default();
        let message = Message::decode(&buf[..size], &mut attributes)?;
        assert_eq!(message.method(), ALLOCATE_ERROR);
        assert_eq!(message.get::<ErrorCode>().map(|it| it.status()), Some(400));
    }

    server.send_to(b"hello world", client).await?;
    assert_eq!(
        next(&mut events).await?,
        Event::Received(server_addr, Bytes::from_static(b"hello world"))
    );

    Ok(())
}

#[tokio::test]
async fn unanswered_udp_request_is_sent_seven_times() -> Result<()> {
    let server = std::net::UdpSocket::bind("127.0.0.1:0")?;
    let (handler, mut events) = Recorder::new();

    let socket = TurnAsyncSocket::new(TurnSocketOptions::default(), handler);
    socket.connect("127.0.0.1", server.local_addr()?.port());
    assert_eq!(next(&mut events).await?, Event::Connected);

    tokio::time::pause();
    let start = Instant::now();
    socket.create_allocation(AllocationProps::default());

    assert_eq!(
        next_within(&mut events, Duration::from_secs(60)).await?,
        Event::AllocationFailed(ErrorKind::ResponseTimeout)
    );

    // 100 + 200 + 400 + 800 + 1600 + 3200 + 1600
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(7900) && elapsed < Duration::from_millis(8000),
        "timed out after {elapsed:?}"
    );

    server.set_nonblocking(true)?;
    let mut buf = vec![0u8; 2048];
    let mut tokens = Vec::new();
    while let Ok((size, _)) = server.recv_from(&mut buf) {
        let mut attributes = Attributes::default();
        let message = Message::decode(&buf[..size], &mut attributes)?;
        assert_eq!(message.method(), ALLOCATE_REQUEST);
        tokens.push(message.transaction_id());
    }

    assert_eq!(tokens.len(), 7);
    assert!(tokens.iter().all(|it| *it == tokens[0]));
    Ok(())
}

#[tokio::test]
async fn unanswered_tcp_request_times_out_once() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let (handler, mut events) = Recorder::new();

    let socket = TurnAsyncSocket::new(
        TurnSocketOptions {
            transport: TransportType::Tcp,
            ..Default::default()
        },
        handler,
    );

    socket.connect("127.0.0.1", listener.local_addr()?.port());

    let (mut stream, _) = listener.accept().await?;
    assert_eq!(next(&mut events).await?, Event::Connected);

    tokio::time::pause();
    let start = Instant::now();
    socket.create_allocation(AllocationProps::default());

    assert_eq!(
        next_within(&mut events, Duration::from_secs(60)).await?,
        Event::AllocationFailed(ErrorKind::ResponseTimeout)
    );

    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(39500) && elapsed < Duration::from_millis(39600),
        "timed out after {elapsed:?}"
    );

    let mut buf = vec![0u8; 2048];
    let size = stream.read(&mut buf).await?;
    let mut attributes = Attributes::default();
    let message = Message::decode(&buf[..size], &mut attributes)?;
    assert_eq!(message.method(), ALLOCATE_REQUEST);
    assert_eq!(message.get::<RequestedTransport>(), Some(RequestedTransport::Tcp));

    // exactly one request went out on the stream
    assert_eq!(size, 20 + u16::from_be_bytes([buf[2], buf[3]]) as usize);
    Ok(())
}

#[tokio::test]
async fn zero_lifetime_refresh_releases_allocation() -> Result<()> {
    let (server, socket, mut events) = udp_server().await?;
    let client = allocate(&server, &socket, &mut events).await?;

    socket.destroy_allocation();

    let (bytes, _) = expect(&server, REFRESH_REQUEST).await?;
    let response = {
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.get::<Lifetime>(), Some(0));

        encode(REFRESH_RESPONSE, &message.transaction_id(), None, |it| {
            it.append::<Lifetime>(0);
        })?
    };

    server.send_to(&response, client).await?;
    assert_eq!(next(&mut events).await?, Event::Refreshed(0));

    socket.refresh_allocation(600);
    assert_eq!(
        next(&mut events).await?,
        Event::RefreshFailed(ErrorKind::NoAllocation)
    );

    socket.set_active_destination(peer());
    assert_eq!(
        next(&mut events).await?,
        Event::ActiveDestinationFailed(ErrorKind::NoAllocation)
    );

    Ok(())
}

#[tokio::test]
async fn allocation_mismatch_drops_allocation() -> Result<()> {
    let (server, socket, mut events) = udp_server().await?;
    let client = allocate(&server, &socket, &mut events).await?;

    socket.refresh_allocation(600);

    let (bytes, _) = expect(&server, REFRESH_REQUEST).await?;
    let response = {
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.get::<Lifetime>(), Some(600));

        encode(REFRESH_ERROR, &message.transaction_id(), None, |it| {
            it.append::<ErrorCode>(ErrorCode::from(error::ErrorType::AllocationMismatch));
        })?
    };

    server.send_to(&response, client).await?;
    assert_eq!(
        next(&mut events).await?,
        Event::RefreshFailed(ErrorKind::Stun(437))
    );

    socket.refresh_allocation(600);
    assert_eq!(
        next(&mut events).await?,
        Event::RefreshFailed(ErrorKind::NoAllocation)
    );

    Ok(())
}

#[tokio::test]
async fn failed_channel_bind_is_retried() -> Result<()> {
    let (server, socket, mut events) = udp_server().await?;
    let client = allocate(&server, &socket, &mut events).await?;

    socket.set_active_destination(peer());
    assert_eq!(next(&mut events).await?, Event::ActiveDestinationSet);

    let (bytes, _) = expect(&server, CHANNEL_BIND_REQUEST).await?;
    let (failed, response) = {
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        assert_eq!(message.get::<ChannelNumber>(), Some(0x4000));

        let response = encode(CHANNEL_BIND_ERROR, &message.transaction_id(), None, |it| {
            it.append::<ErrorCode>(ErrorCode::from(error::ErrorType::Forbidden));
        })?;

        (message.transaction_id(), response)
    };

    server.send_to(&response, client).await?;
    assert_eq!(
        next(&mut events).await?,
        Event::ChannelBindFailed(ErrorKind::Stun(403), peer())
    );

    // the peer keeps its channel number and is bound again
    socket.set_active_destination(peer());
    assert_eq!(next(&mut events).await?, Event::ActiveDestinationSet);

    let response = loop {
        let (bytes, _) = expect(&server, CHANNEL_BIND_REQUEST).await?;
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes)?;
        if message.transaction_id() == failed {
            continue;
        }

        assert_eq!(message.get::<ChannelNumber>(), Some(0x4000));
        assert_eq!(message.get::<XorPeerAddress>(), Some(peer()));

        break encode(CHANNEL_BIND_RESPONSE, &message.transaction_id(), None, |_| ())?;
    };

    server.send_to(&response, client).await?;
    assert_eq!(next(&mut events).await?, Event::ChannelBound(0x4000, peer()));
    Ok(())
}

#[tokio::test]
async fn oversized_datagram_is_reported_and_dropped() -> Result<()> {
    let (server, socket, mut events) = udp_server_with(TurnSocketOptions {
        buffer_size: 64,
        ..Default::default()
    })
    .await?;

    let server_addr = server.local_addr()?;
    let mut buf = vec![0u8; 2048];

    socket.send(Bytes::from_static(b"ping"));
    assert_eq!(next(&mut events).await?, Event::Sent);
    let (_, client) = server.recv_from(&mut buf).await?;

    server.send_to(&[b'x'; 65], client).await?;
    assert_eq!(
        next(&mut events).await?,
        Event::ReceiveFailed(ErrorKind::FrameError)
    );

    // the socket stays open and a datagram filling the buffer still fits
    server.send_to(&[b'x'; 64], client).await?;
    assert_eq!(
        next(&mut events).await?,
        Event::Received(server_addr, Bytes::from_static(&[b'x'; 64]))
    );

    Ok(())
}

#[tokio::test]
async fn oversized_stream_frame_closes_socket() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let (handler, mut events) = Recorder::new();

    let socket = TurnAsyncSocket::new(
        TurnSocketOptions {
            transport: TransportType::Tcp,
            ..Default::default()
        },
        handler,
    );

    socket.connect("127.0.0.1", listener.local_addr()?.port());

    let (mut stream, _) = listener.accept().await?;
    assert_eq!(next(&mut events).await?, Event::Connected);

    // STUN header declaring 8000 bytes of attributes
    stream
        .write_all(&[0x01, 0x01, 0x1f, 0x40, 0x21, 0x12, 0xa4, 0x42])
        .await?;

    assert_eq!(
        next(&mut events).await?,
        Event::ReceiveFailed(ErrorKind::FrameError)
    );

    assert_eq!(next(&mut events).await?, Event::Closed);
    Ok(())
}

mod blocking {
    use std::{net::UdpSocket, thread, time::Duration};

    use anyhow::Result;
    use bytes::BytesMut;
    use codec::{
        Attributes,
        message::{Message, attributes::*, methods::*},
    };
    use sipturn_client::{AllocationProps, ErrorKind, TurnSocketOptions, sync::TurnSocket};

    use super::{encode, peer};

    /// Answers Binding, Allocate and ChannelBind requests and echoes
    /// ChannelData until it has been idle for two seconds.
    fn spawn_server() -> Result<u16> {
        let server = UdpSocket::bind("127.0.0.1:0")?;
        server.set_read_timeout(Some(Duration::from_secs(2)))?;
        let port = server.local_addr()?.port();

        thread::spawn(move || {
            let mut buf = vec![0u8; 2048];

            while let Ok((size, client)) = server.recv_from(&mut buf) {
                if buf[0] >> 6 != 0 {
                    let _ = server.send_to(&buf[..size], client);
                    continue;
                }

                let mut attributes = Attributes::default();
                let Ok(message) = Message::decode(&buf[..size], &mut attributes) else {
                    continue;
                };

                let token = message.transaction_id();
                let response: Result<BytesMut> = match message.method() {
                    BINDING_REQUEST => encode(BINDING_RESPONSE, &token, None, |it| {
                        it.append::<XorMappedAddress>(client);
                    }),
                    ALLOCATE_REQUEST => encode(ALLOCATE_RESPONSE, &token, None, |it| {
                        it.append::<XorRelayedAddress>("127.0.0.1:49170".parse().unwrap());
                        it.append::<Lifetime>(300);
                    }),
                    CHANNEL_BIND_REQUEST => encode(CHANNEL_BIND_RESPONSE, &token, None, |_| ()),
                    _ => continue,
                };

                if let Ok(bytes) = response {
                    let _ = server.send_to(&bytes, client);
                }
            }
        });

        Ok(port)
    }

    #[test]
    fn blocking_socket_relays_through_channel() -> Result<()> {
        let port = spawn_server()?;
        let socket = TurnSocket::connect(TurnSocketOptions::default(), "127.0.0.1", port)?;

        let reflexive = socket.bind_request()?;
        assert!(reflexive.ip().is_loopback());

        let allocation = socket.create_allocation(AllocationProps::default())?;
        assert_eq!(allocation.lifetime, 300);
        assert_eq!(allocation.relay, Some("127.0.0.1:49170".parse()?));

        let error = socket
            .create_allocation(AllocationProps::default())
            .err()
            .map(|it| it.kind());
        assert_eq!(error, Some(ErrorKind::AlreadyAllocated));

        let mut buffer = [0u8; 64];
        let error = socket
            .receive(&mut buffer, Duration::from_millis(200))
            .err()
            .map(|it| it.kind());
        assert_eq!(error, Some(ErrorKind::ReadTimeout));

        socket.set_active_destination(peer())?;
        socket.send(b"echo")?;

        let (size, source) = socket.receive(&mut buffer, Duration::from_secs(1))?;
        assert_eq!(&buffer[..size], b"echo");
        assert_eq!(source, peer());

        socket.send(b"too long")?;
        let error = socket
            .receive_from(peer(), &mut buffer[..2], Duration::from_secs(1))
            .err()
            .map(|it| it.kind());
        assert_eq!(error, Some(ErrorKind::BufferTooSmall));

        Ok(())
    }
}
