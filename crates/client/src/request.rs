use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use codec::{
    crypto::IntegrityKey,
    message::{MessageEncoder, attributes::*, methods::Method},
};
use rand::Rng;

use crate::SOFTWARE;

/// Initial retransmission timeout over UDP.
pub const UDP_RTO: Duration = Duration::from_millis(100);

/// Number of times a request is sent over UDP before it times out.
pub const UDP_MAX_SENDS: u32 = 7;

/// Wait after the last UDP retransmission.
pub const UDP_FINAL_WAIT: Duration = Duration::from_millis(1600);

/// Single transaction timeout on reliable transports.
pub const RELIABLE_TIMEOUT: Duration = Duration::from_millis(39500);

pub fn transaction_id() -> [u8; 12] {
    let mut token = [0u8; 12];
    rand::rng().fill(&mut token);
    token
}

/// Long-term or short-term credentials of the client.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub realm: String,
    pub nonce: String,
    pub key: Option<IntegrityKey>,
}

impl Credentials {
    /// Authentication attributes are only added once a key is known.
    pub fn is_usable(&self) -> bool {
        !self.username.is_empty() && self.key.is_some()
    }

    /// Take the realm and nonce of a challenge and derive the long-term key.
    pub fn challenge(&mut self, realm: &str, nonce: &str) {
        self.realm = realm.to_string();
        self.nonce = nonce.to_string();
        self.key = Some(IntegrityKey::long_term(&self.username, &self.password, &self.realm));
    }
}

#[derive(Debug, Clone)]
pub enum RequestAttribute {
    Lifetime(u32),
    Bandwidth(u32),
    RequestedTransport(RequestedTransport),
    EvenPort(bool),
    ReservationToken(u64),
    ChannelNumber(u16),
    XorPeerAddress(SocketAddr),
    Data(Bytes),
    Priority(u32),
    IceControlling(u64),
    IceControlled(u64),
    UseCandidate,
}

/// A message kept in owned form, so that it can be encoded again with a new
/// transaction id and fresh credentials.
#[derive(Debug, Clone)]
pub struct StunRequest {
    pub method: Method,
    pub attributes: Vec<RequestAttribute>,
}

impl StunRequest {
    pub fn new(method: Method) -> Self {
        Self {
            attributes: Vec::with_capacity(4),
            method,
        }
    }

    pub fn with(mut self, attribute: RequestAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn get_channel(&self) -> Option<u16> {
        self.attributes.iter().find_map(|it| match it {
            RequestAttribute::ChannelNumber(it) => Some(*it),
            _ => None,
        })
    }

    pub fn get_peer(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|it| match it {
            RequestAttribute::XorPeerAddress(it) => Some(*it),
            _ => None,
        })
    }

    /// Encode with SOFTWARE first and the authentication attributes last,
    /// followed by MESSAGE-INTEGRITY and FINGERPRINT when credentials are
    /// usable.
    pub fn encode(&self, token: &[u8; 12], credentials: Option<&Credentials>) -> Result<Bytes, codec::Error> {
        let mut bytes = BytesMut::with_capacity(1500);

        {
            let mut message = MessageEncoder::new(self.method, token, &mut bytes);
            message.append::<Software>(SOFTWARE);

            for attribute in &self.attributes {
                match attribute {
                    RequestAttribute::Lifetime(it) => message.append::<Lifetime>(*it),
                    RequestAttribute::Bandwidth(it) => message.append::<Bandwidth>(*it),
                    RequestAttribute::RequestedTransport(it) => message.append::<RequestedTransport>(*it),
                    RequestAttribute::EvenPort(it) => message.append::<EvenPort>(*it),
                    RequestAttribute::ReservationToken(it) => message.append::<ReservationToken>(*it),
                    RequestAttribute::ChannelNumber(it) => message.append::<ChannelNumber>(*it),
                    RequestAttribute::XorPeerAddress(it) => message.append::<XorPeerAddress>(*it),
                    RequestAttribute::Data(it) => message.append::<Data>(it),
                    RequestAttribute::Priority(it) => message.append::<Priority>(*it),
                    RequestAttribute::IceControlling(it) => message.append::<IceControlling>(*it),
                    RequestAttribute::IceControlled(it) => message.append::<IceControlled>(*it),
                    RequestAttribute::UseCandidate => message.append::<UseCandidate>(()),
                }
            }

            match credentials.filter(|it| it.is_usable()) {
                Some(credentials) => {
                    message.append::<UserName>(&credentials.username);

                    if !credentials.realm.is_empty() {
                        message.append::<Realm>(&credentials.realm);
                    }

                    if !credentials.nonce.is_empty() {
                        message.append::<Nonce>(&credentials.nonce);
                    }

                    message.flush(credentials.key.as_ref())?;
                }
                None => message.flush(None)?,
            }
        }

        Ok(bytes.freeze())
    }
}

/// What to do with a request whose timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Retransmit,
    Timeout,
}

/// Outstanding request and its retransmission schedule.
///
/// Over UDP the request is sent up to `max_sends` times, the wait doubles
/// from 100 ms and is 1600 ms after the last send. Reliable transports send
/// once and wait 39.5 s.
pub struct RequestEntry {
    pub request: StunRequest,
    pub bytes: Bytes,
    /// Destination other than the server, for connectivity checks.
    pub target: Option<SocketAddr>,
    /// Set once the request has been re-issued after an authentication
    /// challenge.
    pub auth_retried: bool,
    requests_sent: u32,
    max_sends: u32,
    interval: Duration,
    deadline: Instant,
    reliable: bool,
}

impl RequestEntry {
    pub fn new(
        request: StunRequest,
        bytes: Bytes,
        target: Option<SocketAddr>,
        reliable: bool,
        max_sends: u32,
        now: Instant,
    ) -> Self {
        let interval = if reliable { RELIABLE_TIMEOUT } else { UDP_RTO };

        Self {
            deadline: now + interval,
            auth_retried: false,
            requests_sent: 1,
            max_sends: max_sends.max(1),
            interval,
            request,
            bytes,
            target,
            reliable,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn requests_sent(&self) -> u32 {
        self.requests_sent
    }

    pub fn max_sends(&self) -> u32 {
        self.max_sends
    }

    /// Advance the schedule. On [`Expiry::Retransmit`] the caller sends
    /// `bytes` again.
    pub fn on_expired(&mut self, now: Instant) -> Expiry {
        if self.reliable || self.requests_sent >= self.max_sends {
            return Expiry::Timeout;
        }

        self.interval = if self.requests_sent == self.max_sends - 1 {
            UDP_FINAL_WAIT
        } else {
            self.interval * 2
        };

        self.requests_sent += 1;
        self.deadline = now + self.interval;
        Expiry::Retransmit
    }
}

/// Outstanding requests keyed by transaction id.
#[derive(Default)]
pub struct RequestTable(AHashMap<[u8; 12], RequestEntry>);

impl RequestTable {
    pub fn insert(&mut self, token: [u8; 12], entry: RequestEntry) {
        self.0.insert(token, entry);
    }

    pub fn get(&self, token: &[u8; 12]) -> Option<&RequestEntry> {
        self.0.get(token)
    }

    pub fn get_mut(&mut self, token: &[u8; 12]) -> Option<&mut RequestEntry> {
        self.0.get_mut(token)
    }

    pub fn remove(&mut self, token: &[u8; 12]) -> Option<RequestEntry> {
        self.0.remove(token)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.0.values().map(|it| it.deadline).min()
    }

    pub fn expired(&self, now: Instant) -> Vec<[u8; 12]> {
        self.0
            .iter()
            .filter(|(_, it)| it.deadline <= now)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

#[cfg(test)]
mod tests {
    use codec::{
        Attributes,
        message::{Message, methods::*},
    };

    use super::*;

    fn entry(reliable: bool, now: Instant) -> RequestEntry {
        RequestEntry::new(
            StunRequest::new(BINDING_REQUEST),
            Bytes::new(),
            None,
            reliable,
            UDP_MAX_SENDS,
            now,
        )
    }

    #[test]
    fn udp_schedule_doubles_then_waits_1600ms() {
        let start = Instant::now();
        let mut now = start;
        let mut entry = entry(false, now);
        let mut waits = vec![entry.deadline() - now];

        loop {
            now = entry.deadline();
            match entry.on_expired(now) {
                Expiry::Retransmit => waits.push(entry.deadline() - now),
                Expiry::Timeout => break,
            }
        }

        let waits: Vec<u64> = waits.iter().map(|it| it.as_millis() as u64).collect();
        assert_eq!(waits, vec![100, 200, 400, 800, 1600, 3200, 1600]);
        assert_eq!(entry.requests_sent(), UDP_MAX_SENDS);
        assert_eq!((now - start).as_millis(), 7900);
    }

    #[test]
    fn reliable_transport_times_out_once() {
        let now = Instant::now();
        let mut entry = entry(true, now);

        assert_eq!(entry.deadline() - now, RELIABLE_TIMEOUT);
        assert_eq!(entry.on_expired(entry.deadline()), Expiry::Timeout);
        assert_eq!(entry.requests_sent(), 1);
    }

    #[test]
    fn credentials_add_integrity() {
        let mut credentials = Credentials {
            username: "user1".to_string(),
            password: "test".to_string(),
            ..Default::default()
        };

        let request = StunRequest::new(ALLOCATE_REQUEST)
            .with(RequestAttribute::RequestedTransport(RequestedTransport::Udp));

        let token = transaction_id();
        let bytes = request.encode(&token, Some(&credentials)).unwrap();
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes).unwrap();
        assert!(!message.has_integrity());
        assert_eq!(message.get::<Software>(), Some(SOFTWARE));

        credentials.challenge("localhost", "abcd");

        let bytes = request.encode(&token, Some(&credentials)).unwrap();
        let mut attributes = Attributes::default();
        let message = Message::decode(&bytes, &mut attributes).unwrap();
        assert_eq!(message.get::<UserName>(), Some("user1"));
        assert_eq!(message.get::<Nonce>(), Some("abcd"));
        assert!(message.checksum(credentials.key.as_ref().unwrap()).is_ok());
    }
}
