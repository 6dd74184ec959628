//! Parsed SIP message model.
//!
//! The dialog layer never sees raw bytes, a parser in front of it fills
//! these structures and an encoder behind it serializes the outbox.

use std::fmt;

use bytes::Bytes;
use rand::Rng;

/// Session description, opaque to the dialog layer.
pub type Sdp = Bytes;

/// Magic cookie prefix of RFC 3261 branch parameters.
pub const BRANCH_MAGIC: &str = "z9hG4bK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invite => "INVITE",
            Self::Ack => "ACK",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Register => "REGISTER",
            Self::Options => "OPTIONS",
            Self::Info => "INFO",
            Self::Update => "UPDATE",
            Self::Prack => "PRACK",
            Self::Subscribe => "SUBSCRIBE",
            Self::Notify => "NOTIFY",
            Self::Refer => "REFER",
            Self::Message => "MESSAGE",
            Self::Publish => "PUBLISH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    #[default]
    Empty,
    Sdp(Sdp),
    Other {
        content_type: String,
        data: Bytes,
    },
}

impl Body {
    pub fn sdp(&self) -> Option<&Sdp> {
        match self {
            Self::Sdp(it) => Some(it),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl From<Option<Sdp>> for Body {
    fn from(value: Option<Sdp>) -> Self {
        value.map(Self::Sdp).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl Uri {
    pub fn sip(user: Option<&str>, host: &str) -> Self {
        Self {
            scheme: "sip".to_string(),
            user: user.map(ToString::to_string),
            host: host.to_string(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn is_sip(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("sip") || self.scheme.eq_ignore_ascii_case("sips")
    }
}

/// `scheme:[user@]host[:port]`, URI parameters are not kept.
impl std::str::FromStr for Uri {
    type Err = crate::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = value.trim().split_once(':').ok_or(crate::Error::InvalidUri)?;
        let rest = rest.split(';').next().unwrap_or_default();
        let (user, hostport) = match rest.rsplit_once('@') {
            Some((user, hostport)) => (Some(user), hostport),
            None => (None, rest),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) if !hostport.ends_with(']') => (
                host,
                Some(port.parse::<u16>().map_err(|_| crate::Error::InvalidUri)?),
            ),
            _ => (hostport, None),
        };

        if scheme.is_empty() || host.is_empty() || user == Some("") {
            return Err(crate::Error::InvalidUri);
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            user: user.map(ToString::to_string),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;

        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }

        f.write_str(&self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

/// Name-addr of From, To, Contact and route headers. Only the parameters
/// the dialog layer reads are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub tag: Option<String>,
    /// `expires` parameter of a Contact.
    pub expires: Option<u32>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            tag: None,
            expires: None,
            uri,
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub branch: String,
}

impl Via {
    /// Via for a new client transaction sent from `uri`.
    pub fn new(uri: &Uri) -> Self {
        Self {
            transport: "UDP".to_string(),
            host: uri.host.clone(),
            port: uri.port,
            branch: new_branch(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Uac,
    Uas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExpires {
    pub interval: u32,
    pub refresher: Option<Refresher>,
}

/// WWW-Authenticate or Proxy-Authenticate digest challenge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Challenge {
    pub realm: Option<String>,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub stale: bool,
}

/// Authorization or Proxy-Authorization digest credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub cnonce: Option<String>,
    pub nonce_count: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Active,
    Pending,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub state: SubState,
    pub expires: Option<u32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: Uri },
    Response { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start: StartLine,
    pub via: Vec<Via>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    pub contacts: Vec<NameAddr>,
    pub record_route: Vec<NameAddr>,
    pub route: Vec<NameAddr>,
    pub max_forwards: Option<u32>,
    pub expires: Option<u32>,
    pub min_expires: Option<u32>,
    pub www_authenticate: Vec<Challenge>,
    pub proxy_authenticate: Vec<Challenge>,
    pub authorization: Vec<Credentials>,
    pub proxy_authorization: Vec<Credentials>,
    pub session_expires: Option<SessionExpires>,
    pub min_se: Option<u32>,
    pub supported: Vec<String>,
    pub require: Vec<String>,
    pub allow: Vec<Method>,
    pub retry_after: Option<u32>,
    pub reason: Option<String>,
    pub event: Option<String>,
    pub subscription_state: Option<SubscriptionState>,
    pub refer_to: Option<NameAddr>,
    pub body: Body,
}

impl SipMessage {
    /// Bare request without Via, the sender adds its own.
    pub fn request(
        method: Method,
        uri: Uri,
        from: NameAddr,
        to: NameAddr,
        call_id: &str,
        seq: u32,
    ) -> Self {
        Self {
            start: StartLine::Request { method, uri },
            via: Vec::new(),
            from,
            to,
            call_id: call_id.to_string(),
            cseq: CSeq { seq, method },
            contacts: Vec::new(),
            record_route: Vec::new(),
            route: Vec::new(),
            max_forwards: Some(70),
            expires: None,
            min_expires: None,
            www_authenticate: Vec::new(),
            proxy_authenticate: Vec::new(),
            authorization: Vec::new(),
            proxy_authorization: Vec::new(),
            session_expires: None,
            min_se: None,
            supported: Vec::new(),
            require: Vec::new(),
            allow: Vec::new(),
            retry_after: None,
            reason: None,
            event: None,
            subscription_state: None,
            refer_to: None,
            body: Body::Empty,
        }
    }

    /// Response to `request` with the headers RFC 3261 copies over. The To
    /// tag is left as the request had it.
    pub fn response(request: &SipMessage, code: u16) -> Self {
        let mut response = Self::request(
            request.cseq.method,
            request.request_uri().cloned().unwrap_or_else(|| request.to.uri.clone()),
            request.from.clone(),
            request.to.clone(),
            &request.call_id,
            request.cseq.seq,
        );

        response.start = StartLine::Response {
            reason: reason_phrase(code).to_string(),
            code,
        };

        response.max_forwards = None;
        response.via = request.via.clone();
        if request.cseq.method == Method::Invite {
            response.record_route = request.record_route.clone();
        }

        response
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// Request method, or the CSeq method of a response.
    pub fn method(&self) -> Method {
        match &self.start {
            StartLine::Request { method, .. } => *method,
            StartLine::Response { .. } => self.cseq.method,
        }
    }

    pub fn code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&Uri> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    /// Branch of the top Via.
    pub fn transaction_id(&self) -> Option<&str> {
        self.via.first().map(|it| it.branch.as_str())
    }

    pub fn sdp(&self) -> Option<&Sdp> {
        self.body.sdp()
    }

    pub fn supports(&self, option: &str) -> bool {
        self.supported
            .iter()
            .chain(self.require.iter())
            .any(|it| it.eq_ignore_ascii_case(option))
    }

    /// Turn a request into the next transaction of the same request: CSeq
    /// plus one and a new top Via branch.
    pub fn next_transaction(&mut self) {
        self.cseq.seq += 1;

        if let Some(via) = self.via.first_mut() {
            via.branch = new_branch();
        }
    }
}

/// CANCEL of a client INVITE: same Request-URI, Call-ID, From, To, CSeq
/// number and top Via as the request it cancels.
pub fn make_cancel(invite: &SipMessage) -> SipMessage {
    let mut cancel = SipMessage::request(
        Method::Cancel,
        invite.request_uri().cloned().unwrap_or_else(|| invite.to.uri.clone()),
        invite.from.clone(),
        invite.to.clone(),
        &invite.call_id,
        invite.cseq.seq,
    );

    cancel.via = invite.via.iter().take(1).cloned().collect();
    cancel.route = invite.route.clone();
    cancel
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        422 => "Session Interval Too Small",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "",
    }
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
        .collect()
}

pub fn new_tag() -> String {
    random_hex(8)
}

pub fn new_branch() -> String {
    format!("{BRANCH_MAGIC}{}", random_hex(16))
}

pub fn new_call_id(host: &str) -> String {
    format!("{}@{host}", random_hex(20))
}

/// Client nonce of a digest response.
pub fn new_cnonce() -> String {
    random_hex(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uri() -> Result<(), crate::Error> {
        let uri: Uri = "sip:alice@192.0.2.1:5070;transport=udp".parse()?;
        assert_eq!(uri, Uri::sip(Some("alice"), "192.0.2.1").with_port(5070));

        let uri: Uri = "SIPS:[2001:db8::1]".parse()?;
        assert_eq!(uri.scheme, "sips");
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.port, None);

        assert_eq!("example.com".parse::<Uri>(), Err(crate::Error::InvalidUri));
        assert_eq!("sip:@example.com".parse::<Uri>(), Err(crate::Error::InvalidUri));
        assert_eq!("sip:example.com:x".parse::<Uri>(), Err(crate::Error::InvalidUri));
        Ok(())
    }
}
