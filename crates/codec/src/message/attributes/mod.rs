pub mod address;
pub mod error;

use std::{fmt::Debug, net::SocketAddr};

use bytes::BufMut;
use num_enum::TryFromPrimitive;

use crate::Error;

use self::{
    address::{IpFamily, XAddress},
    error::{ErrorType, errno, status},
};

/// STUN attribute types understood by the relay client.
///
/// [RFC5389]: https://datatracker.ietf.org/doc/html/rfc5389
/// [RFC5766]: https://datatracker.ietf.org/doc/html/rfc5766
///
/// Types in the range 0x0000-0x7FFF are comprehension-required, a message
/// carrying one that the receiver does not understand must be rejected.
/// Types in 0x8000-0xFFFF are comprehension-optional and may be skipped.
///
/// PASSWORD (0x0007) and BANDWIDTH (0x0010) were removed by later
/// revisions, they are kept because the Shared Secret method and older
/// TURN servers still use them.
#[repr(u16)]
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug, TryFromPrimitive)]
pub enum AttributeType {
    #[default]
    Unknown = 0x0000,
    MappedAddress = 0x0001,
    UserName = 0x0006,
    Password = 0x0007,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    Bandwidth = 0x0010,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedAddressFamily = 0x0017,
    EvenPort = 0x0018,
    RequestedTransport = 0x0019,
    DontFragment = 0x001A,
    MessageIntegritySha256 = 0x001C,
    PasswordAlgorithm = 0x001D,
    UserHash = 0x001E,
    XorMappedAddress = 0x0020,
    ReservationToken = 0x0022,
    Priority = 0x0024,
    UseCandidate = 0x0025,
    ConnectionId = 0x002A,
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
    IceControlled = 0x8029,
    IceControlling = 0x802A,
    ResponseOrigin = 0x802B,
}

/// dyn stun/turn message attribute.
pub trait Attribute<'a> {
    type Error: Debug;

    /// current attribute inner type.
    type Item;

    /// current attribute type.
    const TYPE: AttributeType;

    /// write the current attribute to the buffer.
    #[allow(unused_variables)]
    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, transaction_id: &'a [u8]) {}

    /// convert buffer to current attribute.
    fn deserialize(bytes: &'a [u8], transaction_id: &'a [u8]) -> Result<Self::Item, Self::Error>;
}

macro_rules! text_attribute {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Error = Error;
            type Item = &'a str;

            const TYPE: AttributeType = AttributeType::$name;

            fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
                bytes.put(value.as_bytes());
            }

            fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
                Ok(std::str::from_utf8(bytes)?)
            }
        }
    };
}

macro_rules! opaque_attribute {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Error = Error;
            type Item = &'a [u8];

            const TYPE: AttributeType = AttributeType::$name;

            fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
                bytes.put(value);
            }

            fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
                Ok(bytes)
            }
        }
    };
}

macro_rules! address_attribute {
    ($(#[$doc:meta])* $name:ident, $xor:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Error = Error;
            type Item = SocketAddr;

            const TYPE: AttributeType = AttributeType::$name;

            fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, transaction_id: &'a [u8]) {
                XAddress::serialize(&value, transaction_id, bytes, $xor)
            }

            fn deserialize(bytes: &'a [u8], transaction_id: &'a [u8]) -> Result<Self::Item, Self::Error> {
                XAddress::deserialize(bytes, transaction_id, $xor)
            }
        }
    };
}

macro_rules! number_attribute {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $put:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Error = Error;
            type Item = $ty;

            const TYPE: AttributeType = AttributeType::$name;

            fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
                bytes.$put(value)
            }

            fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
                Ok(<$ty>::from_be_bytes(bytes.try_into()?))
            }
        }
    };
}

macro_rules! flag_attribute {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl<'a> Attribute<'a> for $name {
            type Error = Error;
            type Item = ();

            const TYPE: AttributeType = AttributeType::$name;

            fn deserialize(_: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
                Ok(())
            }
        }
    };
}

text_attribute!(
    /// The USERNAME attribute identifies the username and password
    /// combination used in the message-integrity check.
    UserName
);

text_attribute!(
    /// Password handed out by a Shared Secret response, used with the
    /// short-term credential mechanism.
    Password
);

text_attribute!(
    /// The REALM attribute, present in requests and responses that use the
    /// long-term credential mechanism.
    Realm
);

text_attribute!(
    /// The NONCE attribute, a sequence of qdtext or quoted-pair chosen by the
    /// server.
    Nonce
);

text_attribute!(
    /// Textual description of the software being used by the agent sending
    /// the message, for diagnostic purposes.
    Software
);

opaque_attribute!(
    /// The DATA attribute is present in all Send and Data indications.
    Data
);

opaque_attribute!(
    /// HMAC-SHA1 of the message up to the attribute itself, 20 bytes long.
    MessageIntegrity
);

opaque_attribute!(MessageIntegritySha256);

opaque_attribute!(UserHash);

address_attribute!(
    /// Reflexive transport address of the client, as seen by the server.
    XorMappedAddress,
    true
);

address_attribute!(
    /// Peer address as seen from the relay, carried by Send and Data
    /// indications, ChannelBind and CreatePermission requests.
    XorPeerAddress,
    true
);

address_attribute!(
    /// Address and port the server allocated for the client.
    XorRelayedAddress,
    true
);

address_attribute!(
    /// Plain reflexive address, sent by servers that predate
    /// XOR-MAPPED-ADDRESS.
    MappedAddress,
    false
);

address_attribute!(AlternateServer, false);

address_attribute!(ResponseOrigin, false);

number_attribute!(
    /// Seconds remaining until the allocation expires.
    Lifetime,
    u32,
    put_u32
);

number_attribute!(
    /// Peak bandwidth in kbps requested for the allocation.
    Bandwidth,
    u32,
    put_u32
);

number_attribute!(Fingerprint, u32, put_u32);

number_attribute!(Priority, u32, put_u32);

number_attribute!(ConnectionId, u32, put_u32);

number_attribute!(
    /// Token identifying a relayed address reserved by a previous
    /// allocation with EVEN-PORT.
    ReservationToken,
    u64,
    put_u64
);

number_attribute!(
    /// Tie breaker of an agent in the controlling role.
    IceControlling,
    u64,
    put_u64
);

number_attribute!(
    /// Tie breaker of an agent in the controlled role.
    IceControlled,
    u64,
    put_u64
);

flag_attribute!(DontFragment);

flag_attribute!(UseCandidate);

/// The CHANNEL-NUMBER attribute contains the number of the channel,
/// followed by a two-octet reserved field.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use sipturn_codec::message::attributes::*;
///
/// let mut bytes = BytesMut::new();
/// ChannelNumber::serialize(0x4001, &mut bytes, &[]);
///
/// assert_eq!(&bytes[..], &[0x40, 0x01, 0x00, 0x00]);
/// assert_eq!(ChannelNumber::deserialize(&bytes, &[]).unwrap(), 0x4001);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ChannelNumber;

impl<'a> Attribute<'a> for ChannelNumber {
    type Error = Error;
    type Item = u16;

    const TYPE: AttributeType = AttributeType::ChannelNumber;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u16(value);
        bytes.put_u16(0);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() < 2 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes(bytes[..2].try_into()?))
    }
}

/// Transport protocol of the relayed transport address.
///
/// The protocol number sits in the first byte, the other three are
/// reserved.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum RequestedTransport {
    Tcp = 0x06000000,
    Udp = 0x11000000,
}

impl<'a> Attribute<'a> for RequestedTransport {
    type Error = Error;
    type Item = Self;

    const TYPE: AttributeType = AttributeType::RequestedTransport;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u32(value as u32)
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
        Self::try_from(u32::from_be_bytes(bytes.try_into()?)).map_err(|_| Error::InvalidInput)
    }
}

/// Asks for an even relayed port. With the R bit set the server also
/// reserves the next port and returns a RESERVATION-TOKEN for it.
#[derive(Debug, Clone, Copy)]
pub struct EvenPort;

impl<'a> Attribute<'a> for EvenPort {
    type Error = Error;
    type Item = bool;

    const TYPE: AttributeType = AttributeType::EvenPort;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u8(if value { 0b10000000 } else { 0b00000000 })
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput);
        }

        Ok(bytes[0] & 0b10000000 != 0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequestedAddressFamily;

impl<'a> Attribute<'a> for RequestedAddressFamily {
    type Error = Error;
    type Item = IpFamily;

    const TYPE: AttributeType = AttributeType::RequestedAddressFamily;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u8(value as u8);
        bytes.put(&[0u8; 3][..]);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput);
        }

        IpFamily::try_from(bytes[0]).map_err(|_| Error::InvalidInput)
    }
}

/// Algorithm of the key used for MESSAGE-INTEGRITY, only MD5 is used by
/// this codec.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum PasswordAlgorithm {
    Md5 = 0x0001,
    Sha256 = 0x0002,
}

impl<'a> Attribute<'a> for PasswordAlgorithm {
    type Error = Error;
    type Item = Self;

    const TYPE: AttributeType = AttributeType::PasswordAlgorithm;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        bytes.put_u16(value as u16);
        bytes.put_u16(0);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
        if bytes.len() < 2 {
            return Err(Error::InvalidInput);
        }

        Self::try_from(u16::from_be_bytes(bytes[..2].try_into()?)).map_err(|_| Error::InvalidInput)
    }
}

/// The UNKNOWN-ATTRIBUTES attribute lists the comprehension-required
/// attribute types a server did not understand, it is only present in 420
/// error responses.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use sipturn_codec::message::attributes::*;
///
/// let mut bytes = BytesMut::new();
/// UnknownAttributes::serialize(vec![0x0031, 0x0032], &mut bytes, &[]);
///
/// assert_eq!(&bytes[..], &[0x00, 0x31, 0x00, 0x32]);
/// assert_eq!(UnknownAttributes::deserialize(&bytes, &[]).unwrap(), vec![0x0031, 0x0032]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct UnknownAttributes;

impl<'a> Attribute<'a> for UnknownAttributes {
    type Error = Error;
    type Item = Vec<u16>;

    const TYPE: AttributeType = AttributeType::UnknownAttributes;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        for kind in value {
            bytes.put_u16(kind);
        }
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
        Ok(bytes
            .chunks_exact(2)
            .map(|it| u16::from_be_bytes([it[0], it[1]]))
            .collect())
    }
}

/// The ERROR-CODE attribute is used in error response messages.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// `code` keeps the wire layout, [`ErrorCode::status`] gives the three
/// digit value.
#[derive(Debug, Clone, Copy)]
pub struct ErrorCode<'a> {
    pub code: u16,
    pub message: &'a str,
}

impl<'a> Attribute<'a> for ErrorCode<'a> {
    type Error = Error;
    type Item = Self;

    const TYPE: AttributeType = AttributeType::ErrorCode;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &'a [u8]) {
        value.serialize(bytes);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Self::Error> {
        Self::try_from(bytes)
    }
}

impl From<ErrorType> for ErrorCode<'_> {
    fn from(value: ErrorType) -> Self {
        Self {
            code: value as u16,
            message: value.into(),
        }
    }
}

impl<'a> ErrorCode<'a> {
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::message::attributes::ErrorCode;
    ///
    /// let error = ErrorCode::new(400, "Invalid Request Method");
    ///
    /// assert_eq!(error.code, 0x0400);
    /// assert_eq!(error.status(), 400);
    /// ```
    pub fn new(status: u16, message: &'a str) -> Self {
        Self {
            code: errno(status),
            message,
        }
    }

    pub fn status(&self) -> u16 {
        status(self.code)
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sipturn_codec::message::attributes::{ErrorCode, error::ErrorType};
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x03, 0x00, 0x54, 0x72, 0x79, 0x20, 0x41, 0x6c, 0x74,
    ///     0x65, 0x72, 0x6e, 0x61, 0x74, 0x65,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// ErrorCode::from(ErrorType::TryAlternate).serialize(&mut buf);
    ///
    /// assert_eq!(&buf[..], &buffer);
    /// ```
    pub fn serialize<B: BufMut>(self, bytes: &mut B) {
        bytes.put_u16(0x0000);
        bytes.put_u16(self.code);
        bytes.put(self.message.as_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for ErrorCode<'a> {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use sipturn_codec::message::attributes::ErrorCode;
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x04, 0x26, 0x53, 0x74, 0x61, 0x6c, 0x65,
    /// ];
    ///
    /// let error = ErrorCode::try_from(&buffer[..]).unwrap();
    /// assert_eq!(error.status(), 438);
    /// assert_eq!(error.message, "Stale");
    /// ```
    fn try_from(packet: &'a [u8]) -> Result<Self, Self::Error> {
        if packet.len() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            code: u16::from_be_bytes(packet[2..4].try_into()?) & 0x07FF,
            message: std::str::from_utf8(&packet[4..])?,
        })
    }
}

impl Eq for ErrorCode<'_> {}
impl PartialEq for ErrorCode<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}
