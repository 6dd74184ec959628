//! ## Session Traversal Utilities for NAT (STUN)
//!
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//!
//! Binary codec for the STUN messages [RFC5389] and the TURN extensions
//! [RFC5766] spoken by the relay client. A datagram or stream frame is either
//! a STUN message (the two most significant bits of the first byte are zero)
//! or a TURN ChannelData message (channel number in 0x4000-0x7FFF).
//!
//! Decoding never copies: attribute values are ranges into the source
//! buffer, resolved lazily through the [`message::attributes::Attribute`]
//! trait.

pub mod channel_data;
pub mod crypto;
pub mod message;

use self::{
    channel_data::ChannelData,
    message::{Message, attributes::AttributeType},
};

use std::{array::TryFromSliceError, ops::Range, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    SummaryFailed,
    NotFoundIntegrity,
    IntegrityFailed,
    NotFoundMagicNumber,
    UnknownMethod,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

pub enum DecodeResult<'a> {
    Message(Message<'a>),
    ChannelData(ChannelData<'a>),
}

impl<'a> DecodeResult<'a> {
    pub fn into_message(self) -> Option<Message<'a>> {
        match self {
            Self::Message(it) => Some(it),
            Self::ChannelData(_) => None,
        }
    }

    pub fn into_channel_data(self) -> Option<ChannelData<'a>> {
        match self {
            Self::ChannelData(it) => Some(it),
            Self::Message(_) => None,
        }
    }
}

/// Attribute index of one decoded message.
///
/// Known attributes are stored as value ranges into the message buffer.
/// Attributes in the comprehension-required range (below 0x8000) that this
/// codec does not understand are collected separately, a receiver must not
/// process a message carrying any of them.
#[derive(Debug, Clone)]
pub struct Attributes {
    items: Vec<(AttributeType, Range<usize>)>,
    unknown_required: Vec<u16>,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            items: Vec::with_capacity(20),
            unknown_required: Vec::new(),
        }
    }
}

impl Attributes {
    pub fn append(&mut self, kind: AttributeType, range: Range<usize>) {
        self.items.push((kind, range));
    }

    pub fn append_unknown(&mut self, kind: u16) {
        if kind < 0x8000 {
            self.unknown_required.push(kind);
        }
    }

    pub fn get(&self, kind: &AttributeType) -> Option<Range<usize>> {
        self.items
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, v)| v.clone())
    }

    pub fn get_all<'a>(
        &'a self,
        kind: &'a AttributeType,
    ) -> impl Iterator<Item = &'a Range<usize>> {
        self.items
            .iter()
            .filter(move |(k, _)| k == kind)
            .map(|(_, v)| v)
    }

    pub fn unknown_required(&self) -> &[u16] {
        &self.unknown_required
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.unknown_required.clear();
    }
}

/// Reusable decoder.
///
/// # Test
///
/// ```
/// use sipturn_codec::*;
///
/// let buffer = [
///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
/// ];
///
/// let mut decoder = Decoder::default();
/// assert!(decoder.decode(&buffer).unwrap().into_message().is_some());
///
/// let channel = [0x40u8, 0x00, 0x00, 0x02, 0xaa, 0xbb];
/// let data = decoder.decode(&channel).unwrap().into_channel_data().unwrap();
/// assert_eq!(data.number(), 0x4000);
/// assert_eq!(data.as_bytes(), &[0xaa, 0xbb]);
/// ```
#[derive(Default)]
pub struct Decoder(Attributes);

impl Decoder {
    pub fn decode<'a>(&'a mut self, bytes: &'a [u8]) -> Result<DecodeResult<'a>, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(if bytes[0] >> 6 == 0 {
            self.0.clear();

            DecodeResult::Message(Message::decode(bytes, &mut self.0)?)
        } else {
            DecodeResult::ChannelData(ChannelData::decode(bytes)?)
        })
    }

    /// Size of the frame starting at `bytes`, read from its 4-byte header.
    ///
    /// On stream transports ChannelData frames are padded to a multiple of
    /// four bytes, STUN messages always are.
    ///
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::Decoder;
    ///
    /// assert_eq!(Decoder::message_size(&[0x00, 0x01, 0x00, 0x08], false).unwrap(), 28);
    /// assert_eq!(Decoder::message_size(&[0x40, 0x01, 0x00, 0x05], false).unwrap(), 9);
    /// assert_eq!(Decoder::message_size(&[0x40, 0x01, 0x00, 0x05], true).unwrap(), 12);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(if bytes[0] >> 6 == 0 {
            Message::message_size(bytes)?
        } else {
            ChannelData::message_size(bytes, is_tcp)?
        })
    }
}
