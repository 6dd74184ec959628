pub mod attributes;
pub mod methods;

use crate::{
    Attributes, Error,
    crypto::{IntegrityKey, fingerprint, hmac_sha1},
    message::{
        attributes::{Attribute, AttributeType, MessageIntegrity},
        methods::Method,
    },
};

use bytes::{BufMut, BytesMut};

pub const MAGIC_NUMBER: u32 = 0x2112A442;

/// Writes one STUN message into a reusable buffer.
///
/// The header length is only correct after [`MessageEncoder::flush`].
pub struct MessageEncoder<'a> {
    token: &'a [u8],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    pub fn new(method: Method, token: &'a [u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(token.as_slice());

        Self { bytes, token }
    }

    /// Start a message sharing the transaction id of `reader`, used to
    /// answer a request.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sipturn_codec::message::methods::*;
    /// use sipturn_codec::message::*;
    /// use sipturn_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let mut buf = BytesMut::new();
    /// let request = Message::decode(&buffer[..], &mut attributes).unwrap();
    /// MessageEncoder::extend(BINDING_RESPONSE, &request, &mut buf)
    ///     .flush(None)
    ///     .unwrap();
    ///
    /// assert_eq!(&buf[..2], &[0x01, 0x01]);
    /// assert_eq!(&buf[2..], &buffer[2..]);
    /// ```
    pub fn extend(method: Method, reader: &Message<'a>, bytes: &'a mut BytesMut) -> Self {
        let token = reader.token();

        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(token);

        Self { bytes, token }
    }

    /// Append one attribute, padded to a multiple of four bytes.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sipturn_codec::message::attributes::*;
    /// use sipturn_codec::message::methods::*;
    /// use sipturn_codec::message::*;
    ///
    /// let token = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let expected = [
    ///     0x00u8, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00,
    ///     0x05, 0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let mut buf = BytesMut::new();
    /// let mut message = MessageEncoder::new(BINDING_REQUEST, &token, &mut buf);
    /// message.append::<UserName>("panda");
    /// message.flush(None).unwrap();
    ///
    /// assert_eq!(&buf[..], &expected[..]);
    /// ```
    pub fn append<'c, T: Attribute<'c>>(&'c mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE as u16);

        // reserve the length field, it is known once the value is written.
        let os = self.bytes.len();
        self.bytes.put_u16(0);
        T::serialize(value, self.bytes, self.token);

        let size = self.bytes.len() - os - 2;
        self.bytes[os..os + 2].copy_from_slice(&(size as u16).to_be_bytes());

        let psize = alignment_32(size);
        if psize > 0 {
            self.bytes.put(&[0u8; 3][..psize]);
        }
    }

    /// Write the final length into the header, then MESSAGE-INTEGRITY and
    /// FINGERPRINT when a key is given.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sipturn_codec::crypto::IntegrityKey;
    /// use sipturn_codec::message::methods::*;
    /// use sipturn_codec::message::*;
    ///
    /// let token = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let result = [
    ///     0, 1, 0, 32, 33, 18, 164, 66, 114, 109, 73, 66, 114, 82, 100, 72, 87,
    ///     98, 75, 43, 0, 8, 0, 20, 69, 14, 110, 68, 82, 30, 232, 222, 44, 240,
    ///     250, 182, 156, 92, 25, 23, 152, 198, 217, 222, 128, 40, 0, 4, 74, 165,
    ///     171, 86,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// MessageEncoder::new(BINDING_REQUEST, &token, &mut buf)
    ///     .flush(Some(&IntegrityKey::long_term("panda", "panda", "raspberry")))
    ///     .unwrap();
    ///
    /// assert_eq!(&buf[..], &result);
    /// ```
    pub fn flush(&mut self, key: Option<&IntegrityKey>) -> Result<(), Error> {
        self.set_len(self.bytes.len() - 20);

        if let Some(it) = key {
            self.checksum(it)?;
        }

        Ok(())
    }

    fn checksum(&mut self, key: &IntegrityKey) -> Result<(), Error> {
        if self.bytes.len() < 20 {
            return Err(Error::InvalidInput);
        }

        let len = self.bytes.len();

        // the length covers MESSAGE-INTEGRITY while it is computed.
        self.set_len(len + 4);
        {
            let hmac = hmac_sha1(key, &[&self.bytes[..]])?;
            self.bytes.put_u16(AttributeType::MessageIntegrity as u16);
            self.bytes.put_u16(20);
            self.bytes.put(hmac.as_slice());
        }

        self.set_len(len + 4 + 8);
        {
            let fingerprint = fingerprint(&self.bytes[..]);
            self.bytes.put_u16(AttributeType::Fingerprint as u16);
            self.bytes.put_u16(4);
            self.bytes.put_u32(fingerprint);
        }

        Ok(())
    }

    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
    }
}

/// A decoded STUN message borrowing the source buffer.
pub struct Message<'a> {
    method: Method,
    bytes: &'a [u8],
    /// offset of the MESSAGE-INTEGRITY attribute, or of the end of the
    /// attributes when there is none.
    integrity_offset: u16,
    has_integrity: bool,
    attributes: &'a Attributes,
}

impl<'a> Message<'a> {
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// message transaction id.
    #[inline]
    pub fn token(&self) -> &'a [u8] {
        &self.bytes[8..20]
    }

    /// Transaction id as a fixed array, suitable as a map key.
    pub fn transaction_id(&self) -> [u8; 12] {
        let mut id = [0u8; 12];
        id.copy_from_slice(self.token());
        id
    }

    /// First value of an attribute, `None` when absent or malformed.
    ///
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::message::attributes::*;
    /// use sipturn_codec::message::*;
    /// use sipturn_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self.attributes.get(&T::TYPE)?;
        T::deserialize(&self.bytes[range], self.token()).ok()
    }

    /// All well formed values of a repeated attribute.
    pub fn get_all<T: Attribute<'a>>(&self) -> impl Iterator<Item = T::Item> {
        self.attributes
            .get_all(&T::TYPE)
            .filter_map(|it| T::deserialize(&self.bytes[it.clone()], self.token()).ok())
    }

    /// Comprehension-required attribute types this codec does not know.
    pub fn unknown_required(&self) -> &'a [u16] {
        self.attributes.unknown_required()
    }

    pub fn has_integrity(&self) -> bool {
        self.has_integrity
    }

    /// Verify MESSAGE-INTEGRITY with the given key.
    ///
    /// The HMAC covers the header, with the length field rewritten to end
    /// just after the integrity attribute, and every attribute before it.
    ///
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::crypto::IntegrityKey;
    /// use sipturn_codec::message::*;
    /// use sipturn_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x03, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x64, 0x4f, 0x5a,
    ///     0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x00, 0x19, 0x00,
    ///     0x04, 0x11, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x05, 0x70, 0x61, 0x6e,
    ///     0x64, 0x61, 0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x09, 0x72, 0x61, 0x73,
    ///     0x70, 0x62, 0x65, 0x72, 0x72, 0x79, 0x00, 0x00, 0x00, 0x00, 0x15, 0x00,
    ///     0x10, 0x31, 0x63, 0x31, 0x33, 0x64, 0x32, 0x62, 0x32, 0x34, 0x35, 0x62,
    ///     0x33, 0x61, 0x37, 0x33, 0x34, 0x00, 0x08, 0x00, 0x14, 0xd6, 0x78, 0x26,
    ///     0x99, 0x0e, 0x15, 0x56, 0x15, 0xe5, 0xf4, 0x24, 0x74, 0xe2, 0x3c, 0x26,
    ///     0xc5, 0xb1, 0x03, 0xb2, 0x6d,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert!(message.checksum(&IntegrityKey::long_term("panda", "panda", "raspberry")).is_ok());
    /// assert!(message.checksum(&IntegrityKey::long_term("panda", "wrong", "raspberry")).is_err());
    /// ```
    pub fn checksum(&self, key: &IntegrityKey) -> Result<(), Error> {
        if !self.has_integrity {
            return Err(Error::NotFoundIntegrity);
        }

        let integrity = self.get::<MessageIntegrity>().ok_or(Error::NotFoundIntegrity)?;

        let size_buf = (self.integrity_offset + 4).to_be_bytes();
        let body = [
            &self.bytes[0..2],
            &size_buf,
            &self.bytes[4..self.integrity_offset as usize],
        ];

        if integrity != hmac_sha1(key, &body)?.as_slice() {
            return Err(Error::IntegrityFailed);
        }

        Ok(())
    }

    /// Decode a message, attributes past the declared length are ignored.
    ///
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::message::methods::*;
    /// use sipturn_codec::message::*;
    /// use sipturn_codec::*;
    ///
    /// let buffer: [u8; 28] = [
    ///     0x00, 0x01, 0x00, 0x08, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x31, 0x00, 0x04,
    ///     0x00, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(message.method(), BINDING_REQUEST);
    /// assert_eq!(message.unknown_required(), &[0x0031]);
    /// ```
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        if bytes.len() < 20 {
            return Err(Error::InvalidInput);
        }

        let method = Method::try_from(u16::from_be_bytes(bytes[..2].try_into()?))?;

        let len = u16::from_be_bytes(bytes[2..4].try_into()?) as usize + 20;
        if bytes.len() < len {
            return Err(Error::InvalidInput);
        }

        if bytes[4..8] != MAGIC_NUMBER.to_be_bytes() {
            return Err(Error::NotFoundMagicNumber);
        }

        let mut has_integrity = false;
        let mut integrity_offset = len as u16;
        let mut offset = 20;

        while offset + 4 <= len {
            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            let start = offset;
            offset += 4;
            if offset + size > len {
                break;
            }

            let range = offset..(offset + size);
            offset += size + alignment_32(size);

            // attributes after MESSAGE-INTEGRITY, other than FINGERPRINT, are
            // not covered by it and are ignored.
            if has_integrity && key != AttributeType::Fingerprint as u16 {
                continue;
            }

            match AttributeType::try_from(key) {
                Ok(kind) => {
                    if kind == AttributeType::MessageIntegrity {
                        has_integrity = true;
                        integrity_offset = start as u16;
                    }

                    attributes.append(kind, range);
                }
                Err(_) => attributes.append_unknown(key),
            }
        }

        Ok(Self {
            method,
            bytes,
            integrity_offset,
            has_integrity,
            attributes,
        })
    }

    /// Total size of the message from its first four bytes.
    ///
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::message::*;
    ///
    /// assert_eq!(Message::message_size(&[0x00, 0x01, 0x00, 0x00]).unwrap(), 20);
    /// assert_eq!(Message::message_size(&[0x01, 0x13, 0x00, 0x10]).unwrap(), 36);
    /// assert!(Message::message_size(&[0x40, 0x00, 0x00, 0x00]).is_err());
    /// ```
    pub fn message_size(buffer: &[u8]) -> Result<usize, Error> {
        if buffer.len() < 4 || buffer[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes(buffer[2..4].try_into()?) as usize + 20)
    }
}

/// compute padding size.
///
/// attribute values are padded to a multiple of four bytes.
///
/// # Test
///
/// ```
/// use sipturn_codec::message::alignment_32;
///
/// assert_eq!(alignment_32(4), 0);
/// assert_eq!(alignment_32(0), 0);
/// assert_eq!(alignment_32(5), 3);
/// ```
#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    let range = size % 4;
    if size == 0 || range == 0 {
        return 0;
    }

    4 - range
}
