use bytes::{BufMut, BytesMut};

use super::Error;

/// The ChannelData message is used to carry application data between the
/// client and the server.
///
/// The Channel Number field specifies the number of the channel on which
/// the data is traveling, and thus, the address of the peer that is
/// sending or is to receive the data. The Length field specifies the
/// length in bytes of the application data field. Over stream transports
/// the whole message is padded to a multiple of four bytes, the padding
/// is not counted in the Length field.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Channel Number        |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// /                       Application Data                        /
/// /                                                               /
/// |                                                               |
/// |                               +-------------------------------+
/// |                               |
/// +-------------------------------+
/// ```
pub struct ChannelData<'a> {
    pub bytes: &'a [u8],
    pub number: u16,
}

impl<'a> ChannelData<'a> {
    pub const MIN_NUMBER: u16 = 0x4000;
    pub const MAX_NUMBER: u16 = 0x7FFF;

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// # Test
    ///
    /// ```
    /// use sipturn_codec::channel_data::ChannelData;
    ///
    /// let buffer = [0x40u8, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03];
    ///
    /// assert_eq!(ChannelData::message_size(&buffer, false).unwrap(), 7);
    /// assert_eq!(ChannelData::message_size(&buffer, true).unwrap(), 8);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        if !(1..3).contains(&(bytes[0] >> 6)) {
            return Err(Error::InvalidInput);
        }

        let mut size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize + 4;
        if is_tcp && (size % 4) > 0 {
            size += 4 - (size % 4);
        }

        Ok(size)
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sipturn_codec::channel_data::ChannelData;
    ///
    /// let mut bytes = BytesMut::new();
    /// ChannelData { number: 0x4001, bytes: &[1, 2, 3] }.encode(&mut bytes, true);
    ///
    /// assert_eq!(&bytes[..], &[0x40, 0x01, 0x00, 0x03, 1, 2, 3, 0]);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut, is_tcp: bool) {
        bytes.clear();
        bytes.put_u16(self.number);
        bytes.put_u16(self.bytes.len() as u16);
        bytes.extend_from_slice(self.bytes);

        let padding = crate::message::alignment_32(self.bytes.len());
        if is_tcp && padding > 0 {
            bytes.put(&[0u8; 3][..padding]);
        }
    }

    /// Trailing padding after the declared length is ignored.
    ///
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::channel_data::ChannelData;
    ///
    /// let data = ChannelData::decode(&[0x7f, 0xff, 0x00, 0x01, 0xaa, 0x00, 0x00, 0x00]).unwrap();
    ///
    /// assert_eq!(data.number(), 0x7fff);
    /// assert_eq!(data.as_bytes(), &[0xaa]);
    ///
    /// assert!(ChannelData::decode(&[0x40, 0x00, 0x00, 0x09, 0xaa]).is_err());
    /// assert!(ChannelData::decode(&[0x80, 0x00, 0x00, 0x00]).is_err());
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let number = u16::from_be_bytes(bytes[..2].try_into()?);
        if !(Self::MIN_NUMBER..=Self::MAX_NUMBER).contains(&number) {
            return Err(Error::InvalidInput);
        }

        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if size > bytes.len() - 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            bytes: &bytes[4..4 + size],
            number,
        })
    }
}
