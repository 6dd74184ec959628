use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use crate::{Error, message::MAGIC_NUMBER};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum IpFamily {
    V4 = 0x01,
    V6 = 0x02,
}

/// Address attribute body shared by MAPPED-ADDRESS and the XOR'ed variants.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |0 0 0 0 0 0 0 0|    Family     |           Port                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                 Address (32 bits or 128 bits)                 |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy)]
pub struct XAddress;

impl XAddress {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sipturn_codec::message::attributes::address::XAddress;
    ///
    /// let token = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let addr = "192.168.1.2:51678".parse().unwrap();
    ///
    /// let mut buffer = BytesMut::new();
    /// XAddress::serialize(&addr, &token, &mut buffer, true);
    /// assert_eq!(&buffer[..], &[0x00, 0x01, 0xe8, 0x0c, 0xe1, 0xba, 0xa5, 0x40]);
    ///
    /// let mut buffer = BytesMut::new();
    /// XAddress::serialize(&addr, &token, &mut buffer, false);
    /// assert_eq!(&buffer[..], &[0x00, 0x01, 0xc9, 0x1e, 0xc0, 0xa8, 0x01, 0x02]);
    /// ```
    pub fn serialize<B: BufMut>(addr: &SocketAddr, token: &[u8], bytes: &mut B, is_xor: bool) {
        let addr = if is_xor { xor(addr, token) } else { *addr };

        bytes.put_u8(0);
        bytes.put_u8(match addr.ip() {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        } as u8);

        bytes.put_u16(addr.port());

        match addr.ip() {
            IpAddr::V4(ip) => bytes.put(&ip.octets()[..]),
            IpAddr::V6(ip) => bytes.put(&ip.octets()[..]),
        }
    }

    /// # Test
    ///
    /// ```
    /// use sipturn_codec::message::attributes::address::XAddress;
    ///
    /// let token = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let addr = XAddress::deserialize(
    ///     &[0x00, 0x01, 0xe8, 0x0c, 0xe1, 0xba, 0xa5, 0x40],
    ///     &token,
    ///     true,
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(addr, "192.168.1.2:51678".parse().unwrap());
    /// ```
    pub fn deserialize(mut bytes: &[u8], token: &[u8], is_xor: bool) -> Result<SocketAddr, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        bytes.advance(1);

        let family = IpFamily::try_from(bytes.get_u8()).map_err(|_| Error::InvalidInput)?;
        let port = bytes.get_u16();
        let ip = match family {
            IpFamily::V4 => IpAddr::V4(<[u8; 4]>::try_from(bytes)?.into()),
            IpFamily::V6 => IpAddr::V6(<[u8; 16]>::try_from(bytes)?.into()),
        };

        let addr = SocketAddr::new(ip, port);
        Ok(if is_xor { xor(&addr, token) } else { addr })
    }
}

/// XOR an address with the magic cookie, and for IPv6 with the cookie
/// followed by the transaction id. Applying it twice yields the input.
pub fn xor(addr: &SocketAddr, token: &[u8]) -> SocketAddr {
    let cookie = MAGIC_NUMBER.to_be_bytes();
    let ip = match addr.ip() {
        IpAddr::V4(it) => {
            let mut octets = it.octets();
            octets
                .iter_mut()
                .zip(cookie.iter())
                .for_each(|(b, k)| *b ^= k);

            IpAddr::V4(octets.into())
        }
        IpAddr::V6(it) => {
            let mut octets = it.octets();
            octets
                .iter_mut()
                .zip(cookie.iter().chain(token.iter()))
                .for_each(|(b, k)| *b ^= k);

            IpAddr::V6(octets.into())
        }
    };

    SocketAddr::new(ip, addr.port() ^ (MAGIC_NUMBER >> 16) as u16)
}
