use aws_lc_rs::hmac;
use md5::{Digest, Md5};

use crate::Error;

/// Key used to compute and verify the MESSAGE-INTEGRITY attribute.
///
/// With long-term credentials the key is `MD5(username ":" realm ":" password)`,
/// with short-term credentials it is the password itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntegrityKey(Vec<u8>);

impl IntegrityKey {
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::crypto::IntegrityKey;
    ///
    /// let key = IntegrityKey::long_term("panda", "panda", "raspberry");
    ///
    /// assert_eq!(
    ///     key.as_bytes(),
    ///     &[
    ///         0x3e, 0x2f, 0x79, 0x1e, 0x1f, 0x14, 0xd1, 0x73, 0xfc, 0x91, 0xff, 0x2f, 0x59, 0xb5,
    ///         0x0f, 0xd1,
    ///     ]
    /// );
    /// ```
    pub fn long_term(username: &str, password: &str, realm: &str) -> Self {
        Self(password_md5(username, password, realm).to_vec())
    }

    pub fn short_term(password: &str) -> Self {
        Self(password.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

pub fn hmac_sha1(key: &IntegrityKey, source: &[&[u8]]) -> Result<[u8; 20], Error> {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key.as_bytes());
    let mut ctx = hmac::Context::with_key(&key);

    for buf in source {
        ctx.update(buf);
    }

    let mut result = [0u8; 20];
    result.copy_from_slice(ctx.sign().as_ref());
    Ok(result)
}

/// CRC-32 of the message up to the FINGERPRINT attribute, XOR'ed with
/// 0x5354554e.
pub fn fingerprint(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes) ^ 0x5354_554e
}

pub fn password_md5(username: &str, password: &str, realm: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update([username, realm, password].join(":"));
    hasher.finalize().into()
}
