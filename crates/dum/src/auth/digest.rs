//! RFC 2617 digest computations, MD5 only.

use md5::{Digest, Md5};

/// Lowercase hex MD5 of the parts joined with ':'.
pub fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    hasher.update(parts.join(":"));

    hasher
        .finalize()
        .iter()
        .map(|it| format!("{it:02x}"))
        .collect()
}

pub fn a1(username: &str, realm: &str, password: &str) -> String {
    md5_hex(&[username, realm, password])
}

/// Request digest. With `qop` set to (nonce count, cnonce) the response
/// uses qop=auth, otherwise the RFC 2069 form.
pub fn response(
    a1: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<(&str, &str)>,
) -> String {
    let a2 = md5_hex(&[method, uri]);

    match qop {
        Some((nc, cnonce)) => md5_hex(&[a1, nonce, nc, cnonce, "auth", &a2]),
        None => md5_hex(&[a1, nonce, &a2]),
    }
}

/// Eight hex digit nonce count.
pub fn nonce_count(count: u32) -> String {
    format!("{count:08x}")
}
