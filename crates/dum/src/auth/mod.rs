//! Digest authentication of requests sent and received by the manager.
//!
//! [RFC2617]: https://tools.ietf.org/html/rfc2617

pub mod client;
pub mod digest;
pub mod server;

pub use self::{
    client::{ClientAuthManager, Credential, CredentialStore},
    server::{AuthLookup, AuthOutcome, ServerAuthConfig, ServerAuthManager, UserAuthInfo, UserAuthStore},
};
