//! SIP dialog usage manager.
//!
//! [RFC3261]: https://tools.ietf.org/html/rfc3261
//!
//! The [`DialogUsageManager`] demultiplexes parsed SIP messages to dialog
//! sets, dialogs and the usages living in them: invite sessions,
//! subscriptions, registrations and out-of-dialog requests. It owns every
//! piece of protocol state and is driven from a single context: the
//! application feeds it messages and timer ticks, takes the messages it
//! produced from the outbox and hands them to a transaction layer.

pub mod auth;
pub mod dialog;
pub mod dialog_set;
pub mod handler;
pub mod invite;
pub mod message;
pub mod out_of_dialog;
pub mod profile;
pub mod registration;
pub mod subscription;
pub mod timer;
pub mod usage_manager;

pub use self::{
    dialog::{DialogId, DialogSetId},
    invite::{InviteState, PendingOffer, Role, TerminatedReason},
    message::{Body, Method, Sdp, SipMessage},
    profile::Profile,
    usage_manager::DialogUsageManager,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The handle does not refer to a live usage.
    UnknownHandle,
    /// The operation is not allowed in the current state, nothing was sent.
    InvalidState,
    MissingContact,
    /// Contact is not a single sip or sips URI.
    BadContact,
    InvalidUri,
    MissingHeader(&'static str),
    AlreadyPending,
    Terminated,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHeader(name) => write!(f, "missing header: {name}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

macro_rules! handle {
    ($($(#[$meta:meta])* $name:ident,)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub(crate) u64);
        )*
    };
}

handle! {
    /// Weak reference to an invite session, stays valid after the session
    /// is gone but then every operation fails.
    InviteSessionHandle,
    ClientRegistrationHandle,
    ServerRegistrationHandle,
    ClientSubscriptionHandle,
    ServerSubscriptionHandle,
    OutOfDialogHandle,
}
