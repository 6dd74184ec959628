use std::net::SocketAddr;

use bytes::Bytes;

use crate::ErrorKind;

/// Result of a successful Allocate transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Server reflexive address, when the server reported one.
    pub reflexive: Option<SocketAddr>,
    pub relay: Option<SocketAddr>,
    /// Granted lifetime in seconds.
    pub lifetime: u32,
    pub bandwidth: u32,
    /// Non zero when the server reserved the next port for a later
    /// allocation.
    pub reservation_token: u64,
}

/// Callbacks of a [`crate::TurnAsyncSocket`].
///
/// Every callback runs on the socket task, one at a time and in the order
/// the events happened. All methods default to doing nothing.
#[allow(unused_variables)]
pub trait TurnAsyncSocketHandler: Send + Sync + 'static {
    fn on_connect_success(&self, connected: SocketAddr) {}

    fn on_connect_failure(&self, error: ErrorKind) {}

    fn on_shared_secret_success(&self, username: &str, password: &str) {}

    fn on_shared_secret_failure(&self, error: ErrorKind) {}

    /// `server` is the address the Binding request was sent to.
    fn on_bind_success(&self, reflexive: SocketAddr, server: SocketAddr) {}

    fn on_bind_failure(&self, error: ErrorKind, server: SocketAddr) {}

    fn on_allocation_success(&self, info: AllocationInfo) {}

    fn on_allocation_failure(&self, error: ErrorKind) {}

    /// A lifetime of zero means the allocation has been released.
    fn on_refresh_success(&self, lifetime: u32) {}

    fn on_refresh_failure(&self, error: ErrorKind) {}

    fn on_channel_bind_success(&self, channel: u16, peer: SocketAddr) {}

    fn on_channel_bind_failure(&self, error: ErrorKind, peer: SocketAddr) {}

    fn on_set_active_destination_success(&self) {}

    fn on_set_active_destination_failure(&self, error: ErrorKind) {}

    fn on_clear_active_destination_success(&self) {}

    fn on_clear_active_destination_failure(&self, error: ErrorKind) {}

    fn on_send_success(&self) {}

    fn on_send_failure(&self, error: ErrorKind) {}

    /// Data from a peer, or raw data when no allocation exists.
    fn on_receive_success(&self, source: SocketAddr, data: Bytes) {}

    fn on_receive_failure(&self, error: ErrorKind) {}

    fn on_incoming_bind_request_processed(&self, source: SocketAddr) {}

    /// The transport has been closed, either on request or after an I/O
    /// failure.
    fn on_closed(&self) {}
}
