use crate::message::{NameAddr, Uri};

/// Settings of a [`crate::DialogUsageManager`], fixed at construction.
#[derive(Debug, Clone)]
pub struct Profile {
    /// From of the requests the manager creates.
    pub identity: NameAddr,
    /// Contact put into dialog forming requests and responses.
    pub contact: NameAddr,
    /// Re-key an early dialog when a response carries a new To tag but the
    /// same remote target. Off means strict RFC 3261 matching.
    pub loose_to_tag_matching: bool,
    /// Requested session interval in seconds, 0 disables session timers.
    pub session_expires: u32,
    pub min_se: u32,
    pub register_expires: u32,
    /// Smallest registration interval accepted from clients.
    pub min_register_expires: u32,
    pub subscription_expires: u32,
    /// Advertise and use UPDATE.
    pub allow_update: bool,
}

impl Default for Profile {
    fn default() -> Self {
        let uri = Uri::sip(Some("anonymous"), "localhost");

        Self {
            identity: NameAddr::new(uri.clone()),
            contact: NameAddr::new(uri),
            loose_to_tag_matching: false,
            session_expires: 1800,
            min_se: 90,
            register_expires: 3600,
            min_register_expires: 60,
            subscription_expires: 3600,
            allow_update: true,
        }
    }
}
