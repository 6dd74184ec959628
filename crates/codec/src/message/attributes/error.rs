use num_enum::TryFromPrimitive;

/// Pack a three digit status into the ERROR-CODE layout, the hundreds digit
/// goes into the class byte and the remainder into the number byte.
///
/// # Test
///
/// ```
/// use sipturn_codec::message::attributes::error::{errno, status};
///
/// assert_eq!(errno(438), 0x0426);
/// assert_eq!(status(errno(438)), 438);
/// ```
pub const fn errno(code: u16) -> u16 {
    ((code / 100) << 8) | (code % 100)
}

/// Inverse of [`errno`].
pub const fn status(code: u16) -> u16 {
    (code >> 8) * 100 + (code & 0xFF)
}

/// Error codes the relay client produces or reacts to.
///
/// 401 and 438 drive the re-authentication of a request, 437 means the
/// allocation is gone on the server, 420 is answered to a Binding request
/// carrying unknown comprehension-required attributes.
#[repr(u16)]
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash, TryFromPrimitive)]
pub enum ErrorType {
    TryAlternate = errno(300),
    BadRequest = errno(400),
    Unauthorized = errno(401),
    Forbidden = errno(403),
    UnknownAttribute = errno(420),
    AllocationMismatch = errno(437),
    StaleNonce = errno(438),
    AddressFamilyNotSupported = errno(440),
    WrongCredentials = errno(441),
    UnsupportedTransportAddress = errno(442),
    PeerAddressFamilyMismatch = errno(443),
    AllocationQuotaReached = errno(486),
    ServerError = errno(500),
    InsufficientCapacity = errno(508),
}

impl ErrorType {
    pub const fn status(self) -> u16 {
        status(self as u16)
    }
}

impl From<ErrorType> for &'static str {
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::message::attributes::error::ErrorType;
    ///
    /// let err: &'static str = ErrorType::StaleNonce.into();
    /// assert_eq!(err, "Stale Nonce");
    /// ```
    #[rustfmt::skip]
    fn from(val: ErrorType) -> Self {
        match val {
            ErrorType::TryAlternate => "Try Alternate",
            ErrorType::BadRequest => "Bad Request",
            ErrorType::Unauthorized => "Unauthorized",
            ErrorType::Forbidden => "Forbidden",
            ErrorType::UnknownAttribute => "Unknown Attribute",
            ErrorType::AllocationMismatch => "Allocation Mismatch",
            ErrorType::StaleNonce => "Stale Nonce",
            ErrorType::AddressFamilyNotSupported => "Address Family not Supported",
            ErrorType::WrongCredentials => "Wrong Credentials",
            ErrorType::UnsupportedTransportAddress => "Unsupported Transport Address",
            ErrorType::PeerAddressFamilyMismatch => "Peer Address Family Mismatch",
            ErrorType::AllocationQuotaReached => "Allocation Quota Reached",
            ErrorType::ServerError => "Server Error",
            ErrorType::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}
