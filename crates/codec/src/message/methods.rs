use crate::Error;

/// STUN message class, encoded in bits C1 (0x0100) and C0 (0x0010) of the
/// message type.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum MethodType {
    Request,
    Indication,
    Response,
    Error,
}

impl MethodType {
    const fn bits(self) -> u16 {
        match self {
            Self::Request => 0x0000,
            Self::Indication => 0x0010,
            Self::Response => 0x0100,
            Self::Error => 0x0110,
        }
    }
}

/// STUN/TURN methods known to the client.
///
/// The Send and Data methods only exist as indications.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Method {
    Binding(MethodType),
    SharedSecret(MethodType),
    Allocate(MethodType),
    Refresh(MethodType),
    CreatePermission(MethodType),
    ChannelBind(MethodType),
    SendIndication,
    DataIndication,
}

pub const BINDING_REQUEST: Method = Method::Binding(MethodType::Request);
pub const BINDING_INDICATION: Method = Method::Binding(MethodType::Indication);
pub const BINDING_RESPONSE: Method = Method::Binding(MethodType::Response);
pub const BINDING_ERROR: Method = Method::Binding(MethodType::Error);
pub const SHARED_SECRET_REQUEST: Method = Method::SharedSecret(MethodType::Request);
pub const SHARED_SECRET_RESPONSE: Method = Method::SharedSecret(MethodType::Response);
pub const SHARED_SECRET_ERROR: Method = Method::SharedSecret(MethodType::Error);
pub const ALLOCATE_REQUEST: Method = Method::Allocate(MethodType::Request);
pub const ALLOCATE_RESPONSE: Method = Method::Allocate(MethodType::Response);
pub const ALLOCATE_ERROR: Method = Method::Allocate(MethodType::Error);
pub const REFRESH_REQUEST: Method = Method::Refresh(MethodType::Request);
pub const REFRESH_RESPONSE: Method = Method::Refresh(MethodType::Response);
pub const REFRESH_ERROR: Method = Method::Refresh(MethodType::Error);
pub const CREATE_PERMISSION_REQUEST: Method = Method::CreatePermission(MethodType::Request);
pub const CREATE_PERMISSION_RESPONSE: Method = Method::CreatePermission(MethodType::Response);
pub const CREATE_PERMISSION_ERROR: Method = Method::CreatePermission(MethodType::Error);
pub const CHANNEL_BIND_REQUEST: Method = Method::ChannelBind(MethodType::Request);
pub const CHANNEL_BIND_RESPONSE: Method = Method::ChannelBind(MethodType::Response);
pub const CHANNEL_BIND_ERROR: Method = Method::ChannelBind(MethodType::Error);
pub const SEND_INDICATION: Method = Method::SendIndication;
pub const DATA_INDICATION: Method = Method::DataIndication;

impl Method {
    pub fn kind(&self) -> MethodType {
        match self {
            Self::Binding(kind)
            | Self::SharedSecret(kind)
            | Self::Allocate(kind)
            | Self::Refresh(kind)
            | Self::CreatePermission(kind)
            | Self::ChannelBind(kind) => *kind,
            Self::SendIndication | Self::DataIndication => MethodType::Indication,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind() == MethodType::Request
    }

    pub fn is_indication(&self) -> bool {
        self.kind() == MethodType::Indication
    }

    /// Success or error response.
    pub fn is_response(&self) -> bool {
        matches!(self.kind(), MethodType::Response | MethodType::Error)
    }

    pub fn is_error(&self) -> bool {
        self.kind() == MethodType::Error
    }

    /// The same method with another class, `None` for the indication-only
    /// methods.
    ///
    /// # Test
    ///
    /// ```
    /// use sipturn_codec::message::methods::*;
    ///
    /// assert_eq!(ALLOCATE_REQUEST.with_kind(MethodType::Error), Some(ALLOCATE_ERROR));
    /// assert_eq!(SEND_INDICATION.with_kind(MethodType::Response), None);
    /// ```
    pub fn with_kind(&self, kind: MethodType) -> Option<Method> {
        Some(match self {
            Self::Binding(_) => Self::Binding(kind),
            Self::SharedSecret(_) => Self::SharedSecret(kind),
            Self::Allocate(_) => Self::Allocate(kind),
            Self::Refresh(_) => Self::Refresh(kind),
            Self::CreatePermission(_) => Self::CreatePermission(kind),
            Self::ChannelBind(_) => Self::ChannelBind(kind),
            Self::SendIndication | Self::DataIndication => return None,
        })
    }

    pub fn error(&self) -> Option<Method> {
        self.with_kind(MethodType::Error)
    }

    fn number(&self) -> u16 {
        match self {
            Self::Binding(_) => 0x0001,
            Self::SharedSecret(_) => 0x0002,
            Self::Allocate(_) => 0x0003,
            Self::Refresh(_) => 0x0004,
            Self::SendIndication => 0x0006,
            Self::DataIndication => 0x0007,
            Self::CreatePermission(_) => 0x0008,
            Self::ChannelBind(_) => 0x0009,
        }
    }
}

/// # Test
///
/// ```
/// use sipturn_codec::message::methods::*;
///
/// assert_eq!(Method::try_from(0x0001).unwrap(), BINDING_REQUEST);
/// assert_eq!(Method::try_from(0x0011).unwrap(), BINDING_INDICATION);
/// assert_eq!(Method::try_from(0x0113).unwrap(), ALLOCATE_ERROR);
/// assert_eq!(Method::try_from(0x0016).unwrap(), SEND_INDICATION);
/// assert!(Method::try_from(0x0106).is_err());
/// ```
impl TryFrom<u16> for Method {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let kind = match value & 0x0110 {
            0x0000 => MethodType::Request,
            0x0010 => MethodType::Indication,
            0x0100 => MethodType::Response,
            _ => MethodType::Error,
        };

        Ok(match (value & !0x0110, kind) {
            (0x0001, _) => Self::Binding(kind),
            (0x0002, _) => Self::SharedSecret(kind),
            (0x0003, _) => Self::Allocate(kind),
            (0x0004, _) => Self::Refresh(kind),
            (0x0006, MethodType::Indication) => Self::SendIndication,
            (0x0007, MethodType::Indication) => Self::DataIndication,
            (0x0008, _) => Self::CreatePermission(kind),
            (0x0009, _) => Self::ChannelBind(kind),
            _ => return Err(Error::UnknownMethod),
        })
    }
}

/// # Test
///
/// ```
/// use sipturn_codec::message::methods::*;
///
/// assert_eq!(u16::from(CHANNEL_BIND_RESPONSE), 0x0109);
/// assert_eq!(u16::from(DATA_INDICATION), 0x0017);
/// assert_eq!(u16::from(SHARED_SECRET_REQUEST), 0x0002);
/// ```
impl From<Method> for u16 {
    fn from(value: Method) -> Self {
        value.number() | value.kind().bits()
    }
}
