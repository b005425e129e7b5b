use common_net::message::{ErrorCode, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Validation(String),
    #[error("authenticate before sending events")]
    NotAuthenticated,
    #[error("connection is already authenticated")]
    AlreadyAuthenticated,
    #[error("unknown connection")]
    UnknownConnection,
}

impl GatewayError {
    /// Client-facing code, `None` when nothing should be sent back.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Protocol(ProtocolError::UnknownEvent(_)) | Self::UnknownConnection => None,
            Self::Protocol(_) | Self::Validation(_) => Some(ErrorCode::InvalidPayload),
            Self::NotAuthenticated => Some(ErrorCode::NotAuthenticated),
            Self::AlreadyAuthenticated => Some(ErrorCode::AlreadyAuthenticated),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Protocol(ProtocolError::Malformed(_)) => "malformed",
            Self::Protocol(ProtocolError::UnknownEvent(_)) => "unknown_event",
            Self::Protocol(ProtocolError::InvalidPayload { .. }) | Self::Validation(_) => "invalid_payload",
            Self::NotAuthenticated => "not_authenticated",
            Self::AlreadyAuthenticated => "already_authenticated",
            Self::UnknownConnection => "unknown_connection",
        }
    }
}
