use channel::ChannelError;
use shared::{
    domain::{ControllerKind, NameError},
    error::{DomainError, ErrorCode, ReplyError},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed endpoint name '{0}'")]
    MalformedEndpointName(String),
    #[error("unknown controller kind '{0}'")]
    UnknownControllerKind(String),
    #[error("controller kind '{0}' is already registered")]
    DuplicateKind(ControllerKind),
    #[error("endpoint '{0}' already has a live controller")]
    DuplicateEndpoint(String),
    #[error("channel '{0}' closed")]
    ChannelClosed(String),
    #[error("channel '{0}' is already bound to an event handler")]
    ChannelAlreadyBound(String),
    #[error("peer replied with {0}")]
    Remote(ReplyError),
}

impl From<NameError> for RouterError {
    fn from(value: NameError) -> Self {
        match value {
            NameError::Malformed(name) => RouterError::MalformedEndpointName(name),
            NameError::UnknownKind(kind) => RouterError::UnknownControllerKind(kind),
        }
    }
}

impl From<ChannelError> for RouterError {
    fn from(value: ChannelError) -> Self {
        match value {
            ChannelError::Closed(name) | ChannelError::NoListener(name) => {
                RouterError::ChannelClosed(name)
            }
            ChannelError::InboundTaken(name) => RouterError::ChannelAlreadyBound(name),
        }
    }
}

/// Lets a handler propagate a failed nested request with `?`.
impl From<RouterError> for DomainError {
    fn from(value: RouterError) -> Self {
        match value {
            RouterError::Remote(reply) => reply.into(),
            RouterError::ChannelClosed(name) => {
                DomainError::new(ErrorCode::Unavailable, format!("channel '{name}' closed"))
            }
            RouterError::InvalidArgument(message) => DomainError::invalid(message),
            other => DomainError::internal(other.to_string()),
        }
    }
}
