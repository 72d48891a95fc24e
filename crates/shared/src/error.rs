use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    KeyLocked,
    PwdDialogCancel,
    NoRecipients,
    DecryptFailed,
    EncryptFailed,
    VerifyFailed,
    ImportFailed,
    Unavailable,
    UnknownAction,
    Internal,
}

impl ErrorCode {
    pub const ALL: &'static [ErrorCode] = &[
        ErrorCode::InvalidArgument,
        ErrorCode::NotFound,
        ErrorCode::KeyLocked,
        ErrorCode::PwdDialogCancel,
        ErrorCode::NoRecipients,
        ErrorCode::DecryptFailed,
        ErrorCode::EncryptFailed,
        ErrorCode::VerifyFailed,
        ErrorCode::ImportFailed,
        ErrorCode::Unavailable,
        ErrorCode::UnknownAction,
        ErrorCode::Internal,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_str() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::KeyLocked => "KEY_LOCKED",
            ErrorCode::PwdDialogCancel => "PWD_DIALOG_CANCEL",
            ErrorCode::NoRecipients => "NO_RECIPIENTS",
            ErrorCode::DecryptFailed => "DECRYPT_FAILED",
            ErrorCode::EncryptFailed => "ENCRYPT_FAILED",
            ErrorCode::VerifyFailed => "VERIFY_FAILED",
            ErrorCode::ImportFailed => "IMPORT_FAILED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::UnknownAction => "UNKNOWN_ACTION",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error record carried in the `error` field of a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ReplyError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Failure raised by a collaborator or a controller handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct DomainError {
    pub code: ErrorCode,
    pub message: String,
}

impl DomainError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }
}

impl From<DomainError> for ReplyError {
    fn from(value: DomainError) -> Self {
        Self {
            message: value.message,
            kind: value.code.as_str().to_string(),
        }
    }
}

impl From<ReplyError> for DomainError {
    fn from(value: ReplyError) -> Self {
        Self {
            code: ErrorCode::from_tag(&value.kind).unwrap_or(ErrorCode::Internal),
            message: value.message,
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(value: serde_json::Error) -> Self {
        Self::invalid(format!("malformed payload: {value}"))
    }
}
