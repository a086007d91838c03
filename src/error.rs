//! Error taxonomy for the conductor (spec §7).
//!
//! Two tiers, matching the split between the teacher crate's hand-rolled
//! low-level `Error` (I/O, corruption, mmap sizing) and a higher-level
//! `thiserror` enum for control-plane outcomes. `ErrorCode` is the stable
//! wire-level discriminant sent to clients in an `Error` notification;
//! `Error` carries the Rust-side detail and converts to a code + message
//! pair at the dispatcher boundary.

use std::fmt;

/// Low-level failures from the mmap/counters/log-buffer primitives.
/// Kept narrow and hand-rolled, like the teacher's `core::Error`, because
/// these are infrastructure failures, not control-protocol outcomes.
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Corrupt(&'static str),
    Unsupported(&'static str),
    CapacityExceeded,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "io error: {err}"),
            StorageError::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            StorageError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            StorageError::CapacityExceeded => write!(f, "capacity exceeded"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value)
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// The wire-level error taxonomy from spec §7, sent to clients as
/// `Error(correlation_id, code, message)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidChannel = 1,
    UnknownPublication = 2,
    UnknownSubscription = 3,
    UnknownCounter = 4,
    ChannelEndpointError = 5,
    GenericControlProtocol = 6,
    InternalInvariantViolation = 7,
}

/// Control-plane errors. Each variant knows its own [`ErrorCode`] and
/// formats a client-facing message via `Display`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("unknown publication: registration_id={0}")]
    UnknownPublication(i64),

    #[error("unknown subscription: registration_id={0}")]
    UnknownSubscription(i64),

    #[error("unknown counter: registration_id={0}")]
    UnknownCounter(i64),

    #[error("channel endpoint error: {0}")]
    ChannelEndpointError(String),

    #[error("generic control protocol error: {0}")]
    GenericControlProtocol(String),

    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidChannel(_) => ErrorCode::InvalidChannel,
            Error::UnknownPublication(_) => ErrorCode::UnknownPublication,
            Error::UnknownSubscription(_) => ErrorCode::UnknownSubscription,
            Error::UnknownCounter(_) => ErrorCode::UnknownCounter,
            Error::ChannelEndpointError(_) => ErrorCode::ChannelEndpointError,
            Error::GenericControlProtocol(_) => ErrorCode::GenericControlProtocol,
            Error::InternalInvariantViolation(_) | Error::Storage(_) => {
                ErrorCode::InternalInvariantViolation
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
