//! Crate-wide error kinds (spec §7).
//!
//! Per-message protocol errors are *not* represented here — those are data
//! (`StatusCode`, see [`crate::protocol::messages`]) and never unwind a
//! session. `MashError` is reserved for faults that abort a whole operation:
//! starting the service, commissioning, or a renewal.

use std::fmt;

/// Top-level error kind returned from the device service's public API.
#[derive(Debug, thiserror::Error)]
pub enum MashError {
    #[error("device service has not been started")]
    NotStarted,

    #[error("device service is already started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("commissioning failed: {0}")]
    CommissionFailed(String),

    #[error("PASE authentication failed: {0}")]
    PaseFailed(String),

    #[error("timed out waiting for a pairing request")]
    PairingRequestTimeout,

    #[error("peer protocol version is incompatible: {0}")]
    IncompatibleVersion(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("zone slots full ({in_use}/{max})")]
    ZoneFull { in_use: usize, max: usize },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("session closed")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl MashError {
    pub fn commission_failed(reason: impl fmt::Display) -> Self {
        MashError::CommissionFailed(reason.to_string())
    }
}

/// `PaseFailed` always implies `CommissionFailed` (spec §7): any call site
/// that wants the coarser classification can match on this helper instead of
/// re-deriving it.
impl MashError {
    pub fn is_commission_failure(&self) -> bool {
        matches!(self, MashError::CommissionFailed(_) | MashError::PaseFailed(_))
    }
}

impl From<std::io::Error> for MashError {
    fn from(err: std::io::Error) -> Self {
        MashError::Transport(err.to_string())
    }
}

impl From<serde_cbor::Error> for MashError {
    fn from(err: serde_cbor::Error) -> Self {
        MashError::Codec(err.to_string())
    }
}

pub type MashResult<T> = Result<T, MashError>;
