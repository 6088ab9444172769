//! Error types for scanbridge.
//!
//! [`BridgeError`] covers everything that can go wrong between the caller and
//! a worker process. [`DomainError`] is the subset produced by the backing
//! subsystems (driver, mail, renderer); it is the only kind that crosses the
//! process boundary, and it comes back out as the same variant on the caller's
//! side whether the operation ran in-process or inside a worker.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by a backing subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Device is busy: {0}")]
    DeviceBusy(String),

    #[error("Device is offline: {0}")]
    DeviceOffline(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No pages are in the feeder: {0}")]
    NoPages(String),

    #[error("Paper jam: {0}")]
    PaperJam(String),

    #[error("Mail client unavailable: {0}")]
    MailUnavailable(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Internal(String),
}

/// Wire tag for a [`DomainError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceBusy,
    DeviceOffline,
    DeviceNotFound,
    NoPages,
    PaperJam,
    MailUnavailable,
    NotSupported,
    InvalidInput,
    Internal,
}

impl DomainError {
    /// Rebuild a domain error from its wire kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::DeviceBusy => Self::DeviceBusy(message),
            ErrorKind::DeviceOffline => Self::DeviceOffline(message),
            ErrorKind::DeviceNotFound => Self::DeviceNotFound(message),
            ErrorKind::NoPages => Self::NoPages(message),
            ErrorKind::PaperJam => Self::PaperJam(message),
            ErrorKind::MailUnavailable => Self::MailUnavailable(message),
            ErrorKind::NotSupported => Self::NotSupported(message),
            ErrorKind::InvalidInput => Self::InvalidInput(message),
            ErrorKind::Internal => Self::Internal(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceBusy(_) => ErrorKind::DeviceBusy,
            Self::DeviceOffline(_) => ErrorKind::DeviceOffline,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::NoPages(_) => ErrorKind::NoPages,
            Self::PaperJam(_) => ErrorKind::PaperJam,
            Self::MailUnavailable(_) => ErrorKind::MailUnavailable,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message without the variant prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            Self::DeviceBusy(m)
            | Self::DeviceOffline(m)
            | Self::DeviceNotFound(m)
            | Self::NoPages(m)
            | Self::PaperJam(m)
            | Self::MailUnavailable(m)
            | Self::NotSupported(m)
            | Self::InvalidInput(m)
            | Self::Internal(m) => m,
        }
    }
}

/// Main error type for scanbridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Worker executable '{name}' not found (searched: {searched})")]
    WorkerNotFound { name: String, searched: String },

    #[error("Failed to launch worker: {0}")]
    LaunchFailed(String),

    #[error("Worker handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Worker protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Worker endpoint not ready: {0}")]
    EndpointNotReady(String),

    #[error("Worker transport error: {0}")]
    Transport(String),

    #[error("Worker pool has been shut down")]
    PoolShutDown,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Failures that happened before a worker ever accepted a request.
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            Self::WorkerNotFound { .. }
                | Self::LaunchFailed(_)
                | Self::HandshakeFailed(_)
                | Self::ProtocolViolation(_)
        )
    }

    /// The domain error carried by this error, if any.
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for scanbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
