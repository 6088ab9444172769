//! Wire protocol between the host and a worker process.
//!
//! Messages are JSON-serialized and newline-delimited. Every request gets
//! exactly one response, except `scan`, which gets zero or more `scan_event`
//! responses followed by either `scan_complete` or `error`.

use crate::error::{DomainError, ErrorKind};
use crate::types::{
    DeviceConfig, EmailMessage, ImageData, MailResult, ScanDevice, ScanOptions, ScannedImage,
    WindowHandle,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// First line a worker writes to stdout when it is listening.
pub const HANDSHAKE_READY: &str = "ready";

/// First line a worker writes to stdout when it failed to start.
pub const HANDSHAKE_ERROR: &str = "error";

/// Request from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    /// Establish the staging directory for large image payloads.
    Init { staging_path: Option<PathBuf> },

    GetDeviceList { options: ScanOptions },

    Scan { options: ScanOptions },

    SendMail { message: EmailMessage },

    CanLoadMail { client_name: Option<String> },

    RenderThumbnail { image: ImageData, size: u32 },

    RenderPdf { path: PathBuf, dpi: f32 },

    NativeDeviceUi {
        device_id: String,
        window: WindowHandle,
    },

    /// Graceful shutdown request.
    Stop,
}

/// One event in a scan stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanEvent {
    PageStart,
    Progress { value: f64 },
    Image { image: ScannedImage },
}

/// Structured error payload carried across the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&DomainError> for RemoteError {
    fn from(err: &DomainError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

impl From<RemoteError> for DomainError {
    fn from(err: RemoteError) -> Self {
        DomainError::new(err.kind, err.message)
    }
}

/// Response from worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkResponse {
    Initialized,

    DeviceList {
        devices: Vec<ScanDevice>,
    },

    ScanEvent {
        event: ScanEvent,
    },

    /// Normal end of a scan stream.
    ScanComplete,

    MailSent {
        result: MailResult,
    },

    MailAvailability {
        loaded: bool,
    },

    Thumbnail {
        #[serde(with = "crate::types::base64_bytes")]
        bytes: Vec<u8>,
    },

    PdfPage {
        #[serde(with = "crate::types::base64_bytes")]
        bytes: Vec<u8>,
    },

    NativeUi {
        config: Option<DeviceConfig>,
    },

    Stopped,

    /// Failure of the current request. Terminates a scan stream.
    Error {
        error: RemoteError,
    },
}

impl WorkRequest {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::GetDeviceList { .. } => "get_device_list",
            Self::Scan { .. } => "scan",
            Self::SendMail { .. } => "send_mail",
            Self::CanLoadMail { .. } => "can_load_mail",
            Self::RenderThumbnail { .. } => "render_thumbnail",
            Self::RenderPdf { .. } => "render_pdf",
            Self::NativeDeviceUi { .. } => "native_device_ui",
            Self::Stop => "stop",
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkRequest serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    pub fn error(err: &DomainError) -> Self {
        Self::Error { error: err.into() }
    }

    pub fn event(event: ScanEvent) -> Self {
        Self::ScanEvent { event }
    }

    /// Whether this response ends the current request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ScanEvent { .. })
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkResponse serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
