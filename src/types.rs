//! Domain values that cross the process boundary.
//!
//! Everything here is plain data with serde derives. Live handles (native
//! image buffers, window handles, driver sessions) never cross; images travel
//! either as bytes or as a path into the staging directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Scanner driver family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    #[default]
    Virtual,
    Wia,
    Twain,
    Sane,
    Escl,
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Virtual => write!(f, "virtual"),
            Self::Wia => write!(f, "wia"),
            Self::Twain => write!(f, "twain"),
            Self::Sane => write!(f, "sane"),
            Self::Escl => write!(f, "escl"),
        }
    }
}

/// A scanner as reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanDevice {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub driver: Driver,
}

impl ScanDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, driver: Driver) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            driver,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitDepth {
    #[default]
    Color,
    Grayscale,
    BlackWhite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperSource {
    #[default]
    Flatbed,
    Feeder,
    Duplex,
}

/// Options for device enumeration and scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(default)]
    pub driver: Driver,
    #[serde(default)]
    pub device: Option<ScanDevice>,
    pub dpi: u32,
    #[serde(default)]
    pub bit_depth: BitDepth,
    #[serde(default)]
    pub source: PaperSource,
    /// Upper bound on pages to acquire (None = driver decides).
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            driver: Driver::Virtual,
            device: None,
            dpi: 200,
            bit_depth: BitDepth::Color,
            source: PaperSource::Flatbed,
            max_pages: None,
        }
    }
}

impl ScanOptions {
    pub fn for_device(device: ScanDevice) -> Self {
        Self {
            driver: device.driver,
            device: Some(device),
            ..Default::default()
        }
    }

    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = Some(pages);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Pnm,
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pnm => "pnm",
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }
}

/// Image bytes, either carried inline or left in the staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum ImageData {
    Inline {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    Staged {
        path: PathBuf,
    },
}

impl ImageData {
    pub fn inline(bytes: Vec<u8>) -> Self {
        Self::Inline { bytes }
    }

    pub fn staged(path: impl Into<PathBuf>) -> Self {
        Self::Staged { path: path.into() }
    }

    /// Read the image bytes, loading from disk for staged images.
    pub fn load(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Inline { bytes } => Ok(bytes.clone()),
            Self::Staged { path } => std::fs::read(path),
        }
    }
}

/// One acquired page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedImage {
    /// 1-based page number within the scan.
    pub page: u32,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub data: ImageData,
}

/// Opaque reference to a caller-owned window, passed to native dialogs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(pub u64);

/// Settings captured by a driver's own configuration dialog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_props: BTreeMap<String, String>,
    pub item_props: BTreeMap<String, String>,
    pub item_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    #[default]
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecipient {
    #[serde(default)]
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub kind: RecipientKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub file_path: PathBuf,
    pub attachment_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub subject: String,
    pub body_text: String,
    #[serde(default)]
    pub recipients: Vec<EmailRecipient>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
    /// Send without showing the mail client's compose window.
    #[serde(default)]
    pub auto_send: bool,
}

/// Outcome reported by the mail client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "value", rename_all = "snake_case")]
pub enum MailResult {
    Success,
    UserAbort,
    LoginFailure,
    AttachmentNotFound,
    UnknownRecipient,
    Failure(u32),
}

impl MailResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Serde adapter that stores byte vectors as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
