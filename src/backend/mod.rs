//! Backing subsystems that do the real work inside a worker.
//!
//! A worker process owns one [`Backends`] set. Every method reports failures as
//! [`DomainError`], which is what crosses the process boundary.

pub mod mail;
pub mod render;
pub mod virtual_scanner;

pub use mail::NoMailClient;
pub use render::PnmRenderer;
pub use virtual_scanner::VirtualScanner;

use crate::error::DomainError;
use crate::types::{
    DeviceConfig, EmailMessage, MailResult, ScanDevice, ScanOptions, ScannedImage, WindowHandle,
};
use std::path::Path;
use std::sync::Arc;

/// Result type for backend operations.
pub type DomainResult<T> = std::result::Result<T, DomainError>;

/// Receiver for scan progress.
///
/// Drivers may call these from their own callback threads, so implementations
/// must be thread-safe and must not assume they run on the request thread.
pub trait ScanEvents: Send + Sync {
    fn page_start(&self);
    /// Fraction of the current page acquired, in `0.0..=1.0`.
    fn progress(&self, value: f64);
    fn image(&self, image: ScannedImage);
}

/// A scanner driver.
pub trait ScanDriver: Send + Sync {
    fn devices(&self, options: &ScanOptions) -> DomainResult<Vec<ScanDevice>>;

    /// Acquire pages, reporting each through `events`. Returns once the
    /// driver has finished; an error ends the scan after whatever pages were
    /// already reported.
    fn scan(&self, options: &ScanOptions, events: Arc<dyn ScanEvents>) -> DomainResult<()>;

    /// Show the driver's own configuration dialog. `None` means the user
    /// cancelled.
    fn native_ui(&self, device_id: &str, window: WindowHandle)
    -> DomainResult<Option<DeviceConfig>>;
}

/// A system mail client.
pub trait MailClient: Send + Sync {
    fn can_load(&self, client_name: Option<&str>) -> bool;
    fn send(&self, message: &EmailMessage) -> DomainResult<MailResult>;
}

/// Image and document rendering.
pub trait Renderer: Send + Sync {
    /// Scale an encoded image so its longest edge is at most `size` pixels.
    fn thumbnail(&self, image: &[u8], size: u32) -> DomainResult<Vec<u8>>;
    /// Render the first page of a PDF at `dpi`.
    fn pdf_page(&self, path: &Path, dpi: f32) -> DomainResult<Vec<u8>>;
}

/// The backend set a worker serves requests with.
#[derive(Clone)]
pub struct Backends {
    pub scanner: Arc<dyn ScanDriver>,
    pub mail: Arc<dyn MailClient>,
    pub renderer: Arc<dyn Renderer>,
}

impl Backends {
    /// The backends compiled into `scanbridge-worker`.
    pub fn builtin() -> Self {
        Self {
            scanner: Arc::new(VirtualScanner::new()),
            mail: Arc::new(NoMailClient),
            renderer: Arc::new(PnmRenderer),
        }
    }

    pub fn with_scanner(mut self, scanner: impl ScanDriver + 'static) -> Self {
        self.scanner = Arc::new(scanner);
        self
    }

    pub fn with_mail(mut self, mail: impl MailClient + 'static) -> Self {
        self.mail = Arc::new(mail);
        self
    }

    pub fn with_renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }
}

impl Default for Backends {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
