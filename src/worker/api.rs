//! The operation set a worker offers, independent of where it runs.
//!
//! [`WorkerClient`](super::client::WorkerClient) implements [`WorkerApi`] over
//! the channel to a child process; [`InProcessWorker`] calls the same backends
//! directly. Both report backend failures as the same `BridgeError::Domain`
//! value.

use super::protocol::ScanEvent;
use super::service::WorkerService;
use crate::backend::{Backends, ScanEvents};
use crate::error::{DomainError, Result};
use crate::types::{
    DeviceConfig, EmailMessage, ImageData, MailResult, ScanDevice, ScanOptions, ScannedImage,
    WindowHandle,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread;

pub trait WorkerApi {
    /// Set (or clear) the directory large images are staged into.
    fn init(&mut self, staging_path: Option<&Path>) -> Result<()>;

    fn get_device_list(&mut self, options: &ScanOptions) -> Result<Vec<ScanDevice>>;

    /// Scan, delivering events in order to `on_event`. Events delivered before
    /// a failure remain valid.
    fn scan(&mut self, options: &ScanOptions, on_event: &mut dyn FnMut(ScanEvent)) -> Result<()>;

    fn send_mail(&mut self, message: &EmailMessage) -> Result<MailResult>;

    fn can_load_mail(&mut self, client_name: Option<&str>) -> Result<bool>;

    fn render_thumbnail(&mut self, image: &ImageData, size: u32) -> Result<Vec<u8>>;

    fn render_pdf(&mut self, path: &Path, dpi: f32) -> Result<Vec<u8>>;

    fn native_device_ui(
        &mut self,
        device_id: &str,
        window: WindowHandle,
    ) -> Result<Option<DeviceConfig>>;
}

/// Runs operations against backends in the calling process.
pub struct InProcessWorker {
    service: WorkerService,
}

impl InProcessWorker {
    pub fn new(backends: Backends) -> Self {
        Self::from_service(WorkerService::new(backends))
    }

    pub fn from_service(service: WorkerService) -> Self {
        Self { service }
    }
}

impl Default for InProcessWorker {
    fn default() -> Self {
        Self::new(Backends::builtin())
    }
}

/// Forwards driver callbacks to the calling thread.
struct ChannelEvents(Sender<ScanEvent>);

impl ScanEvents for ChannelEvents {
    fn page_start(&self) {
        let _ = self.0.send(ScanEvent::PageStart);
    }

    fn progress(&self, value: f64) {
        let _ = self.0.send(ScanEvent::Progress { value });
    }

    fn image(&self, image: ScannedImage) {
        let _ = self.0.send(ScanEvent::Image { image });
    }
}

impl WorkerApi for InProcessWorker {
    fn init(&mut self, staging_path: Option<&Path>) -> Result<()> {
        Ok(self.service.init(staging_path.map(Path::to_path_buf))?)
    }

    fn get_device_list(&mut self, options: &ScanOptions) -> Result<Vec<ScanDevice>> {
        Ok(self.service.get_device_list(options)?)
    }

    fn scan(&mut self, options: &ScanOptions, on_event: &mut dyn FnMut(ScanEvent)) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(ChannelEvents(tx));
        let service = &self.service;

        // The driver runs on its own thread so events reach `on_event` while
        // the scan is still in progress.
        let outcome = thread::scope(|s| {
            let driver = s.spawn(move || service.scan(options, sink));
            for event in rx {
                on_event(event);
            }
            driver.join()
        });

        match outcome {
            Ok(result) => Ok(result?),
            Err(_) => Err(DomainError::Internal("scan driver panicked".to_string()).into()),
        }
    }

    fn send_mail(&mut self, message: &EmailMessage) -> Result<MailResult> {
        Ok(self.service.send_mail(message)?)
    }

    fn can_load_mail(&mut self, client_name: Option<&str>) -> Result<bool> {
        Ok(self.service.can_load_mail(client_name))
    }

    fn render_thumbnail(&mut self, image: &ImageData, size: u32) -> Result<Vec<u8>> {
        Ok(self.service.render_thumbnail(image, size)?)
    }

    fn render_pdf(&mut self, path: &Path, dpi: f32) -> Result<Vec<u8>> {
        Ok(self.service.render_pdf(path, dpi)?)
    }

    fn native_device_ui(
        &mut self,
        device_id: &str,
        window: WindowHandle,
    ) -> Result<Option<DeviceConfig>> {
        Ok(self.service.native_device_ui(device_id, window)?)
    }
}
