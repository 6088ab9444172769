//! Request dispatch inside the worker process.
//!
//! [`WorkerService`] runs each operation against the backends and turns the
//! outcome into responses. Domain failures become an `error` response; only
//! channel I/O failures escape as `Err`, and those end the connection.

use super::ipc::LineWriter;
use super::protocol::{ScanEvent, WorkRequest, WorkResponse};
use super::sequenced::{SequencedHandle, SequencedWriter};
use crate::backend::{Backends, DomainResult, ScanEvents};
use crate::error::DomainError;
use crate::types::{
    DeviceConfig, EmailMessage, ImageData, MailResult, ScanDevice, ScanOptions, ScannedImage,
    WindowHandle,
};
use std::fs;
use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Images above this many bytes are staged to disk once a staging directory
/// is known.
pub const DEFAULT_INLINE_LIMIT: usize = 256 * 1024;

/// Writes large images into the staging directory.
#[derive(Debug)]
struct Staging {
    dir: PathBuf,
    inline_limit: usize,
    counter: AtomicU64,
}

impl Staging {
    /// Move the image bytes to disk when they exceed the inline limit. On
    /// failure the image comes back untouched with the error.
    fn stage(&self, image: ScannedImage) -> Result<ScannedImage, (io::Error, ScannedImage)> {
        let ImageData::Inline { bytes } = &image.data else {
            return Ok(image);
        };
        if bytes.len() <= self.inline_limit {
            return Ok(image);
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(
            "scan-{}-{}-p{}.{}",
            std::process::id(),
            n,
            image.page,
            image.format.extension()
        ));
        if let Err(e) = fs::write(&path, bytes) {
            return Err((e, image));
        }
        Ok(ScannedImage {
            data: ImageData::staged(path),
            ..image
        })
    }
}

/// Bridges driver callbacks onto the ordered response stream.
struct StreamSink {
    out: SequencedHandle<WorkResponse>,
}

impl ScanEvents for StreamSink {
    fn page_start(&self) {
        self.out.write(WorkResponse::event(ScanEvent::PageStart));
    }

    fn progress(&self, value: f64) {
        self.out
            .write(WorkResponse::event(ScanEvent::Progress { value }));
    }

    fn image(&self, image: ScannedImage) {
        self.out.write(WorkResponse::event(ScanEvent::Image { image }));
    }
}

/// Executes requests against a backend set.
pub struct WorkerService {
    backends: Backends,
    inline_limit: usize,
    staging: Option<Arc<Staging>>,
}

impl WorkerService {
    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            inline_limit: DEFAULT_INLINE_LIMIT,
            staging: None,
        }
    }

    pub fn with_inline_limit(mut self, limit: usize) -> Self {
        self.inline_limit = limit;
        self
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging.as_ref().map(|s| s.dir.as_path())
    }

    pub fn init(&mut self, staging_path: Option<PathBuf>) -> DomainResult<()> {
        self.staging = match staging_path {
            Some(dir) => {
                fs::create_dir_all(&dir).map_err(|e| {
                    DomainError::InvalidInput(format!(
                        "cannot use staging directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
                Some(Arc::new(Staging {
                    dir,
                    inline_limit: self.inline_limit,
                    counter: AtomicU64::new(0),
                }))
            }
            None => None,
        };
        Ok(())
    }

    pub fn get_device_list(&self, options: &ScanOptions) -> DomainResult<Vec<ScanDevice>> {
        self.backends.scanner.devices(options)
    }

    /// Run a scan, reporting through `events`. Images are staged first when a
    /// staging directory is configured.
    pub fn scan(&self, options: &ScanOptions, events: Arc<dyn ScanEvents>) -> DomainResult<()> {
        match &self.staging {
            None => self.backends.scanner.scan(options, events),
            Some(staging) => {
                let staged = Arc::new(StagingEvents {
                    inner: events,
                    staging: Arc::clone(staging),
                });
                self.backends.scanner.scan(options, staged)
            }
        }
    }

    pub fn send_mail(&self, message: &EmailMessage) -> DomainResult<MailResult> {
        self.backends.mail.send(message)
    }

    pub fn can_load_mail(&self, client_name: Option<&str>) -> bool {
        self.backends.mail.can_load(client_name)
    }

    pub fn render_thumbnail(&self, image: &ImageData, size: u32) -> DomainResult<Vec<u8>> {
        let bytes = image.load().map_err(|e| {
            DomainError::InvalidInput(format!("cannot read image for thumbnail: {}", e))
        })?;
        self.backends.renderer.thumbnail(&bytes, size)
    }

    pub fn render_pdf(&self, path: &Path, dpi: f32) -> DomainResult<Vec<u8>> {
        self.backends.renderer.pdf_page(path, dpi)
    }

    pub fn native_device_ui(
        &self,
        device_id: &str,
        window: WindowHandle,
    ) -> DomainResult<Option<DeviceConfig>> {
        self.backends.scanner.native_ui(device_id, window)
    }

    /// Execute one request and write its response(s).
    ///
    /// Takes the channel writer by value because a scan hands it to the
    /// sequenced consumer thread for the duration of the stream. Returns the
    /// writer and whether to keep serving.
    pub fn handle<W>(
        &mut self,
        request: WorkRequest,
        mut writer: LineWriter<W>,
    ) -> io::Result<(LineWriter<W>, bool)>
    where
        W: Write + Send + 'static,
    {
        let op = request.name();
        let start = Instant::now();

        let response = match request {
            WorkRequest::Scan { options } => {
                let writer = self.stream_scan(&options, writer)?;
                debug!(op, elapsed_ms = start.elapsed().as_millis() as u64, "Request done");
                return Ok((writer, true));
            }
            WorkRequest::Stop => {
                info!("Stop requested");
                writer.write_line(&WorkResponse::Stopped.to_line())?;
                return Ok((writer, false));
            }
            request => catch_panic(op, || self.dispatch(request)),
        };

        let response = response.unwrap_or_else(|e| {
            debug!(op, error = %e, "Request failed");
            WorkResponse::error(&e)
        });
        writer.write_line(&response.to_line())?;
        debug!(op, elapsed_ms = start.elapsed().as_millis() as u64, "Request done");
        Ok((writer, true))
    }

    /// Run a request that has exactly one response.
    fn dispatch(&mut self, request: WorkRequest) -> DomainResult<WorkResponse> {
        match request {
            WorkRequest::Init { staging_path } => {
                self.init(staging_path).map(|()| WorkResponse::Initialized)
            }
            WorkRequest::GetDeviceList { options } => self
                .get_device_list(&options)
                .map(|devices| WorkResponse::DeviceList { devices }),
            WorkRequest::SendMail { message } => self
                .send_mail(&message)
                .map(|result| WorkResponse::MailSent { result }),
            WorkRequest::CanLoadMail { client_name } => Ok(WorkResponse::MailAvailability {
                loaded: self.can_load_mail(client_name.as_deref()),
            }),
            WorkRequest::RenderThumbnail { image, size } => self
                .render_thumbnail(&image, size)
                .map(|bytes| WorkResponse::Thumbnail { bytes }),
            WorkRequest::RenderPdf { path, dpi } => self
                .render_pdf(&path, dpi)
                .map(|bytes| WorkResponse::PdfPage { bytes }),
            WorkRequest::NativeDeviceUi { device_id, window } => self
                .native_device_ui(&device_id, window)
                .map(|config| WorkResponse::NativeUi { config }),
            other @ (WorkRequest::Scan { .. } | WorkRequest::Stop) => Err(DomainError::Internal(
                format!("{} has no single response", other.name()),
            )),
        }
    }

    fn stream_scan<W>(
        &self,
        options: &ScanOptions,
        writer: LineWriter<W>,
    ) -> io::Result<LineWriter<W>>
    where
        W: Write + Send + 'static,
    {
        let stream = SequencedWriter::start(writer)?;
        let sink = Arc::new(StreamSink {
            out: stream.handle(),
        });

        let terminal = match catch_panic("scan", || self.scan(options, sink)) {
            Ok(()) => WorkResponse::ScanComplete,
            Err(e) => {
                debug!(error = %e, "Scan failed");
                WorkResponse::error(&e)
            }
        };
        stream.write_final(terminal);
        stream.wait_for_completion()
    }
}

/// Run `op`, turning a panic in a backend into an `Internal` error so the
/// worker keeps serving.
fn catch_panic<T>(op: &str, f: impl FnOnce() -> DomainResult<T>) -> DomainResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        warn!(op, panic = %message, "Backend panicked");
        Err(DomainError::Internal(format!("{} panicked: {}", op, message)))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Stages images before passing them on.
struct StagingEvents {
    inner: Arc<dyn ScanEvents>,
    staging: Arc<Staging>,
}

impl ScanEvents for StagingEvents {
    fn page_start(&self) {
        self.inner.page_start();
    }

    fn progress(&self, value: f64) {
        self.inner.progress(value);
    }

    fn image(&self, image: ScannedImage) {
        let image = self.staging.stage(image).unwrap_or_else(|(e, image)| {
            warn!(page = image.page, error = %e, "Failed to stage image; sending inline");
            image
        });
        self.inner.image(image);
    }
}
