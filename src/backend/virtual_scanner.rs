//! A scanner driver that synthesizes pages.
//!
//! Pages are generated on a dedicated driver thread, the way real drivers
//! deliver their callbacks, so the ordering guarantees of the scan stream are
//! exercised even without hardware.

use super::render::PnmImage;
use super::{DomainResult, ScanDriver, ScanEvents};
use crate::error::DomainError;
use crate::types::{
    BitDepth, DeviceConfig, Driver, ImageData, ImageFormat, PaperSource, ScanDevice, ScanOptions,
    ScannedImage, WindowHandle,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

pub const FLATBED_ID: &str = "virtual:flatbed";
pub const FEEDER_ID: &str = "virtual:feeder";
/// A feeder that jams after delivering its first page.
pub const JAMMED_ID: &str = "virtual:jammed";

/// Environment variable that slows page generation down (milliseconds per
/// progress step).
pub const STEP_DELAY_ENV: &str = "SCANBRIDGE_VIRTUAL_STEP_DELAY_MS";

const DEFAULT_FEEDER_PAGES: u32 = 3;
const PROGRESS_STEPS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Model {
    Flatbed,
    Feeder,
    Jammed,
}

impl Model {
    fn from_id(id: &str) -> Option<Self> {
        match id {
            FLATBED_ID => Some(Self::Flatbed),
            FEEDER_ID => Some(Self::Feeder),
            JAMMED_ID => Some(Self::Jammed),
            _ => None,
        }
    }

    fn device(self) -> ScanDevice {
        let (id, name) = match self {
            Self::Flatbed => (FLATBED_ID, "Virtual Flatbed"),
            Self::Feeder => (FEEDER_ID, "Virtual Document Feeder"),
            Self::Jammed => (JAMMED_ID, "Virtual Jammed Feeder"),
        };
        ScanDevice::new(id, name, Driver::Virtual)
    }
}

#[derive(Debug, Default)]
pub struct VirtualScanner {
    in_use: AtomicBool,
    step_delay: Duration,
}

impl VirtualScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scanner honouring [`STEP_DELAY_ENV`].
    pub fn from_env() -> Self {
        let delay = std::env::var(STEP_DELAY_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Self::new().with_step_delay(Duration::from_millis(delay))
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    fn check_driver(options: &ScanOptions) -> DomainResult<()> {
        if options.driver != Driver::Virtual {
            return Err(DomainError::NotSupported(format!(
                "the {} driver is not available in this worker",
                options.driver
            )));
        }
        Ok(())
    }

    fn select(options: &ScanOptions) -> DomainResult<Model> {
        match &options.device {
            Some(device) => Model::from_id(&device.id)
                .ok_or_else(|| DomainError::DeviceNotFound(device.id.clone())),
            None if options.source == PaperSource::Flatbed => Ok(Model::Flatbed),
            None => Ok(Model::Feeder),
        }
    }
}

/// Clears the busy flag when a scan ends, however it ends.
struct InUse<'a>(&'a AtomicBool);

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ScanDriver for VirtualScanner {
    fn devices(&self, options: &ScanOptions) -> DomainResult<Vec<ScanDevice>> {
        Self::check_driver(options)?;
        Ok([Model::Flatbed, Model::Feeder, Model::Jammed]
            .into_iter()
            .map(Model::device)
            .collect())
    }

    fn scan(&self, options: &ScanOptions, events: Arc<dyn ScanEvents>) -> DomainResult<()> {
        Self::check_driver(options)?;
        let model = Self::select(options)?;

        let pages = match model {
            Model::Flatbed => options.max_pages.unwrap_or(1).min(1),
            Model::Feeder | Model::Jammed => options.max_pages.unwrap_or(DEFAULT_FEEDER_PAGES),
        };
        if pages == 0 && model != Model::Flatbed {
            return Err(DomainError::NoPages(format!(
                "{} has no pages loaded",
                model.device().id
            )));
        }

        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DomainError::DeviceBusy(model.device().id));
        }
        let _in_use = InUse(&self.in_use);

        let job = PageJob {
            dpi: options.dpi.max(1),
            bit_depth: options.bit_depth,
            step_delay: self.step_delay,
        };
        debug!(device = %model.device().id, pages, "Starting virtual scan");

        let driver = thread::Builder::new()
            .name("virtual-scanner".to_string())
            .spawn(move || {
                for page in 1..=pages {
                    if model == Model::Jammed && page == 2 {
                        return Err(DomainError::PaperJam(format!(
                            "{} jammed while feeding page {}",
                            JAMMED_ID, page
                        )));
                    }
                    job.acquire(page, events.as_ref());
                }
                Ok(())
            })
            .map_err(|e| DomainError::Internal(format!("failed to start driver thread: {}", e)))?;

        driver
            .join()
            .map_err(|_| DomainError::Internal("virtual scanner driver panicked".to_string()))?
    }

    fn native_ui(
        &self,
        device_id: &str,
        _window: WindowHandle,
    ) -> DomainResult<Option<DeviceConfig>> {
        let model = Model::from_id(device_id)
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;
        let device = model.device();

        let mut device_props = BTreeMap::new();
        device_props.insert("id".to_string(), device.id);
        device_props.insert("name".to_string(), device.name);

        let mut item_props = BTreeMap::new();
        item_props.insert("dpi".to_string(), ScanOptions::default().dpi.to_string());

        let item_name = match model {
            Model::Flatbed => "Flatbed",
            Model::Feeder | Model::Jammed => "Feeder",
        };
        Ok(Some(DeviceConfig {
            device_props,
            item_props,
            item_name: item_name.to_string(),
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct PageJob {
    dpi: u32,
    bit_depth: BitDepth,
    step_delay: Duration,
}

impl PageJob {
    fn acquire(&self, page: u32, events: &dyn ScanEvents) {
        events.page_start();
        for step in 1..=PROGRESS_STEPS {
            if !self.step_delay.is_zero() {
                thread::sleep(self.step_delay);
            }
            events.progress(step as f64 / PROGRESS_STEPS as f64);
        }
        let image = self.render(page);
        events.image(ScannedImage {
            page,
            width: image.width,
            height: image.height,
            format: ImageFormat::Pnm,
            data: ImageData::inline(image.encode()),
        });
    }

    /// A 3.5 x 2 inch card with a diagonal ramp, shifted per page so pages
    /// are distinguishable.
    fn render(&self, page: u32) -> PnmImage {
        let width = (self.dpi * 7 / 2).max(1);
        let height = (self.dpi * 2).max(1);
        let channels = if self.bit_depth == BitDepth::Color { 3 } else { 1 };
        let mut pixels = Vec::with_capacity((width * height) as usize * channels);

        for y in 0..height {
            for x in 0..width {
                let v = ((x + y + page * 37) % 256) as u8;
                match self.bit_depth {
                    BitDepth::Color => pixels.extend_from_slice(&[v, 255 - v, (page * 50 % 256) as u8]),
                    BitDepth::Grayscale => pixels.push(v),
                    BitDepth::BlackWhite => pixels.push(if v > 127 { 255 } else { 0 }),
                }
            }
        }
        PnmImage::new(width, height, channels as u8, pixels)
    }
}
