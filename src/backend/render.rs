//! Renderer for binary PNM images (P5 grayscale, P6 color).
//!
//! PNM is what the virtual scanner produces, so this is enough to thumbnail
//! everything the built-in worker can acquire.

use super::{DomainResult, Renderer};
use crate::error::DomainError;
use std::path::Path;

/// A decoded 8-bit PNM raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnmImage {
    pub width: u32,
    pub height: u32,
    /// 1 for P5, 3 for P6.
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl PnmImage {
    pub fn new(width: u32, height: u32, channels: u8, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            pixels,
        }
    }

    /// Decode a binary PNM with a maxval of 255.
    pub fn parse(data: &[u8]) -> DomainResult<Self> {
        let channels = match data.get(..2) {
            Some(b"P5") => 1,
            Some(b"P6") => 3,
            _ => {
                return Err(DomainError::InvalidInput(
                    "image is not a binary PNM (P5/P6)".to_string(),
                ));
            }
        };

        let mut pos = 2;
        let width = header_field(data, &mut pos)?;
        let height = header_field(data, &mut pos)?;
        let maxval = header_field(data, &mut pos)?;
        if maxval != 255 {
            return Err(DomainError::NotSupported(format!(
                "PNM maxval {} (only 8-bit images are supported)",
                maxval
            )));
        }
        if width == 0 || height == 0 {
            return Err(DomainError::InvalidInput(format!(
                "PNM has an empty raster ({}x{})",
                width, height
            )));
        }
        // Exactly one whitespace byte separates the header from the raster
        pos += 1;

        let too_large = || {
            DomainError::InvalidInput(format!("PNM dimensions {}x{} are too large", width, height))
        };
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(channels))
            .ok_or_else(too_large)?;
        let end = pos.checked_add(len).ok_or_else(too_large)?;
        let pixels = data
            .get(pos..end)
            .ok_or_else(|| {
                DomainError::InvalidInput(format!(
                    "PNM raster truncated: expected {} bytes for {}x{}",
                    len, width, height
                ))
            })?
            .to_vec();

        Ok(Self::new(width, height, channels as u8, pixels))
    }

    pub fn encode(&self) -> Vec<u8> {
        let magic = if self.channels == 1 { "P5" } else { "P6" };
        let mut out = format!("{}\n{} {}\n255\n", magic, self.width, self.height).into_bytes();
        out.extend_from_slice(&self.pixels);
        out
    }

    /// Box-filter the image so its longest edge is at most `size`. Images
    /// already within bounds are returned unchanged.
    pub fn downsample(&self, size: u32) -> Self {
        let longest = self.width.max(self.height);
        if longest <= size || longest == 0 {
            return self.clone();
        }
        let scaled = |edge: u32| {
            ((edge as u64 * size as u64 + longest as u64 / 2) / longest as u64).max(1) as u32
        };
        let (out_w, out_h) = (scaled(self.width), scaled(self.height));

        let channels = self.channels as usize;
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = Vec::with_capacity(out_w as usize * out_h as usize * channels);

        for oy in 0..out_h as usize {
            let y0 = oy * h / out_h as usize;
            let y1 = ((oy + 1) * h / out_h as usize).max(y0 + 1);
            for ox in 0..out_w as usize {
                let x0 = ox * w / out_w as usize;
                let x1 = ((ox + 1) * w / out_w as usize).max(x0 + 1);
                let count = ((y1 - y0) * (x1 - x0)) as u64;
                for c in 0..channels {
                    let mut sum = 0u64;
                    for y in y0..y1 {
                        let row = y * w;
                        for x in x0..x1 {
                            sum += self.pixels[(row + x) * channels + c] as u64;
                        }
                    }
                    pixels.push(((sum + count / 2) / count) as u8);
                }
            }
        }

        Self::new(out_w, out_h, self.channels, pixels)
    }
}

/// Read one decimal header field, skipping whitespace and `#` comments.
fn header_field(data: &[u8], pos: &mut usize) -> DomainResult<u32> {
    loop {
        match data.get(*pos) {
            Some(b) if b.is_ascii_whitespace() => *pos += 1,
            Some(b'#') => {
                while let Some(&b) = data.get(*pos) {
                    *pos += 1;
                    if b == b'\n' {
                        break;
                    }
                }
            }
            _ => break,
        }
    }
    let start = *pos;
    while data.get(*pos).is_some_and(u8::is_ascii_digit) {
        *pos += 1;
    }
    std::str::from_utf8(&data[start..*pos])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DomainError::InvalidInput("malformed PNM header".to_string()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PnmRenderer;

impl Renderer for PnmRenderer {
    fn thumbnail(&self, image: &[u8], size: u32) -> DomainResult<Vec<u8>> {
        if size == 0 {
            return Err(DomainError::InvalidInput(
                "thumbnail size must be positive".to_string(),
            ));
        }
        Ok(PnmImage::parse(image)?.downsample(size).encode())
    }

    fn pdf_page(&self, path: &Path, _dpi: f32) -> DomainResult<Vec<u8>> {
        Err(DomainError::NotSupported(format!(
            "no PDF renderer is available to render {}",
            path.display()
        )))
    }
}
