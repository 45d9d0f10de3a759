//! Canvas snapshots for viewers.
//!
//! Image encoding sits behind [`Renderer`], which only sees a
//! color-addressable [`Raster`]. Viewers get JPEG, the one format every
//! browser shows inside a `multipart/x-mixed-replace` stream.

use crate::canvas::CanvasGrid;
use crate::color::Color;
use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

/// A readable grid of opaque colors.
pub trait Raster {
    fn width(&self) -> u16;
    fn height(&self) -> u16;
    /// Color at (x, y). Callers stay within `width() x height()`.
    fn color_at(&self, x: u16, y: u16) -> Color;
}

impl Raster for CanvasGrid {
    fn width(&self) -> u16 {
        CanvasGrid::width(self)
    }

    fn height(&self) -> u16 {
        CanvasGrid::height(self)
    }

    fn color_at(&self, x: u16, y: u16) -> Color {
        self.load(y as usize * CanvasGrid::width(self) as usize + x as usize)
            .opaque()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Encodes a raster into an image.
pub trait Renderer: Send + Sync {
    fn content_type(&self) -> &'static str;

    /// Append the encoded image to `out`.
    fn render(&self, raster: &dyn Raster, out: &mut Vec<u8>) -> Result<(), RenderError>;
}

/// Row-major RGB bytes of the whole raster.
fn rgb_pixels(raster: &dyn Raster) -> Vec<u8> {
    let (width, height) = (raster.width(), raster.height());
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            let c = raster.color_at(x, y);
            rgb.extend_from_slice(&[c.r(), c.g(), c.b()]);
        }
    }
    rgb
}

/// Baseline JPEG encoder.
#[derive(Debug, Clone, Copy)]
pub struct JpegRenderer {
    quality: u8,
}

impl JpegRenderer {
    /// `quality` is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for JpegRenderer {
    fn default() -> Self {
        Self::new(75)
    }
}

impl Renderer for JpegRenderer {
    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }

    fn render(&self, raster: &dyn Raster, out: &mut Vec<u8>) -> Result<(), RenderError> {
        let rgb = rgb_pixels(raster);
        let mut encoder = JpegEncoder::new_with_quality(out, self.quality);
        encoder.encode(
            &rgb,
            raster.width() as u32,
            raster.height() as u32,
            ColorType::Rgb8,
        )?;
        Ok(())
    }
}

/// Raw RGB bytes, for tests that compare frames byte for byte.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RgbRenderer;

#[cfg(test)]
impl Renderer for RgbRenderer {
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn render(&self, raster: &dyn Raster, out: &mut Vec<u8>) -> Result<(), RenderError> {
        out.extend_from_slice(&rgb_pixels(raster));
        Ok(())
    }
}

/// Wrap `body` as one part of a `multipart/x-mixed-replace` stream.
pub fn multipart_part(boundary: &str, content_type: &str, body: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        boundary,
        content_type,
        body.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + body.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(body);
    part.put_slice(b"\r\n");
    part.freeze()
}
