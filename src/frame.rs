//! Decoded frames and face crops.
//!
//! - `Frame`: one decoded RGB8 image from a camera, stamped at capture.
//! - `BoundingBox`: a detected face region in frame pixel coordinates.
//! - `FaceCrop`: an owned RGB8 sub-image, optionally rotated by a quarter turn.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;

const SNAPSHOT_JPEG_QUALITY: u8 = 85;

pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time, milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
    /// Monotonic arrival instant, used for admission control.
    pub arrival: Instant,
    /// Per-session frame counter.
    pub sequence: u64,
    /// The JPEG the source delivered, kept so snapshots need no re-encode.
    encoded: Option<Vec<u8>>,
}

impl Frame {
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at_ms: crate::now_ms(),
            arrival: Instant::now(),
            sequence,
            encoded: None,
        })
    }

    pub fn from_jpeg(bytes: Vec<u8>, sequence: u64) -> Result<Self> {
        let rgb = image::load_from_memory(&bytes)
            .context("decode jpeg")?
            .into_rgb8();
        let (width, height) = rgb.dimensions();
        let mut frame = Self::from_rgb(rgb.into_raw(), width, height, sequence)?;
        frame.encoded = Some(bytes);
        Ok(frame)
    }

    pub fn with_capture_time(mut self, captured_at_ms: u64, arrival: Instant) -> Self {
        self.captured_at_ms = captured_at_ms;
        self.arrival = arrival;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Copy the region under `bbox` (clamped to the frame) into a new crop.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<FaceCrop> {
        let bbox = bbox.clamp_to(self.width, self.height)?;
        let row_bytes = bbox.width as usize * 3;
        let mut pixels = Vec::with_capacity(row_bytes * bbox.height as usize);
        for row in bbox.y..bbox.y + bbox.height {
            let start = (row as usize * self.width as usize + bbox.x as usize) * 3;
            pixels.extend_from_slice(&self.pixels[start..start + row_bytes]);
        }
        Some(FaceCrop {
            pixels,
            width: bbox.width,
            height: bbox.height,
            rotation: Rotation::None,
        })
    }

    /// JPEG bytes for the evidence snapshot.
    pub fn snapshot_jpeg(&self) -> Result<Vec<u8>> {
        if let Some(encoded) = &self.encoded {
            return Ok(encoded.clone());
        }
        encode_jpeg(&self.pixels, self.width, self.height)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at_ms", &self.captured_at_ms)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Face region in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
        }
    }

    /// Intersect with a `width` x `height` frame. `None` if nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(BoundingBox {
            width: w,
            height: h,
            ..*self
        })
    }
}

/// Clockwise quarter turns applied to a crop before scoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub const RETRIES: [Rotation; 3] = [Rotation::Cw90, Rotation::Cw180, Rotation::Cw270];

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaceCrop {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
}

impl FaceCrop {
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if pixels.len() != rgb_len(width, height)? {
            return Err(anyhow!("crop buffer does not match {}x{}", width, height));
        }
        Ok(Self {
            pixels,
            width,
            height,
            rotation: Rotation::None,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// A copy of this crop turned clockwise by `rotation`.
    pub fn rotated(&self, rotation: Rotation) -> FaceCrop {
        let (w, h) = (self.width as usize, self.height as usize);
        let (out_w, out_h) = match rotation {
            Rotation::None | Rotation::Cw180 => (w, h),
            Rotation::Cw90 | Rotation::Cw270 => (h, w),
        };
        let mut out = vec![0u8; self.pixels.len()];
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = match rotation {
                    Rotation::None => (x, y),
                    Rotation::Cw90 => (h - 1 - y, x),
                    Rotation::Cw180 => (w - 1 - x, h - 1 - y),
                    Rotation::Cw270 => (y, w - 1 - x),
                };
                let src = (y * w + x) * 3;
                let dst = (dy * out_w + dx) * 3;
                out[dst..dst + 3].copy_from_slice(&self.pixels[src..src + 3]);
            }
        }
        FaceCrop {
            pixels: out,
            width: out_w as u32,
            height: out_h as u32,
            rotation,
        }
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn encode_jpeg(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, SNAPSHOT_JPEG_QUALITY);
    encoder
        .encode(pixels, width, height, image::ExtendedColorType::Rgb8)
        .context("encode snapshot jpeg")?;
    Ok(out)
}
