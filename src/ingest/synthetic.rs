//! `stub://` source: a flat background with a face-coloured block in the
//! middle, delivered at a fixed native rate.
//!
//! Query parameters: `width`, `height`, `fps` (native rate, default 15) and
//! `fail_after` (end the session after that many frames).

use std::time::{Duration, Instant};

use anyhow::Context;
use rand::Rng;
use url::Url;

use super::{frame_interval, FrameSource};
use crate::error::StreamError;
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_NATIVE_FPS: u32 = 15;

pub struct SyntheticSource {
    uri: String,
    width: u32,
    height: u32,
    interval: Duration,
    fail_after: Option<u64>,
    connected: bool,
    last_frame_at: Option<Instant>,
    sequence: u64,
}

impl SyntheticSource {
    pub fn new(uri: &str) -> Result<Self, StreamError> {
        let url = Url::parse(uri)
            .with_context(|| format!("parse stub uri {}", uri))
            .map_err(StreamError::from)?;
        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        let mut fps = DEFAULT_NATIVE_FPS;
        let mut fail_after = None;
        for (key, value) in url.query_pairs() {
            let parsed = value.parse::<u64>().map_err(|_| {
                StreamError::connection(format!("stub uri {}: bad value for {}", uri, key))
            })?;
            match key.as_ref() {
                "width" => width = parsed.clamp(16, 4096) as u32,
                "height" => height = parsed.clamp(16, 4096) as u32,
                "fps" => fps = parsed.clamp(1, 120) as u32,
                "fail_after" => fail_after = Some(parsed),
                _ => log::debug!("stub uri {}: ignoring parameter {}", uri, key),
            }
        }
        Ok(Self {
            uri: uri.to_string(),
            width,
            height,
            interval: frame_interval(fps),
            fail_after,
            connected: false,
            last_frame_at: None,
            sequence: 0,
        })
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let (w, h) = (self.width as usize, self.height as usize);
        let (x0, x1) = (w / 4, w * 3 / 4);
        let (y0, y1) = (h / 4, h * 3 / 4);
        let mut pixels = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let base = if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
                    [214u8, 170, 140]
                } else {
                    [40u8, 60, 80]
                };
                let i = (y * w + x) * 3;
                for c in 0..3 {
                    let noise: i16 = rng.gen_range(-3..=3);
                    pixels[i + c] = (base[c] as i16 + noise).clamp(0, 255) as u8;
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<(), StreamError> {
        self.connected = true;
        log::debug!("stub: connected to {}", self.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        if !self.connected {
            return Err(StreamError::connection("stub source not connected"));
        }
        if self.fail_after.is_some_and(|limit| self.sequence >= limit) {
            return Err(StreamError::EndOfStream);
        }
        if let Some(last) = self.last_frame_at {
            let since = last.elapsed();
            if since < self.interval {
                std::thread::sleep(self.interval - since);
            }
        }
        self.last_frame_at = Some(Instant::now());
        self.sequence += 1;
        Frame::from_rgb(self.generate_pixels(), self.width, self.height, self.sequence)
            .map_err(StreamError::from)
    }
}
