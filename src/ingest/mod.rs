//! Camera frame sources.
//!
//! - MJPEG over HTTP (multipart streams, or single-JPEG endpoints polled per frame)
//! - RTSP via GStreamer (feature: rtsp-gstreamer)
//! - `stub://` synthetic source for demos and tests
//!
//! A source owns exactly one network session. It is opened by a
//! `SourceFactory`, connected once, then read until it fails; the connection
//! worker drops it and opens a fresh one after backoff.

mod mjpeg;
pub mod rtsp;
mod synthetic;

use std::time::Duration;

pub use mjpeg::MjpegSource;
pub use rtsp::RtspSource;
pub use synthetic::SyntheticSource;

use crate::config::{CameraSource, StreamTiming, TransportKind};
use crate::error::StreamError;
use crate::frame::Frame;

pub trait FrameSource: Send {
    /// Establish the session. Success means frames can be read.
    fn connect(&mut self) -> Result<(), StreamError>;

    /// Block until the next frame, at most about the stall timeout.
    fn next_frame(&mut self) -> Result<Frame, StreamError>;
}

pub trait SourceFactory: Send + Sync {
    fn open(
        &self,
        camera: &CameraSource,
        timing: &StreamTiming,
    ) -> Result<Box<dyn FrameSource>, StreamError>;
}

/// Picks the source implementation from the camera's URI and transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn open(
        &self,
        camera: &CameraSource,
        timing: &StreamTiming,
    ) -> Result<Box<dyn FrameSource>, StreamError> {
        if camera.is_stub() {
            return Ok(Box::new(SyntheticSource::new(&camera.uri)?));
        }
        match camera.transport {
            TransportKind::Mjpeg => Ok(Box::new(MjpegSource::new(
                &camera.uri,
                camera.target_fps,
                timing.stall_timeout,
            )?)),
            TransportKind::Rtsp => Ok(Box::new(RtspSource::new(
                &camera.uri,
                timing.stall_timeout,
            )?)),
        }
    }
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}
