//! RTSP frame source.
//!
//! Decodes through a GStreamer pipeline when built with `rtsp-gstreamer`.
//! Without the feature, opening an RTSP camera fails with a connection error,
//! so the camera sits in backoff instead of taking the daemon down.

use std::time::Duration;

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;

use super::FrameSource;
use crate::error::StreamError;
use crate::frame::Frame;

pub struct RtspSource {
    #[cfg(feature = "rtsp-gstreamer")]
    inner: GstreamerRtspSource,
}

impl RtspSource {
    #[cfg(feature = "rtsp-gstreamer")]
    pub fn new(url: &str, stall_timeout: Duration) -> Result<Self, StreamError> {
        Ok(Self {
            inner: GstreamerRtspSource::new(url, stall_timeout).map_err(StreamError::from)?,
        })
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    pub fn new(url: &str, _stall_timeout: Duration) -> Result<Self, StreamError> {
        Err(StreamError::connection(format!(
            "cannot open {}: RTSP requires the rtsp-gstreamer feature",
            url
        )))
    }
}

impl FrameSource for RtspSource {
    #[cfg(feature = "rtsp-gstreamer")]
    fn connect(&mut self) -> Result<(), StreamError> {
        self.inner.connect().map_err(StreamError::from)
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    fn connect(&mut self) -> Result<(), StreamError> {
        Err(StreamError::connection("RTSP requires the rtsp-gstreamer feature"))
    }

    #[cfg(feature = "rtsp-gstreamer")]
    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        self.inner.next_frame()
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        Err(StreamError::connection("RTSP requires the rtsp-gstreamer feature"))
    }
}

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    url: String,
    stall_timeout: Duration,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    sequence: u64,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// rtspsrc ! decodebin ! videoconvert ! appsink, RGB out, newest buffer only.
    fn new(url: &str, stall_timeout: Duration) -> anyhow::Result<Self> {
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let timeout_us = stall_timeout.as_micros().min(u64::MAX as u128) as u64;
        let pipeline_description = format!(
            "rtspsrc location={} latency=0 tcp-timeout={} ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            url, timeout_us
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            url: url.to_string(),
            stall_timeout,
            pipeline,
            appsink,
            sequence: 0,
        })
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        use gstreamer::prelude::*;

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::debug!("rtsp: pipeline playing for {}", self.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_nseconds(
            self.stall_timeout.as_nanos().min(u64::MAX as u128) as u64,
        );
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(StreamError::EndOfStream);
            }
            return Err(StreamError::StallTimeout(self.stall_timeout));
        };

        let (pixels, width, height) = sample_to_pixels(&sample).map_err(StreamError::from)?;
        self.sequence += 1;
        Frame::from_rgb(pixels, width, height, self.sequence).map_err(StreamError::from)
    }

    fn poll_bus(&mut self) -> Result<(), StreamError> {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(StreamError::connection(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => return Err(StreamError::EndOfStream),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        use gstreamer::prelude::*;

        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("rtsp: failed to stop pipeline for {}: {}", self.url, e);
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> anyhow::Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let frame_bytes = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?;
        return Ok((frame_bytes.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
