//! MJPEG over HTTP.
//!
//! `multipart/x-mixed-replace` responses are split on JPEG SOI/EOI markers.
//! Anything else is treated as a snapshot endpoint (IP Webcam `shot.jpg`) and
//! fetched again for every frame, paced to the camera's target rate.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use url::Url;

use super::{frame_interval, FrameSource};
use crate::error::StreamError;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct MjpegSource {
    url: String,
    agent: ureq::Agent,
    stall_timeout: Duration,
    poll_interval: Duration,
    stream: Option<HttpStream>,
    sequence: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg {
        /// Body of the connect response, served as the first frame.
        first: Option<Vec<u8>>,
        last_fetch: Option<Instant>,
    },
}

impl MjpegSource {
    pub fn new(url: &str, target_fps: u32, stall_timeout: Duration) -> Result<Self, StreamError> {
        let parsed = Url::parse(url)
            .with_context(|| format!("parse mjpeg url {}", url))
            .map_err(StreamError::from)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StreamError::connection(format!(
                "unsupported mjpeg scheme '{}'; expected http(s)",
                parsed.scheme()
            )));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(stall_timeout)
            .timeout_read(stall_timeout)
            .build();
        Ok(Self {
            url: url.to_string(),
            agent,
            stall_timeout,
            poll_interval: frame_interval(target_fps),
            stream: None,
            sequence: 0,
        })
    }

    fn get(&self) -> Result<ureq::Response, StreamError> {
        self.agent
            .get(&self.url)
            .call()
            .map_err(|e| StreamError::connection(format!("GET {}: {}", self.url, e)))
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>, StreamError> {
        let response = self.get()?;
        read_body(response, self.stall_timeout)
    }

    fn decode(&mut self, bytes: Vec<u8>) -> Result<Frame, StreamError> {
        self.sequence += 1;
        Frame::from_jpeg(bytes, self.sequence).map_err(StreamError::from)
    }
}

impl FrameSource for MjpegSource {
    fn connect(&mut self) -> Result<(), StreamError> {
        let response = self.get()?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        self.stream = Some(if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg {
                first: Some(read_body(response, self.stall_timeout)?),
                last_fetch: Some(Instant::now()),
            }
        });
        log::debug!("mjpeg: connected to {} ({})", self.url, content_type);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        let stall_timeout = self.stall_timeout;
        let poll_interval = self.poll_interval;
        let bytes = match self.stream.as_mut() {
            None => {
                return Err(StreamError::connection(
                    "mjpeg source not connected; call connect() first",
                ))
            }
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg(stall_timeout)?,
            Some(HttpStream::SingleJpeg { first, last_fetch }) => {
                if let Some(bytes) = first.take() {
                    bytes
                } else {
                    if let Some(last) = *last_fetch {
                        let since = last.elapsed();
                        if since < poll_interval {
                            std::thread::sleep(poll_interval - since);
                        }
                    }
                    *last_fetch = Some(Instant::now());
                    self.fetch_single_jpeg()?
                }
            }
        };
        self.decode(bytes)
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self, stall_timeout: Duration) -> Result<Vec<u8>, StreamError> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| map_read_error(e, stall_timeout))?;
            if read == 0 {
                return Err(StreamError::EndOfStream);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn read_body(response: ureq::Response, stall_timeout: Duration) -> Result<Vec<u8>, StreamError> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| map_read_error(e, stall_timeout))?;
    if bytes.is_empty() {
        return Err(StreamError::from(anyhow!("empty jpeg snapshot")));
    }
    Ok(bytes)
}

fn map_read_error(err: io::Error, stall_timeout: Duration) -> StreamError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            StreamError::StallTimeout(stall_timeout)
        }
        io::ErrorKind::UnexpectedEof => StreamError::EndOfStream,
        _ => StreamError::connection(format!("read mjpeg: {}", err)),
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
