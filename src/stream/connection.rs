//! One camera's network session, driven by the connection state machine.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use super::backoff::Backoff;
use super::scheduler::FrameScheduler;
use super::state::{ConnectionEvent, ConnectionState};
use crate::config::{CameraSource, StreamTiming};
use crate::error::StreamError;
use crate::frame::Frame;
use crate::ingest::{FrameSource, SourceFactory};
use crate::pool::{PipelinePool, Submission};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamStatus {
    pub camera_id: String,
    pub location: String,
    pub enabled: bool,
    pub state: ConnectionState,
    /// Capture time of the last frame read, ms since the Unix epoch.
    pub last_frame_at_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub frames_received: u64,
    pub frames_admitted: u64,
    /// Shed by the frame scheduler.
    pub frames_dropped: u64,
    /// Replaced in the pipeline queue by a newer frame before being processed.
    pub frames_superseded: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
    /// Set while waiting in backoff.
    pub backoff_ms: Option<u64>,
}

impl StreamStatus {
    pub fn new(camera: &CameraSource) -> Self {
        Self {
            camera_id: camera.id.clone(),
            location: camera.location.clone(),
            enabled: camera.enabled,
            state: ConnectionState::Disconnected,
            last_frame_at_ms: None,
            consecutive_failures: 0,
            frames_received: 0,
            frames_admitted: 0,
            frames_dropped: 0,
            frames_superseded: 0,
            reconnects: 0,
            last_error: None,
            backoff_ms: None,
        }
    }
}

pub type StatusCell = Arc<Mutex<StreamStatus>>;

pub(crate) fn lock_status(cell: &StatusCell) -> MutexGuard<'_, StreamStatus> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Wakes a connection worker out of its backoff sleep.
#[derive(Default)]
pub struct StopSignal {
    raised: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn raise(&self) {
        let mut raised = match self.raised.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *raised = true;
        self.cv.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        match self.raised.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleeps up to `timeout`; returns true if the signal was raised.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = match self.raised.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = self.cv.wait_timeout_while(guard, timeout, |raised| !*raised);
        match result {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

pub(crate) struct ConnectionWorker {
    camera: CameraSource,
    timing: StreamTiming,
    factory: Arc<dyn SourceFactory>,
    pool: Arc<PipelinePool>,
    status: StatusCell,
    stop: Arc<StopSignal>,
    state: ConnectionState,
    backoff: Backoff,
    scheduler: FrameScheduler,
}

impl ConnectionWorker {
    pub(crate) fn new(
        camera: CameraSource,
        timing: StreamTiming,
        factory: Arc<dyn SourceFactory>,
        pool: Arc<PipelinePool>,
        status: StatusCell,
        stop: Arc<StopSignal>,
    ) -> Self {
        Self {
            backoff: Backoff::new(timing.backoff_min, timing.backoff_max),
            scheduler: FrameScheduler::new(camera.target_fps),
            camera,
            timing,
            factory,
            pool,
            status,
            stop,
            state: ConnectionState::Disconnected,
        }
    }

    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        let name = format!("camera-{}", self.camera.id);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .context("spawn camera worker")
    }

    fn run(mut self) {
        self.apply(ConnectionEvent::Enable, None);
        let mut session: Option<Box<dyn FrameSource>> = None;
        let mut streaming_since = Instant::now();
        let mut attempted = false;

        while !self.stop.is_raised() {
            match self.state {
                ConnectionState::Connecting => {
                    if attempted {
                        lock_status(&self.status).reconnects += 1;
                    }
                    attempted = true;
                    match self.open_session() {
                        Ok(source) => {
                            session = Some(source);
                            streaming_since = Instant::now();
                            self.scheduler.reset();
                            self.apply(ConnectionEvent::ConnectOk, None);
                        }
                        Err(err) => self.fail(ConnectionEvent::ConnectFailed, &err),
                    }
                }
                ConnectionState::Streaming => {
                    let result = match session.as_mut() {
                        Some(source) => source.next_frame(),
                        None => Err(StreamError::connection("session lost")),
                    };
                    match result {
                        Ok(frame) => self.on_frame(frame, streaming_since),
                        Err(err) => {
                            session = None;
                            let event = match err {
                                StreamError::StallTimeout(_) => ConnectionEvent::Stall,
                                StreamError::EndOfStream => ConnectionEvent::EndOfStream,
                                StreamError::Connection(_) => ConnectionEvent::ReadError,
                            };
                            self.fail(event, &err);
                        }
                    }
                }
                ConnectionState::Backoff => {
                    let delay = self.backoff.current();
                    if self.stop.wait(delay) {
                        break;
                    }
                    lock_status(&self.status).backoff_ms = None;
                    self.apply(ConnectionEvent::BackoffElapsed, None);
                }
                ConnectionState::Disconnected => break,
            }
        }

        drop(session);
        self.apply(ConnectionEvent::Disable, None);
        lock_status(&self.status).backoff_ms = None;
    }

    fn open_session(&self) -> Result<Box<dyn FrameSource>, StreamError> {
        let mut source = self.factory.open(&self.camera, &self.timing)?;
        source.connect()?;
        Ok(source)
    }

    fn on_frame(&mut self, frame: Frame, streaming_since: Instant) {
        if self.backoff.failures() > 0 && streaming_since.elapsed() >= self.timing.stable_after {
            self.backoff.reset();
            lock_status(&self.status).consecutive_failures = 0;
            log::info!("camera {}: stream stable, backoff reset", self.camera.id);
        }

        let admitted = self.scheduler.admit(frame.arrival);
        {
            let mut status = lock_status(&self.status);
            status.frames_received += 1;
            status.last_frame_at_ms = Some(frame.captured_at_ms);
            if !admitted {
                status.frames_dropped += 1;
            }
        }
        if !admitted {
            return;
        }

        let submission = self.pool.submit(&self.camera.id, frame);
        let mut status = lock_status(&self.status);
        match submission {
            Submission::Queued => status.frames_admitted += 1,
            Submission::Replaced => {
                status.frames_admitted += 1;
                status.frames_superseded += 1;
            }
            Submission::Rejected => status.frames_dropped += 1,
        }
    }

    fn fail(&mut self, event: ConnectionEvent, err: &StreamError) {
        let delay = self.backoff.record_failure();
        {
            let mut status = lock_status(&self.status);
            status.consecutive_failures = self.backoff.failures();
            status.last_error = Some(err.to_string());
            status.backoff_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        }
        let reason = format!("{}: {}; retry in {:?}", event.reason(), err, delay);
        self.apply(event, Some(&reason));
    }

    fn apply(&mut self, event: ConnectionEvent, detail: Option<&str>) {
        let Some(next) = self.state.on(event) else {
            log::debug!(
                "camera {}: ignoring {:?} while {}",
                self.camera.id,
                event,
                self.state
            );
            return;
        };
        let previous = self.state;
        self.state = next;
        lock_status(&self.status).state = next;
        if previous == next {
            return;
        }
        let reason = detail.unwrap_or(event.reason());
        match next {
            ConnectionState::Backoff => log::warn!(
                "camera {}: {} -> {} ({})",
                self.camera.id,
                previous,
                next,
                reason
            ),
            _ => log::info!(
                "camera {}: {} -> {} ({})",
                self.camera.id,
                previous,
                next,
                reason
            ),
        }
    }
}
