//! Bounded worker pool for pipeline work.
//!
//! Each camera gets a lane holding at most one pending frame; a newer frame
//! replaces it. A lane is handed to one worker at a time, so frames from a
//! camera are processed in arrival order, and the number of workers bounds
//! how much inference runs at once.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::config::CameraSource;
use crate::frame::Frame;

pub trait FrameHandler: Send + Sync {
    fn handle(&self, camera: &CameraSource, frame: Frame);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// An older pending frame for the camera was replaced.
    Replaced,
    /// The lane was cancelled or the pool is shut down.
    Rejected,
}

#[derive(Default)]
struct LaneSlot {
    pending: Option<Frame>,
    /// Sent to the workers, or held by one.
    scheduled: bool,
    cancelled: bool,
}

struct CameraLane {
    camera: CameraSource,
    slot: Mutex<LaneSlot>,
}

impl CameraLane {
    fn slot(&self) -> MutexGuard<'_, LaneSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The only sender; dropping it on shutdown closes the channel.
type SharedSender = Arc<Mutex<Option<Sender<Arc<CameraLane>>>>>;

pub struct PipelinePool {
    lanes: Mutex<HashMap<String, Arc<CameraLane>>>,
    sender: SharedSender,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelinePool {
    pub fn start(workers: usize, handler: Arc<dyn FrameHandler>) -> Result<Self> {
        if workers == 0 {
            return Err(anyhow!("pipeline pool needs at least one worker"));
        }
        let (tx, rx) = mpsc::channel::<Arc<CameraLane>>();
        let rx = Arc::new(Mutex::new(rx));
        let sender: SharedSender = Arc::new(Mutex::new(Some(tx)));
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let rx = Arc::clone(&rx);
            let sender = Arc::clone(&sender);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("pipeline-{}", index))
                .spawn(move || worker_loop(rx, sender, handler))
                .context("spawn pipeline worker")?;
            handles.push(handle);
        }
        Ok(Self {
            lanes: Mutex::new(HashMap::new()),
            sender,
            workers: Mutex::new(handles),
        })
    }

    /// Opens (or reopens) the lane for `camera`. A previously cancelled lane
    /// is replaced by a fresh one.
    pub fn open_lane(&self, camera: &CameraSource) {
        let mut lanes = lock(&self.lanes);
        let stale = lanes
            .get(&camera.id)
            .map_or(true, |lane| lane.slot().cancelled);
        if stale {
            lanes.insert(
                camera.id.clone(),
                Arc::new(CameraLane {
                    camera: camera.clone(),
                    slot: Mutex::new(LaneSlot::default()),
                }),
            );
        }
    }

    pub fn submit(&self, camera_id: &str, frame: Frame) -> Submission {
        let Some(lane) = lock(&self.lanes).get(camera_id).cloned() else {
            return Submission::Rejected;
        };
        let mut slot = lane.slot();
        if slot.cancelled {
            return Submission::Rejected;
        }
        let replaced = slot.pending.replace(frame).is_some();
        if !slot.scheduled {
            let sender = lock(&self.sender);
            let Some(tx) = sender.as_ref() else {
                slot.pending = None;
                return Submission::Rejected;
            };
            if tx.send(Arc::clone(&lane)).is_err() {
                slot.pending = None;
                return Submission::Rejected;
            }
            slot.scheduled = true;
        }
        if replaced {
            Submission::Replaced
        } else {
            Submission::Queued
        }
    }

    /// Drops the queued frame for `camera_id` and rejects further frames.
    /// Work already running on a worker finishes.
    pub fn cancel(&self, camera_id: &str) -> bool {
        let Some(lane) = lock(&self.lanes).remove(camera_id) else {
            return false;
        };
        let mut slot = lane.slot();
        slot.cancelled = true;
        slot.pending.take().is_some()
    }

    /// True once no lane holds or is processing a frame.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = lock(&self.lanes).values().any(|lane| {
                let slot = lane.slot();
                slot.scheduled || slot.pending.is_some()
            });
            if !busy {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Stops accepting frames and joins the workers after they drain.
    pub fn shutdown(&self) {
        for lane in lock(&self.lanes).drain().map(|(_, lane)| lane) {
            let mut slot = lane.slot();
            slot.cancelled = true;
            slot.pending = None;
        }
        lock(&self.sender).take();
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("pipeline worker panicked");
            }
        }
    }
}

impl Drop for PipelinePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: Arc<Mutex<Receiver<Arc<CameraLane>>>>,
    sender: SharedSender,
    handler: Arc<dyn FrameHandler>,
) {
    loop {
        let lane = match lock(&rx).recv() {
            Ok(lane) => lane,
            Err(_) => return,
        };

        let frame = {
            let mut slot = lane.slot();
            match slot.pending.take() {
                Some(frame) if !slot.cancelled => frame,
                _ => {
                    slot.scheduled = false;
                    continue;
                }
            }
        };

        let camera = &lane.camera;
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle(camera, frame))).is_err() {
            log::error!("camera {}: pipeline handler panicked; frame dropped", camera.id);
        }

        let mut slot = lane.slot();
        if slot.pending.is_some() && !slot.cancelled {
            let requeued = lock(&sender)
                .as_ref()
                .is_some_and(|tx| tx.send(Arc::clone(&lane)).is_ok());
            if !requeued {
                slot.pending = None;
                slot.scheduled = false;
            }
        } else {
            slot.scheduled = false;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
