//! Owns one connection worker per enabled camera and the shared pipeline pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;

use anyhow::Result;
use serde::Serialize;

use super::connection::{lock_status, ConnectionWorker, StatusCell, StopSignal, StreamStatus};
use crate::config::{CameraSource, StreamTiming, Thresholds};
use crate::detect::{read_thresholds, SharedThresholds};
use crate::error::{ConfigurationError, GatewatchError};
use crate::ingest::SourceFactory;
use crate::pool::PipelinePool;
use crate::processor::{FrameProcessor, ProcessorStats};

struct Worker {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

/// A camera's session slot. `Stopping` covers the time between raising the
/// stop signal and the old thread being joined; nothing may spawn then.
enum Slot {
    Idle,
    Running(Worker),
    Stopping,
}

impl Slot {
    fn is_alive(&self) -> bool {
        match self {
            Slot::Running(worker) => !worker.handle.is_finished(),
            Slot::Stopping => true,
            Slot::Idle => false,
        }
    }
}

struct CameraEntry {
    camera: CameraSource,
    status: StatusCell,
    slot: Slot,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub identities: usize,
    pub identity_generation: u64,
    pub recognition_threshold: f32,
    pub liveness_threshold: f32,
    pub cooldown_secs: u64,
    pub pipeline: ProcessorStats,
    pub streams: Vec<StreamStatus>,
}

pub struct StreamSupervisor {
    timing: StreamTiming,
    factory: Arc<dyn SourceFactory>,
    processor: Arc<FrameProcessor>,
    pool: Arc<PipelinePool>,
    thresholds: SharedThresholds,
    cameras: Mutex<Vec<CameraEntry>>,
    /// Signalled whenever a `Stopping` slot settles to `Idle`.
    settled: Condvar,
    started: AtomicBool,
}

impl StreamSupervisor {
    /// `thresholds` must be the lock the processor's pipeline and
    /// deduplicator read from.
    pub fn new(
        cameras: Vec<CameraSource>,
        timing: StreamTiming,
        factory: Arc<dyn SourceFactory>,
        processor: Arc<FrameProcessor>,
        thresholds: SharedThresholds,
        pipeline_workers: usize,
    ) -> Result<Self> {
        let pool = Arc::new(PipelinePool::start(
            pipeline_workers,
            processor.clone(),
        )?);
        let cameras = cameras
            .into_iter()
            .map(|camera| CameraEntry {
                status: Arc::new(Mutex::new(StreamStatus::new(&camera))),
                camera,
                slot: Slot::Idle,
            })
            .collect();
        Ok(Self {
            timing,
            factory,
            processor,
            pool,
            thresholds,
            cameras: Mutex::new(cameras),
            settled: Condvar::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Spawns a worker for every enabled camera.
    pub fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        let mut cameras = self.cameras();
        for entry in cameras.iter_mut().filter(|e| e.camera.enabled) {
            if matches!(entry.slot, Slot::Idle) {
                entry.slot = Slot::Running(self.spawn_worker(entry)?);
            }
        }
        log::info!(
            "supervisor started {} of {} cameras",
            cameras.iter().filter(|e| e.slot.is_alive()).count(),
            cameras.len()
        );
        Ok(())
    }

    /// Marks the camera enabled and, once started, opens its session. If a
    /// `disable` is still tearing the old session down, waits for it first.
    pub fn enable(&self, camera_id: &str) -> Result<(), GatewatchError> {
        let (mut cameras, index) = self.settled_entry(camera_id)?;
        let entry = &mut cameras[index];
        entry.camera.enabled = true;
        lock_status(&entry.status).enabled = true;
        if entry.slot.is_alive() {
            return Ok(());
        }
        if let Slot::Running(worker) = std::mem::replace(&mut entry.slot, Slot::Idle) {
            // Already finished; the join returns immediately.
            join(camera_id, worker);
        }
        if self.started.load(Ordering::SeqCst) {
            entry.slot = Slot::Running(self.spawn_worker(entry)?);
        }
        Ok(())
    }

    /// Stops the camera's session and drops its queued frame. Returns once
    /// the worker has exited, which takes at most about one stall timeout.
    pub fn disable(&self, camera_id: &str) -> Result<(), GatewatchError> {
        let worker = {
            let (mut cameras, index) = self.settled_entry(camera_id)?;
            let entry = &mut cameras[index];
            entry.camera.enabled = false;
            lock_status(&entry.status).enabled = false;
            // Cancel while the slot still shows a session, so a later enable
            // always opens a fresh lane.
            self.pool.cancel(camera_id);
            match std::mem::replace(&mut entry.slot, Slot::Idle) {
                Slot::Running(worker) => {
                    worker.stop.raise();
                    entry.slot = Slot::Stopping;
                    worker
                }
                _ => return Ok(()),
            }
        };
        join(camera_id, worker);
        self.settle(camera_id);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        let workers: Vec<(String, Worker)> = {
            let mut cameras = self.cameras();
            let mut workers = Vec::new();
            for entry in cameras.iter_mut() {
                if let Slot::Running(worker) = std::mem::replace(&mut entry.slot, Slot::Idle) {
                    worker.stop.raise();
                    self.pool.cancel(&entry.camera.id);
                    entry.slot = Slot::Stopping;
                    workers.push((entry.camera.id.clone(), worker));
                }
            }
            workers
        };
        for (camera_id, worker) in workers {
            join(&camera_id, worker);
            self.settle(&camera_id);
        }
        // Concurrent disables finish their own joins.
        let mut cameras = self.cameras();
        while cameras.iter().any(|e| matches!(e.slot, Slot::Stopping)) {
            cameras = self.wait_settled(cameras);
        }
        drop(cameras);
        self.pool.shutdown();
        log::info!("supervisor stopped");
    }

    /// Respawns workers of enabled cameras whose thread has ended. Returns
    /// the ids that were restarted. Cameras being disabled are skipped.
    pub fn restart_failed(&self) -> Result<Vec<String>> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let mut restarted = Vec::new();
        let mut cameras = self.cameras();
        for entry in cameras.iter_mut().filter(|e| e.camera.enabled) {
            if entry.slot.is_alive() {
                continue;
            }
            if let Slot::Running(worker) = std::mem::replace(&mut entry.slot, Slot::Idle) {
                join(&entry.camera.id, worker);
            }
            log::warn!("camera {}: worker ended; restarting", entry.camera.id);
            entry.slot = Slot::Running(self.spawn_worker(entry)?);
            restarted.push(entry.camera.id.clone());
        }
        Ok(restarted)
    }

    pub fn reload_identity_cache(&self) -> Result<usize> {
        self.processor.pipeline().identities().reload()
    }

    /// Validates and publishes new thresholds; every later frame uses them.
    pub fn update_thresholds(&self, thresholds: Thresholds) -> Result<(), ConfigurationError> {
        thresholds.validate()?;
        let mut guard = match self.thresholds.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = thresholds;
        log::info!(
            "thresholds updated: recognition {:.3} liveness {:.3} cooldown {:?}",
            thresholds.recognition_threshold,
            thresholds.liveness_threshold,
            thresholds.cooldown
        );
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        read_thresholds(&self.thresholds)
    }

    pub fn get_stream_status(&self) -> Vec<StreamStatus> {
        let cells: Vec<StatusCell> = self.cameras().iter().map(|e| e.status.clone()).collect();
        cells.iter().map(|cell| lock_status(cell).clone()).collect()
    }

    pub fn stream_status(&self, camera_id: &str) -> Option<StreamStatus> {
        let cell = self
            .cameras()
            .iter()
            .find(|e| e.camera.id == camera_id)
            .map(|e| e.status.clone())?;
        let status = lock_status(&cell).clone();
        Some(status)
    }

    pub fn system_status(&self) -> SystemStatus {
        let identities = self.processor.pipeline().identities().lookup_all();
        let thresholds = self.thresholds();
        SystemStatus {
            identities: identities.len(),
            identity_generation: identities.generation(),
            recognition_threshold: thresholds.recognition_threshold,
            liveness_threshold: thresholds.liveness_threshold,
            cooldown_secs: thresholds.cooldown.as_secs(),
            pipeline: self.processor.stats(),
            streams: self.get_stream_status(),
        }
    }

    fn cameras(&self) -> MutexGuard<'_, Vec<CameraEntry>> {
        match self.cameras.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait_settled<'a>(
        &self,
        guard: MutexGuard<'a, Vec<CameraEntry>>,
    ) -> MutexGuard<'a, Vec<CameraEntry>> {
        match self.settled.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Locks the camera list once `camera_id` is not mid-teardown.
    fn settled_entry(
        &self,
        camera_id: &str,
    ) -> Result<(MutexGuard<'_, Vec<CameraEntry>>, usize), ConfigurationError> {
        let mut cameras = self.cameras();
        loop {
            let index = position(&cameras, camera_id)?;
            if !matches!(cameras[index].slot, Slot::Stopping) {
                return Ok((cameras, index));
            }
            cameras = self.wait_settled(cameras);
        }
    }

    fn settle(&self, camera_id: &str) {
        let mut cameras = self.cameras();
        if let Ok(index) = position(&cameras, camera_id) {
            if matches!(cameras[index].slot, Slot::Stopping) {
                cameras[index].slot = Slot::Idle;
            }
        }
        self.settled.notify_all();
    }

    fn spawn_worker(&self, entry: &CameraEntry) -> Result<Worker> {
        self.pool.open_lane(&entry.camera);
        let stop = Arc::new(StopSignal::default());
        let handle = ConnectionWorker::new(
            entry.camera.clone(),
            self.timing,
            Arc::clone(&self.factory),
            Arc::clone(&self.pool),
            Arc::clone(&entry.status),
            Arc::clone(&stop),
        )
        .spawn()?;
        Ok(Worker { stop, handle })
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

fn position(cameras: &[CameraEntry], camera_id: &str) -> Result<usize, ConfigurationError> {
    cameras
        .iter()
        .position(|e| e.camera.id == camera_id)
        .ok_or_else(|| ConfigurationError(format!("unknown camera '{}'", camera_id)))
}

fn join(camera_id: &str, worker: Worker) {
    if worker.handle.join().is_err() {
        log::error!("camera {}: worker panicked", camera_id);
    }
}

/// Shared thresholds seeded from configuration.
pub fn shared_thresholds(thresholds: Thresholds) -> SharedThresholds {
    Arc::new(RwLock::new(thresholds))
}
