//! pipeline → deduplicator → sink, for one admitted frame.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::CameraSource;
use crate::dedup::EventDeduplicator;
use crate::detect::DetectionPipeline;
use crate::frame::Frame;
use crate::pool::FrameHandler;
use crate::sink::{DetectionEvent, EventSink};

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    model_errors: AtomicU64,
    candidates: AtomicU64,
    suppressed: AtomicU64,
    committed: AtomicU64,
    persistence_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub frames: u64,
    pub model_errors: u64,
    pub candidates: u64,
    pub suppressed: u64,
    pub committed: u64,
    pub persistence_failures: u64,
}

pub struct FrameProcessor {
    pipeline: DetectionPipeline,
    dedup: EventDeduplicator,
    sink: EventSink,
    counters: Counters,
}

impl FrameProcessor {
    pub fn new(pipeline: DetectionPipeline, dedup: EventDeduplicator, sink: EventSink) -> Self {
        Self {
            pipeline,
            dedup,
            sink,
            counters: Counters::default(),
        }
    }

    pub fn pipeline(&self) -> &DetectionPipeline {
        &self.pipeline
    }

    /// Runs one frame through every stage and returns the events committed.
    ///
    /// A model failure skips the frame. A store failure drops that candidate
    /// and moves on to the next.
    pub fn process(&self, camera: &CameraSource, frame: &Frame) -> Vec<DetectionEvent> {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        let candidates = match self.pipeline.run(camera, frame) {
            Ok(candidates) => candidates,
            Err(err) => {
                self.counters.model_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "camera {}: frame {} skipped: {}",
                    camera.id,
                    frame.sequence,
                    err
                );
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for candidate in candidates {
            self.counters.candidates.fetch_add(1, Ordering::Relaxed);
            if !self.dedup.accept(&candidate) {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.sink.commit(&candidate, frame) {
                Ok(event) => {
                    self.counters.committed.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "event {}: camera {} subject {} distance {} liveness {:.3}{}",
                        event.id,
                        event.camera_id,
                        candidate.subject_key(),
                        event
                            .embedding_distance
                            .map(|d| format!("{:.3}", d))
                            .unwrap_or_else(|| "-".to_string()),
                        event.liveness_score,
                        if event.snapshot_missing {
                            " (no snapshot)"
                        } else {
                            ""
                        }
                    );
                    events.push(event);
                }
                Err(err) => {
                    self.counters
                        .persistence_failures
                        .fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "camera {}: dropping {} candidate: {}",
                        candidate.camera_id,
                        candidate.subject_key(),
                        err
                    );
                }
            }
        }
        events
    }

    pub fn stats(&self) -> ProcessorStats {
        let c = &self.counters;
        ProcessorStats {
            frames: c.frames.load(Ordering::Relaxed),
            model_errors: c.model_errors.load(Ordering::Relaxed),
            candidates: c.candidates.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

impl FrameHandler for FrameProcessor {
    fn handle(&self, camera: &CameraSource, frame: Frame) {
        self.process(camera, &frame);
    }
}
