use std::sync::Arc;

use crate::error::ModelError;
use crate::frame::{BoundingBox, FaceCrop, Frame};
use crate::identity::Embedding;

/// Locates faces in a decoded frame.
///
/// Implementations must treat the frame as read-only and must not retain it
/// beyond the call.
pub trait FaceDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>, ModelError>;
}

/// Maps a face crop to a fixed-length embedding.
///
/// The embedding space must match the one used at enrollment.
pub trait FaceEmbedder: Send + Sync {
    fn name(&self) -> &'static str;

    fn embed(&self, crop: &FaceCrop) -> Result<Embedding, ModelError>;
}

/// Scores how likely a crop shows a live, present person.
///
/// Scores are in [0, 1]; higher means more likely live.
pub trait LivenessModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn liveness_score(&self, crop: &FaceCrop) -> Result<f32, ModelError>;
}

/// The three opaque models the pipeline consumes.
#[derive(Clone)]
pub struct ModelSet {
    pub detector: Arc<dyn FaceDetector>,
    pub embedder: Arc<dyn FaceEmbedder>,
    pub liveness: Arc<dyn LivenessModel>,
}

impl ModelSet {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        liveness: Arc<dyn LivenessModel>,
    ) -> Self {
        Self {
            detector,
            embedder,
            liveness,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "detector={} embedder={} liveness={}",
            self.detector.name(),
            self.embedder.name(),
            self.liveness.name()
        )
    }
}
