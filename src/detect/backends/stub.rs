//! Deterministic model stand-ins for tests and `stub://` deployments.

use std::sync::Arc;

use crate::detect::backend::{FaceDetector, FaceEmbedder, LivenessModel, ModelSet};
use crate::error::ModelError;
use crate::frame::{BoundingBox, FaceCrop, Frame};
use crate::identity::Embedding;

const HISTOGRAM_BINS: usize = 8;

/// Always reports the same boxes.
pub struct StaticDetector {
    boxes: Vec<BoundingBox>,
}

impl StaticDetector {
    pub fn new(boxes: Vec<BoundingBox>) -> Self {
        Self { boxes }
    }
}

impl FaceDetector for StaticDetector {
    fn name(&self) -> &'static str {
        "static"
    }

    fn detect_faces(&self, _frame: &Frame) -> Result<Vec<BoundingBox>, ModelError> {
        Ok(self.boxes.clone())
    }
}

/// Reports one face covering the central `fraction` of the frame.
///
/// Suits doorway cameras framed tightly on the subject, and the synthetic
/// source, where a face is always in shot.
pub struct CenterFaceDetector {
    fraction: f32,
}

impl CenterFaceDetector {
    pub fn new(fraction: f32) -> Self {
        Self {
            fraction: fraction.clamp(0.05, 1.0),
        }
    }
}

impl Default for CenterFaceDetector {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl FaceDetector for CenterFaceDetector {
    fn name(&self) -> &'static str {
        "center"
    }

    fn detect_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>, ModelError> {
        let w = (frame.width as f32 * self.fraction) as u32;
        let h = (frame.height as f32 * self.fraction) as u32;
        if w == 0 || h == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox::new(
            (frame.width - w) / 2,
            (frame.height - h) / 2,
            w,
            h,
            0.9,
        )])
    }
}

/// Always returns the same embedding.
pub struct FixedEmbedder {
    embedding: Embedding,
}

impl FixedEmbedder {
    pub fn new(embedding: Embedding) -> Self {
        Self { embedding }
    }
}

impl FaceEmbedder for FixedEmbedder {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn embed(&self, _crop: &FaceCrop) -> Result<Embedding, ModelError> {
        Ok(self.embedding.clone())
    }
}

/// Unit-length coarse colour histogram (8 bins per channel).
///
/// Not identity-bearing; it only gives stub deployments a stable,
/// content-derived vector to enroll against.
#[derive(Default)]
pub struct HistogramEmbedder;

impl FaceEmbedder for HistogramEmbedder {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn embed(&self, crop: &FaceCrop) -> Result<Embedding, ModelError> {
        let pixels = crop.pixels();
        if pixels.is_empty() {
            return Err(ModelError::new("embedder", "empty crop"));
        }
        let mut histogram = vec![0f32; HISTOGRAM_BINS * 3];
        for px in pixels.chunks_exact(3) {
            for (channel, &value) in px.iter().enumerate() {
                histogram[channel * HISTOGRAM_BINS + (value as usize * HISTOGRAM_BINS / 256)] +=
                    1.0;
            }
        }
        let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt();
        for v in &mut histogram {
            *v /= norm;
        }
        Ok(histogram)
    }
}

/// Always returns the same liveness score.
pub struct FixedLiveness {
    score: f32,
}

impl FixedLiveness {
    pub fn new(score: f32) -> Self {
        Self { score }
    }
}

impl LivenessModel for FixedLiveness {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn liveness_score(&self, _crop: &FaceCrop) -> Result<f32, ModelError> {
        Ok(self.score)
    }
}

/// Model set used when `models.backend = "stub"`.
pub struct StubBackend;

impl StubBackend {
    pub fn models() -> ModelSet {
        ModelSet::new(
            Arc::new(CenterFaceDetector::default()),
            Arc::new(HistogramEmbedder),
            Arc::new(FixedLiveness::new(1.0)),
        )
    }
}
