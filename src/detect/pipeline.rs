//! Detect → liveness → recognize, applied to one admitted frame.
//!
//! Liveness is gated before identity matching: a crop that fails the liveness
//! threshold is emitted as a spoof with no person id, and its embedding is
//! never computed.

use std::sync::{Arc, RwLock};

use crate::config::{CameraSource, DetectionSettings, Thresholds};
use crate::detect::backend::ModelSet;
use crate::detect::metric::DistanceMetric;
use crate::detect::result::DetectionCandidate;
use crate::error::ModelError;
use crate::frame::{BoundingBox, FaceCrop, Frame, Rotation};
use crate::identity::{Embedding, IdentityCache, IdentityMatch, IdentitySnapshot};

/// Thresholds shared between the pipeline, the deduplicator and the admin surface.
pub type SharedThresholds = Arc<RwLock<Thresholds>>;

pub(crate) fn read_thresholds(shared: &SharedThresholds) -> Thresholds {
    match shared.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    pub min_face_size: u32,
    pub detection_confidence: f32,
    pub liveness_enabled: bool,
    pub try_rotations: bool,
}

impl From<&DetectionSettings> for PipelineSettings {
    fn from(settings: &DetectionSettings) -> Self {
        Self {
            min_face_size: settings.min_face_size,
            detection_confidence: settings.detection_confidence,
            liveness_enabled: settings.liveness_enabled,
            try_rotations: settings.try_rotations,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&DetectionSettings::default())
    }
}

pub struct DetectionPipeline {
    models: ModelSet,
    identities: Arc<IdentityCache>,
    thresholds: SharedThresholds,
    metric: Arc<dyn DistanceMetric>,
    settings: PipelineSettings,
}

impl DetectionPipeline {
    pub fn new(
        models: ModelSet,
        identities: Arc<IdentityCache>,
        thresholds: SharedThresholds,
        metric: Arc<dyn DistanceMetric>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            models,
            identities,
            thresholds,
            metric,
            settings,
        }
    }

    pub fn identities(&self) -> &Arc<IdentityCache> {
        &self.identities
    }

    /// One candidate per accepted face. Any model failure fails the whole frame.
    pub fn run(
        &self,
        camera: &CameraSource,
        frame: &Frame,
    ) -> Result<Vec<DetectionCandidate>, ModelError> {
        let thresholds = read_thresholds(&self.thresholds);
        let boxes = self.models.detector.detect_faces(frame)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let snapshot = self.identities.lookup_all();

        let mut candidates = Vec::with_capacity(boxes.len());
        for bbox in boxes.into_iter().filter(|bbox| self.accepts_box(bbox)) {
            let Some(crop) = frame.crop(&bbox) else {
                continue;
            };
            let candidate = if self.settings.liveness_enabled {
                self.evaluate_with_liveness(camera, frame, bbox, crop, &snapshot, &thresholds)?
            } else {
                self.evaluate_without_liveness(camera, frame, bbox, crop, &snapshot, &thresholds)?
            };
            candidates.push(candidate);
        }
        Ok(candidates)
    }

    fn accepts_box(&self, bbox: &BoundingBox) -> bool {
        bbox.confidence >= self.settings.detection_confidence
            && bbox.width >= self.settings.min_face_size
            && bbox.height >= self.settings.min_face_size
    }

    fn evaluate_with_liveness(
        &self,
        camera: &CameraSource,
        frame: &Frame,
        bbox: BoundingBox,
        crop: FaceCrop,
        snapshot: &IdentitySnapshot,
        thresholds: &Thresholds,
    ) -> Result<DetectionCandidate, ModelError> {
        let (crop, score) = self.orient_by_liveness(crop, thresholds.liveness_threshold)?;
        if score < thresholds.liveness_threshold {
            log::debug!(
                "camera {}: liveness {:.3} < {:.3}, marking spoofed",
                camera.id,
                score,
                thresholds.liveness_threshold
            );
            return Ok(DetectionCandidate::spoofed(
                &camera.id,
                &camera.location,
                bbox,
                score,
                crop.rotation,
                frame.captured_at_ms,
            ));
        }

        let embedding = self.models.embedder.embed(&crop)?;
        let nearest = snapshot.nearest(&embedding, self.metric.as_ref());
        Ok(self.live_candidate(
            camera, frame, bbox, embedding, nearest, score, crop.rotation, thresholds,
        ))
    }

    /// Without a liveness model, orientation is chosen by recognition distance.
    fn evaluate_without_liveness(
        &self,
        camera: &CameraSource,
        frame: &Frame,
        bbox: BoundingBox,
        crop: FaceCrop,
        snapshot: &IdentitySnapshot,
        thresholds: &Thresholds,
    ) -> Result<DetectionCandidate, ModelError> {
        let embedding = self.models.embedder.embed(&crop)?;
        let nearest = snapshot.nearest(&embedding, self.metric.as_ref());
        let mut best = (embedding, nearest, Rotation::None);

        if self.settings.try_rotations && !is_match(&best.1, thresholds) && !snapshot.is_empty() {
            for rotation in Rotation::RETRIES {
                let embedding = self.models.embedder.embed(&crop.rotated(rotation))?;
                let nearest = snapshot.nearest(&embedding, self.metric.as_ref());
                if distance_of(&nearest) < distance_of(&best.1) {
                    best = (embedding, nearest, rotation);
                }
            }
        }

        let (embedding, nearest, rotation) = best;
        Ok(self.live_candidate(
            camera, frame, bbox, embedding, nearest, 1.0, rotation, thresholds,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn live_candidate(
        &self,
        camera: &CameraSource,
        frame: &Frame,
        bbox: BoundingBox,
        embedding: Embedding,
        nearest: Option<IdentityMatch>,
        liveness_score: f32,
        rotation: Rotation,
        thresholds: &Thresholds,
    ) -> DetectionCandidate {
        let nearest_distance = nearest.as_ref().map(|m| m.distance);
        let matched = nearest.filter(|m| m.distance < thresholds.recognition_threshold);
        DetectionCandidate::live(
            &camera.id,
            &camera.location,
            bbox,
            embedding,
            matched,
            nearest_distance,
            liveness_score,
            rotation,
            frame.captured_at_ms,
        )
    }

    /// Score the upright crop; if it falls short, try the other quarter turns
    /// and keep the best-scoring orientation.
    fn orient_by_liveness(
        &self,
        crop: FaceCrop,
        threshold: f32,
    ) -> Result<(FaceCrop, f32), ModelError> {
        let upright = self.score(&crop)?;
        if upright >= threshold || !self.settings.try_rotations {
            return Ok((crop, upright));
        }
        let mut best: Option<(FaceCrop, f32)> = None;
        let mut best_score = upright;
        for rotation in Rotation::RETRIES {
            let rotated = crop.rotated(rotation);
            let score = self.score(&rotated)?;
            if score > best_score {
                best_score = score;
                best = Some((rotated, score));
            }
        }
        Ok(best.unwrap_or((crop, upright)))
    }

    fn score(&self, crop: &FaceCrop) -> Result<f32, ModelError> {
        let score = self.models.liveness.liveness_score(crop)?;
        if !score.is_finite() {
            return Err(ModelError::new("liveness", "non-finite score"));
        }
        Ok(score.clamp(0.0, 1.0))
    }
}

fn distance_of(nearest: &Option<IdentityMatch>) -> f32 {
    nearest.as_ref().map_or(f32::INFINITY, |m| m.distance)
}

fn is_match(nearest: &Option<IdentityMatch>, thresholds: &Thresholds) -> bool {
    distance_of(nearest) < thresholds.recognition_threshold
}
