use std::sync::Arc;

use crate::config::MetricKind;

/// Embedding comparison. Lower distance means more similar.
///
/// Must be the same metric the enrollment side used to build references.
pub trait DistanceMetric: Send + Sync {
    fn name(&self) -> &'static str;

    /// Distance between two equal-length vectors.
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;
}

/// `1 - cosine_similarity`, in [0, 2]. Zero vectors are infinitely far.
#[derive(Clone, Copy, Debug, Default)]
pub struct CosineDistance;

impl DistanceMetric for CosineDistance {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (x, y) in a.iter().zip(b) {
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return f32::INFINITY;
        }
        let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
        (1.0 - similarity).clamp(0.0, 2.0)
    }
}

/// L2 distance. Meaningful against thresholds in [0, 1] for unit-norm embeddings.
#[derive(Clone, Copy, Debug, Default)]
pub struct EuclideanDistance;

impl DistanceMetric for EuclideanDistance {
    fn name(&self) -> &'static str {
        "euclidean"
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

pub fn metric_for(kind: MetricKind) -> Arc<dyn DistanceMetric> {
    match kind {
        MetricKind::Cosine => Arc::new(CosineDistance),
        MetricKind::Euclidean => Arc::new(EuclideanDistance),
    }
}
