mod backend;
pub mod backends;
mod metric;
mod pipeline;
mod result;

pub use backend::{FaceDetector, FaceEmbedder, LivenessModel, ModelSet};
pub use backends::{
    models_for, CenterFaceDetector, FixedEmbedder, FixedLiveness, HistogramEmbedder,
    StaticDetector, StubBackend,
};
pub use metric::{metric_for, CosineDistance, DistanceMetric, EuclideanDistance};
pub(crate) use pipeline::read_thresholds;
pub use pipeline::{DetectionPipeline, PipelineSettings, SharedThresholds};
pub use result::{DetectionCandidate, SubjectKey};
