pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::Result;

pub use stub::{
    CenterFaceDetector, FixedEmbedder, FixedLiveness, HistogramEmbedder, StaticDetector,
    StubBackend,
};

#[cfg(feature = "backend-tract")]
pub use tract::{TractEmbedder, TractLiveness};

use crate::config::ModelSettings;
use crate::detect::backend::ModelSet;
use crate::error::ModelError;

/// Builds the model set named by `models.backend`.
///
/// `tract` pairs the centre-crop detector with ONNX embedder and liveness
/// models; without a liveness model path every face scores as live.
pub fn models_for(settings: &ModelSettings) -> Result<ModelSet> {
    match settings.backend.as_str() {
        "stub" => Ok(StubBackend::models()),
        "tract" => tract_models(settings),
        other => Err(anyhow::anyhow!("unknown model backend '{}'", other)),
    }
}

#[cfg(feature = "backend-tract")]
fn tract_models(settings: &ModelSettings) -> Result<ModelSet> {
    use std::sync::Arc;

    let embedder_path = settings
        .embedder_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("models.embedder_path is required for backend tract"))?;
    let embedder = Arc::new(TractEmbedder::new(embedder_path)?);
    let liveness: Arc<dyn crate::detect::LivenessModel> = match &settings.liveness_path {
        Some(path) => Arc::new(TractLiveness::new(path, 80, settings.liveness_live_index)?),
        None => {
            log::warn!("no liveness model configured; every face will be treated as live");
            Arc::new(FixedLiveness::new(1.0))
        }
    };
    Ok(ModelSet::new(
        Arc::new(CenterFaceDetector::default()),
        embedder,
        liveness,
    ))
}

#[cfg(not(feature = "backend-tract"))]
fn tract_models(_settings: &ModelSettings) -> Result<ModelSet> {
    Err(anyhow::anyhow!(
        "model backend tract requires the backend-tract feature"
    ))
}

/// Live-class probability from a liveness model's raw outputs.
///
/// A single output is a sigmoid "live" score; otherwise `values[live_index]`
/// of a per-class distribution. Any other shape, or a score outside [0, 1]
/// beyond rounding, is a model error.
pub fn live_class_score(values: &[f32], live_index: usize) -> Result<f32, ModelError> {
    let score = match values {
        [] => return Err(ModelError::new("liveness", "model produced no scores")),
        [single] => *single,
        many => *many.get(live_index).ok_or_else(|| {
            ModelError::new(
                "liveness",
                format!(
                    "live class index {} out of range for {} outputs",
                    live_index,
                    many.len()
                ),
            )
        })?,
    };
    if !score.is_finite() {
        return Err(ModelError::new("liveness", "non-finite live score"));
    }
    if !(-1e-3..=1.0 + 1e-3).contains(&score) {
        return Err(ModelError::new(
            "liveness",
            format!("live score {} is not a probability", score),
        ));
    }
    Ok(score.clamp(0.0, 1.0))
}
