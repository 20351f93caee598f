#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{FaceEmbedder, LivenessModel};
use crate::detect::backends::live_class_score;
use crate::error::ModelError;
use crate::frame::FaceCrop;
use crate::identity::Embedding;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

/// Square-input ONNX model run on face crops.
///
/// Loads a local model file; no network I/O, nothing written to disk.
struct TractModel {
    plan: Plan,
    side: u32,
    mean: f32,
    scale: f32,
}

impl TractModel {
    fn load(model_path: &Path, side: u32, mean: f32, scale: f32) -> Result<Self> {
        let plan = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side as usize, side as usize)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        Ok(Self {
            plan,
            side,
            mean,
            scale,
        })
    }

    fn build_input(&self, crop: &FaceCrop) -> Result<Tensor> {
        let image = image::RgbImage::from_raw(crop.width, crop.height, crop.pixels().to_vec())
            .ok_or_else(|| anyhow!("crop buffer does not match its dimensions"))?;
        let resized = image::imageops::resize(
            &image,
            self.side,
            self.side,
            image::imageops::FilterType::Triangle,
        );
        let side = self.side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            (resized.get_pixel(x as u32, y as u32)[c] as f32 - self.mean) / self.scale
        });
        Ok(input.into_tensor())
    }

    fn run(&self, crop: &FaceCrop) -> Result<Vec<f32>> {
        let input = self.build_input(crop)?;
        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok(values.iter().copied().collect())
    }
}

/// FaceNet-style embedder: 160x160 input normalised to [-1, 1], L2-normalised output.
pub struct TractEmbedder {
    model: TractModel,
}

impl TractEmbedder {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Ok(Self {
            model: TractModel::load(model_path.as_ref(), 160, 127.5, 128.0)?,
        })
    }
}

impl FaceEmbedder for TractEmbedder {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn embed(&self, crop: &FaceCrop) -> Result<Embedding, ModelError> {
        let mut values = self
            .model
            .run(crop)
            .map_err(|e| ModelError::new("embedder", format!("{:#}", e)))?;
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Err(ModelError::new("embedder", "degenerate embedding"));
        }
        for v in &mut values {
            *v /= norm;
        }
        Ok(values)
    }
}

/// Live/spoof classifier. The score is the live-class probability: the sole
/// output of a sigmoid model, or output `live_index` of a softmax.
pub struct TractLiveness {
    model: TractModel,
    live_index: usize,
}

impl TractLiveness {
    pub fn new<P: AsRef<Path>>(model_path: P, side: u32, live_index: usize) -> Result<Self> {
        Ok(Self {
            model: TractModel::load(model_path.as_ref(), side, 0.0, 255.0)?,
            live_index,
        })
    }
}

impl LivenessModel for TractLiveness {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn liveness_score(&self, crop: &FaceCrop) -> Result<f32, ModelError> {
        let values = self
            .model
            .run(crop)
            .map_err(|e| ModelError::new("liveness", format!("{:#}", e)))?;
        live_class_score(&values, self.live_index)
    }
}
