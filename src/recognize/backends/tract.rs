#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, RgbImage};
use tract_onnx::prelude::*;

use crate::recognize::extractor::{BoundingBox, DetectedFace, Embedding, EmbeddingExtractor};

/// Standard input edge for ArcFace-style recognition models.
pub const DEFAULT_INPUT_SIZE: u32 = 112;

/// Tract-based ONNX embedding backend.
///
/// Treats the whole frame as a single face region: the frame is resized to the
/// model input, normalised to [-1, 1] and the output vector is L2-normalised.
/// Runs on the CPU only.
pub struct TractExtractor {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    embedding_dim: usize,
}

impl TractExtractor {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, embedding_dim: usize) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            embedding_dim,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = imageops::resize(
            image,
            self.input_size,
            self.input_size,
            imageops::FilterType::Triangle,
        );
        let size = self.input_size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            let value = resized.get_pixel(x as u32, y as u32)[channel] as f32;
            (value - 127.5) / 127.5
        })
        .into_tensor()
    }

    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let outputs = self
            .model
            .run(tvec!(self.build_input(image).into()))
            .context("run ONNX model")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values: Vec<f32> = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .iter()
            .copied()
            .collect();
        if values.len() != self.embedding_dim {
            return Err(anyhow!(
                "model produced {} values, expected {}",
                values.len(),
                self.embedding_dim
            ));
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Err(anyhow!("model produced a degenerate embedding"));
        }
        Ok(values.into_iter().map(|v| v / norm).collect())
    }
}

impl EmbeddingExtractor for TractExtractor {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn extract(&mut self, image: &RgbImage) -> Vec<DetectedFace> {
        if image.width() == 0 || image.height() == 0 {
            log::warn!("tract extractor: empty image");
            return Vec::new();
        }
        match self.embed(image) {
            Ok(values) => vec![DetectedFace {
                bbox: BoundingBox::full_frame(image.width(), image.height()),
                embedding: Embedding::new(values),
                score: 1.0,
            }],
            Err(err) => {
                log::warn!("tract extractor: {:#}", err);
                Vec::new()
            }
        }
    }

    fn warm_up(&mut self) -> Result<()> {
        let probe = RgbImage::from_pixel(self.input_size, self.input_size, image::Rgb([128, 128, 128]));
        self.embed(&probe).map(|_| ())
    }
}
