use anyhow::Result;
use image::RgbImage;
use serde::Serialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Face embedding vector. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

impl std::fmt::Debug for Embedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Embedding(dim={})", self.0.len())
    }
}

/// Face box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn full_frame(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }
}

#[derive(Clone, Debug)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    /// Detector confidence in [0, 1].
    pub score: f32,
}

/// Embedding extraction backend.
///
/// `extract` never fails: malformed input or an inference error yields an empty
/// list and a logged diagnostic.
pub trait EmbeddingExtractor: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn extract(&mut self, image: &RgbImage) -> Vec<DetectedFace>;

    /// Run once after construction; a failure rejects the backend.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
