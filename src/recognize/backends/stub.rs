use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::recognize::extractor::{DetectedFace, EmbeddingExtractor};

/// Deterministic extractor for tests and demos: returns the same faces for every
/// non-empty image.
#[derive(Clone, Debug, Default)]
pub struct StubExtractor {
    faces: Vec<DetectedFace>,
    fail_warm_up: bool,
    calls: u64,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faces(faces: Vec<DetectedFace>) -> Self {
        Self {
            faces,
            ..Self::default()
        }
    }

    /// Make `warm_up` fail, to exercise backend selection.
    pub fn failing_warm_up(mut self) -> Self {
        self.fail_warm_up = true;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl EmbeddingExtractor for StubExtractor {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn extract(&mut self, image: &RgbImage) -> Vec<DetectedFace> {
        self.calls += 1;
        if image.width() == 0 || image.height() == 0 {
            log::warn!("stub extractor: empty image");
            return Vec::new();
        }
        self.faces.clone()
    }

    fn warm_up(&mut self) -> Result<()> {
        if self.fail_warm_up {
            return Err(anyhow!("stub warm-up failure"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognize::extractor::{BoundingBox, Embedding};

    #[test]
    fn returns_configured_faces_for_valid_images() {
        let face = DetectedFace {
            bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
            embedding: Embedding::new(vec![1.0, 0.0]),
            score: 0.9,
        };
        let mut stub = StubExtractor::with_faces(vec![face]);
        assert_eq!(stub.extract(&RgbImage::new(4, 4)).len(), 1);
        assert!(stub.extract(&RgbImage::new(0, 0)).is_empty());
        assert_eq!(stub.calls(), 2);
    }
}
