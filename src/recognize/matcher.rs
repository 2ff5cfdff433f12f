use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use super::extractor::{BoundingBox, DetectedFace, EmbeddingExtractor};
use super::index::IdentityIndex;
use super::store::IdentityStore;
use crate::frame::Frame;

/// Label given to faces that match no enrolled identity.
pub const UNKNOWN: &str = "unknown";

/// Default minimum similarity for a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub name: String,
    /// Best similarity found, even when below the threshold. 0 when no
    /// enrolled vector was comparable.
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub detector_score: f32,
    pub is_known: bool,
}

/// Labels detected faces against the enrolled identities.
pub struct RecognitionMatcher {
    extractor: Option<Mutex<Box<dyn EmbeddingExtractor>>>,
    store: Arc<dyn IdentityStore>,
    threshold: f32,
}

impl RecognitionMatcher {
    pub fn new(
        extractor: Option<Box<dyn EmbeddingExtractor>>,
        store: Arc<dyn IdentityStore>,
        threshold: f32,
    ) -> Self {
        Self {
            extractor: extractor.map(Mutex::new),
            store,
            threshold,
        }
    }

    pub fn has_extractor(&self) -> bool {
        self.extractor.is_some()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Recognize with the configured threshold.
    pub fn recognize_frame(&self, frame: &Frame) -> Result<Vec<RecognitionResult>> {
        self.recognize(frame, self.threshold)
    }

    /// Extract faces from `frame` and label each one.
    ///
    /// Without an extractor, or when extraction finds nothing, the result is
    /// empty.
    pub fn recognize(&self, frame: &Frame, threshold: f32) -> Result<Vec<RecognitionResult>> {
        let Some(extractor) = &self.extractor else {
            return Ok(Vec::new());
        };
        let faces = {
            // A panic in an earlier extraction leaves the lock poisoned; the
            // extractor itself is still usable.
            let mut extractor = extractor.lock().unwrap_or_else(PoisonError::into_inner);
            extractor.extract(frame.image())
        };
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let index = self.store.index()?;
        Ok(faces
            .iter()
            .map(|face| Self::match_face(index.as_ref(), face, threshold))
            .collect())
    }

    /// Label a single face against `index`.
    pub fn match_face(
        index: &dyn IdentityIndex,
        face: &DetectedFace,
        threshold: f32,
    ) -> RecognitionResult {
        let best = index.best_match(face.embedding.as_slice());
        let confidence = best.as_ref().map_or(0.0, |m| m.similarity);
        let (name, is_known) = match best {
            Some(m) if m.similarity >= threshold => (m.name, true),
            _ => (UNKNOWN.to_string(), false),
        };
        RecognitionResult {
            name,
            confidence,
            bbox: face.bbox,
            detector_score: face.score,
            is_known,
        }
    }
}

impl std::fmt::Debug for RecognitionMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionMatcher")
            .field("has_extractor", &self.has_extractor())
            .field("threshold", &self.threshold)
            .finish()
    }
}
