/// Best identity for a probe embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexMatch {
    pub name: String,
    pub similarity: f32,
}

/// Nearest-identity search over enrolled embeddings.
///
/// The matcher only depends on this trait, so an approximate index can replace
/// the linear scan in [`IdentitySnapshot`](super::store::IdentitySnapshot)
/// without touching recognition.
pub trait IdentityIndex: Send + Sync {
    /// Highest-similarity identity among vectors of the probe's dimension, or
    /// `None` when nothing is comparable.
    fn best_match(&self, probe: &[f32]) -> Option<IndexMatch>;

    /// Number of indexed vectors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
