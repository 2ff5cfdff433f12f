//! Face recognition: embedding extraction, enrolled identities and matching.

pub mod backends;
mod extractor;
mod index;
mod matcher;
mod similarity;
mod store;

pub use extractor::{BoundingBox, DetectedFace, Embedding, EmbeddingExtractor};
pub use index::{IdentityIndex, IndexMatch};
pub use matcher::{RecognitionMatcher, RecognitionResult, DEFAULT_SIMILARITY_THRESHOLD, UNKNOWN};
pub use similarity::cosine_similarity;
pub use store::{
    is_valid_person_name, parse_npy, DirectoryIdentityStore, IdentitySnapshot, IdentityStore,
    InMemoryIdentityStore,
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Execution backend for the embedding extractor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Gpu,
    Cpu,
}

impl Accelerator {
    pub fn as_str(self) -> &'static str {
        match self {
            Accelerator::Gpu => "gpu",
            Accelerator::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Accelerator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" | "cuda" => Ok(Accelerator::Gpu),
            "cpu" => Ok(Accelerator::Cpu),
            other => Err(anyhow!("unknown accelerator '{}'", other)),
        }
    }
}

/// Outcome of trying each accelerator in order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SelectionReport {
    pub selected: Option<Accelerator>,
    /// Accelerators that failed, with the reason.
    pub failures: Vec<(Accelerator, String)>,
}

pub struct ExtractorSelection {
    pub extractor: Option<Box<dyn EmbeddingExtractor>>,
    pub report: SelectionReport,
}

impl fmt::Debug for ExtractorSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractorSelection")
            .field("extractor", &self.extractor.as_ref().map(|e| e.name()))
            .field("report", &self.report)
            .finish()
    }
}

/// Try `order` front to back; the first extractor that builds and warms up
/// wins. With no winner the pipeline runs motion-only.
pub fn select_extractor<F>(order: &[Accelerator], factory: F) -> ExtractorSelection
where
    F: Fn(Accelerator) -> Result<Box<dyn EmbeddingExtractor>>,
{
    let mut report = SelectionReport::default();
    for &accelerator in order {
        let attempt = factory(accelerator).and_then(|mut extractor| {
            extractor.warm_up()?;
            Ok(extractor)
        });
        match attempt {
            Ok(extractor) => {
                log::info!(
                    "embedding extractor '{}' ready on {}",
                    extractor.name(),
                    accelerator
                );
                report.selected = Some(accelerator);
                return ExtractorSelection {
                    extractor: Some(extractor),
                    report,
                };
            }
            Err(err) => {
                log::warn!("embedding extractor unavailable on {}: {:#}", accelerator, err);
                report.failures.push((accelerator, format!("{:#}", err)));
            }
        }
    }
    log::warn!("no embedding extractor available; recognition disabled (motion-only)");
    ExtractorSelection {
        extractor: None,
        report,
    }
}

/// Factory for the extractors compiled into this build.
pub fn default_extractor_factory(
    model_path: Option<PathBuf>,
    embedding_dim: usize,
) -> impl Fn(Accelerator) -> Result<Box<dyn EmbeddingExtractor>> {
    move |accelerator| build_extractor(accelerator, model_path.as_deref(), embedding_dim)
}

#[cfg(feature = "backend-tract")]
fn build_extractor(
    accelerator: Accelerator,
    model_path: Option<&std::path::Path>,
    embedding_dim: usize,
) -> Result<Box<dyn EmbeddingExtractor>> {
    match accelerator {
        Accelerator::Gpu => Err(anyhow!("tract backend runs on the CPU only")),
        Accelerator::Cpu => {
            let path = model_path.ok_or_else(|| anyhow!("recognition.model_path is not set"))?;
            Ok(Box::new(backends::TractExtractor::new(
                path,
                backends::tract::DEFAULT_INPUT_SIZE,
                embedding_dim,
            )?))
        }
    }
}

#[cfg(not(feature = "backend-tract"))]
fn build_extractor(
    _accelerator: Accelerator,
    _model_path: Option<&std::path::Path>,
    _embedding_dim: usize,
) -> Result<Box<dyn EmbeddingExtractor>> {
    Err(anyhow!("built without an embedding backend"))
}
