//! Enrolled identity stores.
//!
//! On-disk layout (written by the enrollment tooling, read here):
//!
//! ```text
//! known_faces/
//!   alice/
//!     0001.npy      float32/float64 vector, shape (D,) or (1, D)
//!     0002.f32      raw little-endian float32, D values
//!   bob/
//!     ...
//! ```

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::SystemTime;

use super::extractor::Embedding;
use super::index::{IdentityIndex, IndexMatch};
use super::similarity::cosine_similarity;

/// Immutable view of the enrolled identities. Names iterate in sorted order.
#[derive(Clone, Debug, Default)]
pub struct IdentitySnapshot {
    identities: BTreeMap<String, Vec<Embedding>>,
}

impl IdentitySnapshot {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&[Embedding]> {
        self.identities.get(name).map(Vec::as_slice)
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn vector_count(&self) -> usize {
        self.identities.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// `(name, sample count)` per identity.
    pub fn known_people(&self) -> Vec<(String, usize)> {
        self.identities
            .iter()
            .map(|(name, vectors)| (name.clone(), vectors.len()))
            .collect()
    }
}

impl IdentityIndex for IdentitySnapshot {
    /// Linear scan over every vector of every identity. Ties keep the identity
    /// that sorts first.
    fn best_match(&self, probe: &[f32]) -> Option<IndexMatch> {
        let mut best: Option<IndexMatch> = None;
        for (name, vectors) in &self.identities {
            for vector in vectors.iter().filter(|v| v.dim() == probe.len()) {
                let similarity = cosine_similarity(probe, vector.as_slice());
                if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                    best = Some(IndexMatch {
                        name: name.clone(),
                        similarity,
                    });
                }
            }
        }
        best
    }

    fn len(&self) -> usize {
        self.vector_count()
    }
}

/// Source of enrolled identities.
pub trait IdentityStore: Send + Sync {
    /// Current identities; may be served from a cache.
    fn list(&self) -> Result<Arc<IdentitySnapshot>>;

    /// Drop any cache so the next `list` reloads.
    fn invalidate(&self);

    /// Search structure used by the matcher.
    fn index(&self) -> Result<Arc<dyn IdentityIndex>> {
        let snapshot: Arc<IdentitySnapshot> = self.list()?;
        Ok(snapshot)
    }

    fn known_people(&self) -> Result<Vec<(String, usize)>> {
        Ok(self.list()?.known_people())
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _.\-]{0,63}$").expect("static regex")
    })
}

/// Person names double as directory names.
pub fn is_valid_person_name(name: &str) -> bool {
    name_pattern().is_match(name) && name != "." && name != ".."
}

// ----------------------------------------------------------------------------
// In-memory store
// ----------------------------------------------------------------------------

/// Store held entirely in memory.
pub struct InMemoryIdentityStore {
    dim: usize,
    snapshot: Mutex<Arc<IdentitySnapshot>>,
}

impl InMemoryIdentityStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            snapshot: Mutex::new(Arc::new(IdentitySnapshot::default())),
        }
    }

    /// Append one sample for `name`.
    pub fn enroll(&self, name: &str, vector: Vec<f32>) -> Result<()> {
        if !is_valid_person_name(name) {
            bail!("invalid person name '{}'", name);
        }
        if vector.len() != self.dim {
            bail!(
                "embedding for '{}' has {} values, expected {}",
                name,
                vector.len(),
                self.dim
            );
        }
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| anyhow!("identity store lock poisoned"))?;
        let mut next = (**guard).clone();
        next.identities
            .entry(name.to_string())
            .or_default()
            .push(Embedding::new(vector));
        *guard = Arc::new(next);
        Ok(())
    }

    /// Delete every sample for `name`. Returns whether it existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| anyhow!("identity store lock poisoned"))?;
        let mut next = (**guard).clone();
        let existed = next.identities.remove(name).is_some();
        *guard = Arc::new(next);
        Ok(existed)
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn list(&self) -> Result<Arc<IdentitySnapshot>> {
        Ok(self
            .snapshot
            .lock()
            .map_err(|_| anyhow!("identity store lock poisoned"))?
            .clone())
    }

    fn invalidate(&self) {}
}

// ----------------------------------------------------------------------------
// Directory store
// ----------------------------------------------------------------------------

struct CachedSnapshot {
    snapshot: Arc<IdentitySnapshot>,
    fingerprint: Option<SystemTime>,
}

/// One directory per person, one file per sample. Cached until invalidated or
/// until the root or a person directory is modified.
pub struct DirectoryIdentityStore {
    root: PathBuf,
    dim: usize,
    cache: Mutex<Option<CachedSnapshot>>,
}

impl DirectoryIdentityStore {
    pub fn new(root: impl Into<PathBuf>, dim: usize) -> Self {
        Self {
            root: root.into(),
            dim,
            cache: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Latest modification time of the root and its person directories.
    fn fingerprint(&self) -> Option<SystemTime> {
        let mut latest = fs::metadata(&self.root).and_then(|m| m.modified()).ok()?;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    latest = latest.max(modified);
                }
            }
        }
        Some(latest)
    }

    fn load(&self) -> Result<IdentitySnapshot> {
        let mut snapshot = IdentitySnapshot::default();
        if !self.root.is_dir() {
            log::debug!("known faces directory {} does not exist", self.root.display());
            return Ok(snapshot);
        }

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("read known faces directory {}", self.root.display()))?;
        for entry in entries {
            let entry = entry.context("read known faces entry")?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !is_valid_person_name(&name) {
                log::warn!("skipping identity directory with invalid name: {}", path.display());
                continue;
            }

            let mut files: Vec<PathBuf> = fs::read_dir(&path)
                .with_context(|| format!("read identity directory {}", path.display()))?
                .flatten()
                .map(|e| e.path())
                .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("npy" | "f32")))
                .collect();
            files.sort();

            let mut vectors = Vec::with_capacity(files.len());
            for file in files {
                match read_sample(&file, self.dim) {
                    Ok(values) if values.len() == self.dim => vectors.push(Embedding::new(values)),
                    Ok(values) => log::warn!(
                        "skipping {}: {} values, expected {}",
                        file.display(),
                        values.len(),
                        self.dim
                    ),
                    Err(err) => log::warn!("skipping {}: {:#}", file.display(), err),
                }
            }
            if !vectors.is_empty() {
                snapshot.identities.insert(name, vectors);
            }
        }
        log::info!(
            "loaded {} identities ({} samples) from {}",
            snapshot.identity_count(),
            snapshot.vector_count(),
            self.root.display()
        );
        Ok(snapshot)
    }
}

impl IdentityStore for DirectoryIdentityStore {
    fn list(&self) -> Result<Arc<IdentitySnapshot>> {
        let fingerprint = self.fingerprint();
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("identity cache lock poisoned"))?;
        if let Some(cached) = cache.as_ref() {
            if cached.fingerprint == fingerprint {
                return Ok(cached.snapshot.clone());
            }
        }
        let snapshot = Arc::new(self.load()?);
        *cache = Some(CachedSnapshot {
            snapshot: snapshot.clone(),
            fingerprint,
        });
        Ok(snapshot)
    }

    fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// ----------------------------------------------------------------------------
// Sample decoding
// ----------------------------------------------------------------------------

fn read_sample(path: &Path, dim: usize) -> Result<Vec<f32>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => parse_npy(&bytes, Some(dim)),
        _ => parse_raw_f32(&bytes),
    }
}

fn parse_raw_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        bail!("raw f32 sample length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Decode a little-endian float32/float64 `.npy` vector of shape (D,) or (1, D).
///
/// With `expected_len`, a header declaring any other D is rejected before the
/// payload is touched.
pub fn parse_npy(bytes: &[u8], expected_len: Option<usize>) -> Result<Vec<f32>> {
    if bytes.len() < 10 || !bytes.starts_with(NPY_MAGIC) {
        bail!("not an npy file");
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            let raw = bytes.get(8..12).context("truncated npy header length")?;
            (u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize, 12)
        }
        other => bail!("unsupported npy version {}", other),
    };
    let header_end = header_start + header_len;
    let header = bytes
        .get(header_start..header_end)
        .context("truncated npy header")?;
    let header = std::str::from_utf8(header).context("npy header is not utf-8")?;
    let data = &bytes[header_end..];

    static DESCR: OnceLock<Regex> = OnceLock::new();
    static FORTRAN: OnceLock<Regex> = OnceLock::new();
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    let descr = DESCR
        .get_or_init(|| Regex::new(r"'descr'\s*:\s*'([<>|=]?)f([48])'").expect("static regex"))
        .captures(header)
        .context("npy dtype is not float32/float64")?;
    let fortran = FORTRAN
        .get_or_init(|| Regex::new(r"'fortran_order'\s*:\s*(True|False)").expect("static regex"))
        .captures(header)
        .context("npy header missing fortran_order")?;
    let shape = SHAPE
        .get_or_init(|| Regex::new(r"'shape'\s*:\s*\(([^)]*)\)").expect("static regex"))
        .captures(header)
        .context("npy header missing shape")?;

    if &descr[1] == ">" {
        bail!("big-endian npy data is not supported");
    }
    let dims: Vec<usize> = shape[1]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().context("invalid npy shape"))
        .collect::<Result<_>>()?;
    let count = match dims.as_slice() {
        [d] => *d,
        [1, d] | [d, 1] => *d,
        other => bail!("expected a 1-D embedding, got shape {:?}", other),
    };
    if &fortran[1] == "True" && dims.len() > 1 && dims[0] != 1 && dims[1] != 1 {
        bail!("fortran-ordered npy matrices are not supported");
    }

    if let Some(expected) = expected_len {
        if count != expected {
            bail!("npy holds {} values, expected {}", count, expected);
        }
    }

    let width: usize = if &descr[2] == "4" { 4 } else { 8 };
    let needed = count.checked_mul(width).context("npy shape too large")?;
    let data = data
        .get(..needed)
        .with_context(|| format!("npy data holds {} bytes, expected {}", data.len(), needed))?;
    let values = if width == 4 {
        data.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    } else {
        data.chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect()
    };
    Ok(values)
}
