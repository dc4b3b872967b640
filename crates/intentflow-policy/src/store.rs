//! Durable policy state.
//!
//! Blob layout, all little-endian:
//!
//! ```text
//! magic  b"LTS1"
//! dim    u32
//! A⁻¹    dim × dim f64, row-major
//! b      dim f64
//! ```
//!
//! A missing file means fresh state. A file that is truncated, has the wrong
//! magic or dimension, holds non-finite values, or is not symmetric is logged
//! and treated as missing.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use intentflow_types::{IntentflowError, Result};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::linalg::Matrix;
use crate::thompson::PolicyState;

const MAGIC: &[u8; 4] = b"LTS1";

/// Symmetry tolerance accepted on load.
const SYMMETRY_TOL: f64 = 1e-6;

/// Whether intents share one posterior or each gets its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    /// One policy learned across all intents; the intent is part of the
    /// feature vector.
    #[default]
    Shared,
    PerIntent,
}

/// Load/save port for policy state, keyed by intent.
pub trait PolicyStore: Send + Sync {
    /// `Ok(None)` when there is no usable state for `intent`.
    fn load(&self, intent: &str, dim: usize) -> Result<Option<PolicyState>>;
    fn save(&self, intent: &str, state: &PolicyState) -> Result<()>;
    /// Removes all persisted state. Returns the number of files removed.
    fn clear(&self) -> Result<usize>;
}

/// Binary blob files next to `path`. Shared scope uses `path` itself; per-intent
/// scope uses `<stem>-<intent-slug>.<ext>` in the same directory.
#[derive(Debug, Clone)]
pub struct BinaryFileStore {
    path: PathBuf,
    scope: PolicyScope,
}

impl BinaryFileStore {
    pub fn new(path: impl Into<PathBuf>, scope: PolicyScope) -> Self {
        Self {
            path: path.into(),
            scope,
        }
    }

    pub fn path_for(&self, intent: &str) -> PathBuf {
        match self.scope {
            PolicyScope::Shared => self.path.clone(),
            PolicyScope::PerIntent => {
                let stem = self
                    .path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("policy");
                let file = match self.path.extension().and_then(|e| e.to_str()) {
                    Some(ext) => format!("{stem}-{}.{ext}", intent_slug(intent)),
                    None => format!("{stem}-{}", intent_slug(intent)),
                };
                self.path.with_file_name(file)
            }
        }
    }

    fn candidate_files(&self) -> Result<Vec<PathBuf>> {
        match self.scope {
            PolicyScope::Shared => Ok(vec![self.path.clone()]),
            PolicyScope::PerIntent => {
                let dir = match self.path.parent() {
                    Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                let stem = self
                    .path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("policy")
                    .to_string();
                if !dir.exists() {
                    return Ok(Vec::new());
                }
                let mut files = Vec::new();
                for entry in std::fs::read_dir(&dir)? {
                    let path = entry?.path();
                    let matches = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&format!("{stem}-")));
                    if matches {
                        files.push(path);
                    }
                }
                Ok(files)
            }
        }
    }
}

impl PolicyStore for BinaryFileStore {
    fn load(&self, intent: &str, dim: usize) -> Result<Option<PolicyState>> {
        let path = self.path_for(intent);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No policy state, starting fresh");
            return Ok(None);
        }
        match read_state(&path, dim) {
            Ok(state) => {
                tracing::debug!(path = %path.display(), dim, "Policy state loaded");
                Ok(Some(state))
            }
            Err(e @ IntentflowError::CorruptState { .. }) => {
                tracing::warn!(error = %e, "Ignoring unusable policy state, starting fresh");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn save(&self, intent: &str, state: &PolicyState) -> Result<()> {
        write_state(&self.path_for(intent), state)
    }

    fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.candidate_files()? {
            if path.exists() {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Writes the blob via a temporary sibling file and a rename.
pub fn write_state(path: &Path, state: &PolicyState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let dim = u32::try_from(state.dim())
        .map_err(|_| IntentflowError::Other(format!("dimension {} too large", state.dim())))?;

    let tmp = path.with_extension("tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(MAGIC)?;
        out.write_u32::<LittleEndian>(dim)?;
        for x in state.precision_inverse.as_slice() {
            out.write_f64::<LittleEndian>(*x)?;
        }
        for x in &state.weights {
            out.write_f64::<LittleEndian>(*x)?;
        }
        out.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), dim, "Policy state saved");
    Ok(())
}

/// Reads and validates a blob. Every format problem is reported as
/// [`IntentflowError::CorruptState`].
pub fn read_state(path: &Path, expected_dim: usize) -> Result<PolicyState> {
    let corrupt = |message: String| IntentflowError::CorruptState {
        path: path.to_path_buf(),
        message,
    };

    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut input = BufReader::new(file);

    let mut magic = [0u8; 4];
    input
        .read_exact(&mut magic)
        .map_err(|_| corrupt("file too short for header".into()))?;
    if &magic != MAGIC {
        return Err(corrupt("bad magic".into()));
    }
    let dim = input
        .read_u32::<LittleEndian>()
        .map_err(|_| corrupt("file too short for header".into()))? as usize;
    if dim != expected_dim {
        return Err(corrupt(format!(
            "dimension {dim} does not match expected {expected_dim}"
        )));
    }

    let expected_len = 8 + 8 * (dim as u64) * (dim as u64 + 1);
    if file_len != expected_len {
        return Err(corrupt(format!(
            "length {file_len} does not match {expected_len} for dimension {dim}"
        )));
    }

    let mut read_f64s = |count: usize| -> Result<Vec<f64>> {
        let mut values = vec![0.0; count];
        input
            .read_f64_into::<LittleEndian>(&mut values)
            .map_err(|e| corrupt(e.to_string()))?;
        Ok(values)
    };
    let matrix = read_f64s(dim * dim)?;
    let weights = read_f64s(dim)?;

    let precision_inverse =
        Matrix::from_row_major(dim, matrix).ok_or_else(|| corrupt("matrix size".into()))?;
    if !precision_inverse.is_finite() || weights.iter().any(|x| !x.is_finite()) {
        return Err(corrupt("non-finite values".into()));
    }
    if !precision_inverse.is_symmetric(SYMMETRY_TOL) {
        return Err(corrupt("matrix is not symmetric".into()));
    }
    if (0..dim).any(|i| precision_inverse.get(i, i) <= 0.0) {
        return Err(corrupt("matrix has a non-positive diagonal".into()));
    }

    Ok(PolicyState {
        precision_inverse,
        weights,
    })
}

/// File-name-safe, stable slug: sanitized prefix plus an xxh3 hash of the
/// full intent so long intents with a shared prefix stay distinct.
fn intent_slug(intent: &str) -> String {
    let mut slug = String::new();
    for c in intent.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let prefix: String = slug.trim_matches('-').chars().take(40).collect();
    let hash = xxh3_64(intent.as_bytes());
    format!("{}-{:08x}", prefix.trim_end_matches('-'), hash as u32)
}
