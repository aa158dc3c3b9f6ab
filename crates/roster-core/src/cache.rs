//! Versioned on-disk cache for computed gallery embeddings.
//!
//! The cache is a JSON document tagged with a format name and version, the
//! gallery source it was built from, and the extraction model. An entry
//! count and a SHA-256 checksum over identities and embedding bytes guard
//! against truncated or hand-edited files. Any mismatch is reported as a
//! [`CacheError`] so the loader can discard the file and recompute.

use crate::types::{Embedding, Gallery, GalleryInsertError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CACHE_FORMAT: &str = "roster-gallery";
pub const CACHE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported cache format {format:?} version {version}")]
    UnsupportedFormat { format: String, version: u32 },
    #[error("cache was built for source {0}")]
    ForeignSource(String),
    #[error("cache was built with model {0}")]
    ModelMismatch(String),
    #[error("cache header claims {header} entries, found {actual}")]
    CountMismatch { header: usize, actual: usize },
    #[error("cache checksum mismatch")]
    ChecksumMismatch,
    #[error("cache entry rejected: {0}")]
    InvalidEntry(#[from] GalleryInsertError),
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    format: String,
    version: u32,
    source: String,
    model: String,
    count: usize,
    checksum: String,
    entries: Vec<CachedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry {
    identity: String,
    values: Vec<f32>,
}

/// Cache file bound to one gallery source and one extraction model.
#[derive(Debug, Clone)]
pub struct GalleryCache {
    path: PathBuf,
    source: String,
    model: String,
}

impl GalleryCache {
    pub fn new(path: impl Into<PathBuf>, source: &Path, model: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source_key(source),
            model: model.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the cache. `Ok(None)` means no cache file exists.
    pub fn load(&self) -> Result<Option<Gallery>, CacheError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: CacheFile = serde_json::from_slice(&raw)?;

        if file.format != CACHE_FORMAT || file.version != CACHE_VERSION {
            return Err(CacheError::UnsupportedFormat {
                format: file.format,
                version: file.version,
            });
        }
        if file.source != self.source {
            return Err(CacheError::ForeignSource(file.source));
        }
        if file.model != self.model {
            return Err(CacheError::ModelMismatch(file.model));
        }
        if file.count != file.entries.len() {
            return Err(CacheError::CountMismatch {
                header: file.count,
                actual: file.entries.len(),
            });
        }
        if checksum(&file.entries) != file.checksum {
            return Err(CacheError::ChecksumMismatch);
        }

        let mut gallery = Gallery::new();
        for entry in file.entries {
            gallery.insert(
                entry.identity,
                Embedding {
                    values: entry.values,
                    model_version: Some(self.model.clone()),
                },
            )?;
        }
        Ok(Some(gallery))
    }

    /// Persist the gallery, replacing any previous cache atomically.
    pub fn store(&self, gallery: &Gallery) -> Result<(), CacheError> {
        let entries: Vec<CachedEntry> = gallery
            .entries()
            .iter()
            .map(|e| CachedEntry {
                identity: e.identity.clone(),
                values: e.embedding.values.clone(),
            })
            .collect();

        let file = CacheFile {
            format: CACHE_FORMAT.to_string(),
            version: CACHE_VERSION,
            source: self.source.clone(),
            model: self.model.clone(),
            count: entries.len(),
            checksum: checksum(&entries),
            entries,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn source_key(source: &Path) -> String {
    std::fs::canonicalize(source)
        .unwrap_or_else(|_| source.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn checksum(entries: &[CachedEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update((entry.identity.len() as u64).to_le_bytes());
        hasher.update(entry.identity.as_bytes());
        hasher.update((entry.values.len() as u64).to_le_bytes());
        for v in &entry.values {
            hasher.update(v.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}
