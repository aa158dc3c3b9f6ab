//! Gallery loading from a directory of labeled reference images.
//!
//! Each image file's stem is the identity name (`Jane_Doe.jpg` → `Jane_Doe`).
//! Embedding extraction is delegated to an [`EmbeddingExtractor`]; per-item
//! failures are logged and skipped, never fatal.

use crate::cache::GalleryCache;
use crate::types::{Detection, Gallery};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions accepted as reference images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// A decoded reference image handed to the extractor.
pub struct ReferenceImage {
    pub identity: String,
    pub path: PathBuf,
    pub image: DynamicImage,
}

/// Converts an image into zero or more face embeddings.
///
/// An empty result means "no face found"; the loader skips such items.
pub trait EmbeddingExtractor {
    fn extract(&mut self, item: &ReferenceImage) -> Result<Vec<Detection>, ExtractError>;
}

/// Where a loaded gallery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalleryOrigin {
    Cache,
    Scan,
}

/// A reference item that did not make it into the gallery.
#[derive(Debug, Clone)]
pub struct SkippedItem {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub struct LoadedGallery {
    pub gallery: Gallery,
    pub origin: GalleryOrigin,
    pub skipped: Vec<SkippedItem>,
}

/// Builds the gallery from a source directory, preferring a valid cache.
pub struct GalleryLoader {
    source_dir: PathBuf,
    model: String,
    cache: Option<GalleryCache>,
    refresh: bool,
}

impl GalleryLoader {
    pub fn new(source_dir: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            source_dir: source_dir.into(),
            model: model.into(),
            cache: None,
            refresh: false,
        }
    }

    /// Enable the embedding cache at `path`.
    pub fn with_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache = Some(GalleryCache::new(path, &self.source_dir, self.model.clone()));
        self
    }

    /// Ignore any existing cache and recompute from the source images.
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn load<E: EmbeddingExtractor>(
        &self,
        extractor: &mut E,
    ) -> Result<LoadedGallery, GalleryError> {
        if let Some(gallery) = self.load_cached() {
            return Ok(LoadedGallery {
                gallery,
                origin: GalleryOrigin::Cache,
                skipped: Vec::new(),
            });
        }

        let (gallery, skipped) = self.scan(extractor)?;

        if let Some(cache) = &self.cache {
            if !gallery.is_empty() {
                match cache.store(&gallery) {
                    Ok(()) => tracing::info!(
                        path = %cache.path().display(),
                        count = gallery.len(),
                        "gallery cached"
                    ),
                    Err(e) => tracing::warn!(
                        path = %cache.path().display(),
                        error = %e,
                        "failed to write gallery cache"
                    ),
                }
            }
        }

        Ok(LoadedGallery {
            gallery,
            origin: GalleryOrigin::Scan,
            skipped,
        })
    }

    fn load_cached(&self) -> Option<Gallery> {
        if self.refresh {
            return None;
        }
        let cache = self.cache.as_ref()?;
        match cache.load() {
            Ok(Some(gallery)) if !gallery.is_empty() => {
                tracing::info!(
                    path = %cache.path().display(),
                    count = gallery.len(),
                    "loaded gallery from cache"
                );
                Some(gallery)
            }
            Ok(_) => {
                tracing::debug!(path = %cache.path().display(), "no usable gallery cache");
                None
            }
            Err(e) => {
                tracing::warn!(
                    path = %cache.path().display(),
                    error = %e,
                    "discarding gallery cache; recomputing"
                );
                None
            }
        }
    }

    fn scan<E: EmbeddingExtractor>(
        &self,
        extractor: &mut E,
    ) -> Result<(Gallery, Vec<SkippedItem>), GalleryError> {
        let mut gallery = Gallery::new();
        let mut skipped = Vec::new();

        if !self.source_dir.exists() {
            std::fs::create_dir_all(&self.source_dir).map_err(|source| GalleryError::Source {
                path: self.source_dir.clone(),
                source,
            })?;
            tracing::warn!(path = %self.source_dir.display(), "created missing gallery directory");
            return Ok((gallery, skipped));
        }

        let files = self.image_files()?;
        if files.is_empty() {
            tracing::warn!(path = %self.source_dir.display(), "no reference images found");
            return Ok((gallery, skipped));
        }

        tracing::info!(count = files.len(), "loading reference images");

        for path in files {
            let Some(identity) = path.file_stem().map(|s| s.to_string_lossy().into_owned())
            else {
                continue;
            };

            let mut skip = |reason: String| {
                tracing::warn!(path = %path.display(), %reason, "skipping reference image");
                skipped.push(SkippedItem {
                    path: path.clone(),
                    reason,
                });
            };

            let image = match image::open(&path) {
                Ok(image) => image,
                Err(e) => {
                    skip(format!("decode failed: {e}"));
                    continue;
                }
            };

            let item = ReferenceImage {
                identity,
                path: path.clone(),
                image,
            };

            let detections = match extractor.extract(&item) {
                Ok(d) => d,
                Err(e) => {
                    skip(e.to_string());
                    continue;
                }
            };

            let face_count = detections.len();
            let Some(first) = detections.into_iter().next() else {
                skip("no face found".to_string());
                continue;
            };
            if face_count > 1 {
                tracing::debug!(
                    identity = %item.identity,
                    faces = face_count,
                    "multiple faces in reference image; using the first"
                );
            }

            let mut embedding = first.embedding;
            if embedding.model_version.is_none() {
                embedding.model_version = Some(self.model.clone());
            }

            match gallery.insert(item.identity.clone(), embedding) {
                Ok(()) => tracing::info!(identity = %item.identity, "loaded reference embedding"),
                Err(e) => skip(e.to_string()),
            }
        }

        tracing::info!(
            loaded = gallery.len(),
            skipped = skipped.len(),
            "gallery scan complete"
        );
        Ok((gallery, skipped))
    }

    /// Reference image paths in sorted order, so gallery order is stable.
    fn image_files(&self) -> Result<Vec<PathBuf>, GalleryError> {
        let read_dir = std::fs::read_dir(&self.source_dir).map_err(|source| {
            GalleryError::Source {
                path: self.source_dir.clone(),
                source,
            }
        })?;

        let mut files: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image_file(path))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};
    use std::collections::HashMap;

    /// Returns canned embeddings keyed by identity and counts calls.
    #[derive(Default)]
    struct CannedExtractor {
        faces: HashMap<String, Vec<Vec<f32>>>,
        calls: usize,
    }

    impl CannedExtractor {
        fn with(mut self, identity: &str, faces: &[&[f32]]) -> Self {
            self.faces.insert(
                identity.to_string(),
                faces.iter().map(|f| f.to_vec()).collect(),
            );
            self
        }
    }

    impl EmbeddingExtractor for CannedExtractor {
        fn extract(&mut self, item: &ReferenceImage) -> Result<Vec<Detection>, ExtractError> {
            self.calls += 1;
            let faces = self
                .faces
                .get(&item.identity)
                .ok_or_else(|| ExtractError::Failed(format!("unknown {}", item.identity)))?;
            Ok(faces
                .iter()
                .map(|values| Detection {
                    location: BoundingBox::default(),
                    embedding: Embedding::new(values.clone()),
                })
                .collect())
        }
    }

    fn write_image(dir: &Path, name: &str) {
        image::GrayImage::new(4, 4).save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_missing_source_is_created_and_empty() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("students");
        let loader = GalleryLoader::new(&source, "hog");

        let loaded = loader.load(&mut CannedExtractor::default()).unwrap();
        assert!(loaded.gallery.is_empty());
        assert!(source.is_dir());
    }

    #[test]
    fn test_scan_skips_faceless_and_unreadable_items() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "bob.png");
        write_image(dir.path(), "alice.png");
        write_image(dir.path(), "empty.png");
        std::fs::write(dir.path().join("broken.jpg"), b"not an image").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut extractor = CannedExtractor::default()
            .with("alice", &[&[1.0, 0.0]])
            .with("bob", &[&[0.0, 1.0]])
            .with("empty", &[]);

        let loaded = GalleryLoader::new(dir.path(), "hog")
            .load(&mut extractor)
            .unwrap();

        let names: Vec<&str> = loaded.gallery.identities().collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(loaded.origin, GalleryOrigin::Scan);
        assert_eq!(loaded.skipped.len(), 2);
        assert_eq!(
            loaded.gallery.entries()[0].embedding.model_version.as_deref(),
            Some("hog")
        );
    }

    #[test]
    fn test_first_face_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png");
        let mut extractor =
            CannedExtractor::default().with("alice", &[&[1.0, 0.0], &[0.0, 1.0]]);

        let loaded = GalleryLoader::new(dir.path(), "hog")
            .load(&mut extractor)
            .unwrap();
        assert_eq!(loaded.gallery.entries()[0].embedding.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_cache_preferred_on_second_load() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png");
        let cache_path = dir.path().join(".gallery-cache.json");

        let mut extractor = CannedExtractor::default().with("alice", &[&[1.0, 0.0]]);
        let loader = GalleryLoader::new(dir.path(), "hog").with_cache(&cache_path);

        let first = loader.load(&mut extractor).unwrap();
        assert_eq!(first.origin, GalleryOrigin::Scan);
        assert!(cache_path.exists());

        let second = loader.load(&mut extractor).unwrap();
        assert_eq!(second.origin, GalleryOrigin::Cache);
        assert_eq!(second.gallery, first.gallery);
        assert_eq!(extractor.calls, 1);
    }

    #[test]
    fn test_refresh_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png");
        let cache_path = dir.path().join(".gallery-cache.json");
        let mut extractor = CannedExtractor::default().with("alice", &[&[1.0, 0.0]]);

        GalleryLoader::new(dir.path(), "hog")
            .with_cache(&cache_path)
            .load(&mut extractor)
            .unwrap();
        let again = GalleryLoader::new(dir.path(), "hog")
            .with_cache(&cache_path)
            .refresh(true)
            .load(&mut extractor)
            .unwrap();

        assert_eq!(again.origin, GalleryOrigin::Scan);
        assert_eq!(extractor.calls, 2);
    }

    #[test]
    fn test_corrupt_cache_falls_back_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png");
        let cache_path = dir.path().join(".gallery-cache.json");
        std::fs::write(&cache_path, b"{ truncated").unwrap();

        let mut extractor = CannedExtractor::default().with("alice", &[&[1.0, 0.0]]);
        let loaded = GalleryLoader::new(dir.path(), "hog")
            .with_cache(&cache_path)
            .load(&mut extractor)
            .unwrap();

        assert_eq!(loaded.origin, GalleryOrigin::Scan);
        assert_eq!(loaded.gallery.len(), 1);
        // Rewritten with a valid cache.
        let reread = GalleryCache::new(&cache_path, dir.path(), "hog")
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(reread.len(), 1);
    }

    #[test]
    fn test_empty_cache_entries_fall_back_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png");
        let cache_path = dir.path().join(".gallery-cache.json");
        let cache = GalleryCache::new(&cache_path, dir.path(), "hog");
        cache.store(&Gallery::new()).unwrap();
        // Well-formed and checksummed, but holds no entries.
        assert_eq!(cache.load().unwrap(), Some(Gallery::new()));

        let mut extractor = CannedExtractor::default().with("alice", &[&[1.0, 0.0]]);
        let loaded = GalleryLoader::new(dir.path(), "hog")
            .with_cache(&cache_path)
            .load(&mut extractor)
            .unwrap();

        assert_eq!(loaded.origin, GalleryOrigin::Scan);
        assert_eq!(extractor.calls, 1);
        assert_eq!(loaded.gallery.len(), 1);
        assert_eq!(cache.load().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        assert!(is_image_file(Path::new("a/Jane_Doe.JPG")));
        assert!(is_image_file(Path::new("b.tiff")));
        assert!(!is_image_file(Path::new(".gallery-cache.json")));
        assert!(!is_image_file(Path::new("noext")));
    }
}
