//! Precomputed-embedding collaborators.
//!
//! Face detection and embedding run outside this tool. Their output reaches
//! us as JSON: a sidecar file next to each reference image, and a JSON-lines
//! stream of frames and commands for live sessions.

use roster_core::gallery::ExtractError;
use roster_core::{
    BoundingBox, Command, Detection, Embedding, EmbeddingExtractor, FrameSource, ReferenceImage,
    SourceError, SourceEvent,
};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

/// One face as written by the extraction tool: either a bare vector or an
/// object with its location.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FaceRecord {
    Bare(Vec<f32>),
    Located {
        #[serde(default)]
        location: BoundingBox,
        embedding: Vec<f32>,
    },
}

impl FaceRecord {
    fn into_detection(self, model: &str) -> Detection {
        let (location, values) = match self {
            Self::Bare(values) => (BoundingBox::default(), values),
            Self::Located {
                location,
                embedding,
            } => (location, embedding),
        };
        Detection {
            location,
            embedding: Embedding {
                values,
                model_version: Some(model.to_string()),
            },
        }
    }
}

/// Reads `<stem>.json` beside each reference image.
pub struct SidecarExtractor {
    model: String,
}

impl SidecarExtractor {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    pub fn sidecar_path(image: &Path) -> PathBuf {
        image.with_extension("json")
    }
}

impl EmbeddingExtractor for SidecarExtractor {
    fn extract(&mut self, item: &ReferenceImage) -> Result<Vec<Detection>, ExtractError> {
        let path = Self::sidecar_path(&item.path);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            ExtractError::Failed(format!("embedding sidecar {}: {e}", path.display()))
        })?;
        let faces: Vec<FaceRecord> = serde_json::from_str(&raw).map_err(|e| {
            ExtractError::Failed(format!("embedding sidecar {}: {e}", path.display()))
        })?;
        tracing::trace!(
            identity = %item.identity,
            width = item.image.width(),
            height = item.image.height(),
            faces = faces.len(),
            "read embedding sidecar"
        );
        Ok(faces
            .into_iter()
            .map(|f| f.into_detection(&self.model))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FrameLine {
    Command { command: Command },
    Frame { faces: Vec<FaceRecord> },
}

/// JSON-lines frame stream. Blank lines are ignored.
///
/// ```text
/// {"faces": [[0.1, 0.2, ...], {"location": {...}, "embedding": [...]}]}
/// {"command": "save"}
/// ```
pub struct JsonlSource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    model: String,
}

impl JsonlSource {
    pub fn open(path: impl Into<PathBuf>, model: impl Into<String>) -> Result<Self, SourceError> {
        let path = path.into();
        let file = File::open(&path)
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "frame source opened");
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
            model: model.into(),
        })
    }
}

impl FrameSource for JsonlSource {
    fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line.map_err(|e| SourceError::Read(format!("{}: {e}", self.path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: FrameLine = serde_json::from_str(&line).map_err(|e| {
                SourceError::Read(format!("{}:{}: {e}", self.path.display(), self.line_no))
            })?;
            return Ok(Some(match parsed {
                FrameLine::Command { command } => SourceEvent::Command(command),
                FrameLine::Frame { faces } => SourceEvent::Frame(
                    faces
                        .into_iter()
                        .map(|f| f.into_detection(&self.model))
                        .collect(),
                ),
            }));
        }
        Ok(None)
    }
}

impl Drop for JsonlSource {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), lines = self.line_no, "frame source closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_source_reads_frames_and_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"faces\": [[1.0, 0.0]]}\n",
                "\n",
                "{\"faces\": []}\n",
                "{\"command\": \"save\"}\n",
                "{\"faces\": [{\"location\": {\"x\": 1, \"y\": 2, \"width\": 3, \"height\": 4}, \"embedding\": [0.0, 1.0]}]}\n",
            ),
        )
        .unwrap();

        let mut source = JsonlSource::open(&path, "hog").unwrap();

        let Some(SourceEvent::Frame(first)) = source.next_event().unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(first[0].embedding.values, vec![1.0, 0.0]);
        assert_eq!(first[0].embedding.model_version.as_deref(), Some("hog"));

        assert_eq!(source.next_event().unwrap(), Some(SourceEvent::Frame(vec![])));
        assert_eq!(
            source.next_event().unwrap(),
            Some(SourceEvent::Command(Command::Save))
        );

        let Some(SourceEvent::Frame(last)) = source.next_event().unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(last[0].location.width, 3.0);
        assert!(source.next_event().unwrap().is_none());
    }

    #[test]
    fn test_jsonl_source_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");
        std::fs::write(&path, "{\"faces\": [[1.0]]}\n{\"command\": \"dance\"}\n").unwrap();

        let mut source = JsonlSource::open(&path, "hog").unwrap();
        assert!(source.next_event().unwrap().is_some());
        let err = source.next_event().unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");
    }

    #[test]
    fn test_missing_frame_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonlSource::open(dir.path().join("none.jsonl"), "hog").err().unwrap();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[test]
    fn test_sidecar_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("Jane_Doe.png");
        std::fs::write(
            SidecarExtractor::sidecar_path(&image_path),
            "[[0.5, 0.5], [0.1, 0.9]]",
        )
        .unwrap();

        let item = ReferenceImage {
            identity: "Jane_Doe".into(),
            path: image_path,
            image: image::DynamicImage::new_luma8(2, 2),
        };
        let faces = SidecarExtractor::new("cnn").extract(&item).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].embedding.values, vec![0.5, 0.5]);
        assert_eq!(faces[0].embedding.model_version.as_deref(), Some("cnn"));
    }

    #[test]
    fn test_sidecar_missing_is_extract_error() {
        let dir = tempfile::tempdir().unwrap();
        let item = ReferenceImage {
            identity: "ghost".into(),
            path: dir.path().join("ghost.png"),
            image: image::DynamicImage::new_luma8(1, 1),
        };
        assert!(SidecarExtractor::new("hog").extract(&item).is_err());
    }
}
