use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Location of a detected face inside the frame it came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence, when the extractor reports one.
    #[serde(default)]
    pub confidence: f32,
}

/// Face embedding vector (dimensionality fixed by the extraction model, e.g. 128).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "hog").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Both embeddings must share a dimensionality; extra trailing values on
    /// the longer side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found by the extraction collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub location: BoundingBox,
    pub embedding: Embedding,
}

/// An enrolled identity and its reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: String,
    pub embedding: Embedding,
}

#[derive(Error, Debug, PartialEq)]
pub enum GalleryInsertError {
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
    #[error("embedding for {identity} has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        actual: usize,
    },
    #[error("embedding for {0} is empty")]
    EmptyEmbedding(String),
}

/// Enrolled identities in insertion order.
///
/// Identity names are unique and every embedding shares one dimensionality.
/// Iteration order is insertion order, which the matcher relies on to break
/// distance ties deterministically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        identity: impl Into<String>,
        embedding: Embedding,
    ) -> Result<(), GalleryInsertError> {
        let identity = identity.into();
        if embedding.values.is_empty() {
            return Err(GalleryInsertError::EmptyEmbedding(identity));
        }
        if self.contains(&identity) {
            return Err(GalleryInsertError::DuplicateIdentity(identity));
        }
        if let Some(expected) = self.dimension() {
            if embedding.dimension() != expected {
                return Err(GalleryInsertError::DimensionMismatch {
                    identity,
                    expected,
                    actual: embedding.dimension(),
                });
            }
        }
        self.entries.push(GalleryEntry {
            identity,
            embedding,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shared dimensionality, or `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dimension())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.iter().any(|e| e.identity == identity)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.identity.as_str())
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Best identity, present only when its distance is within threshold.
    pub identity: Option<String>,
    /// `max(0, 1 - distance)` of the best entry, reported even on rejection.
    pub confidence: f32,
    /// Distance to the nearest entry; `None` when the gallery is empty.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            identity: None,
            confidence: 0.0,
            distance: None,
        }
    }

    pub fn matched(&self) -> bool {
        self.identity.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown attendance status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for AttendanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(Self::Present),
            "Absent" => Ok(Self::Absent),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// One append-only ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity: String,
    pub status: AttendanceStatus,
    pub session_id: String,
    #[serde(with = "crate::timefmt")]
    pub timestamp: NaiveDateTime,
    pub confidence: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[0.0, 1.0, 0.0]);
        assert!((a.euclidean_distance(&b) - 2.0f32.sqrt()).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_gallery_preserves_insertion_order() {
        let mut gallery = Gallery::new();
        gallery.insert("zoe", emb(&[1.0, 0.0])).unwrap();
        gallery.insert("adam", emb(&[0.0, 1.0])).unwrap();
        let names: Vec<&str> = gallery.identities().collect();
        assert_eq!(names, vec!["zoe", "adam"]);
        assert_eq!(gallery.dimension(), Some(2));
    }

    #[test]
    fn test_gallery_rejects_duplicate_identity() {
        let mut gallery = Gallery::new();
        gallery.insert("alice", emb(&[1.0, 0.0])).unwrap();
        let err = gallery.insert("alice", emb(&[0.0, 1.0])).unwrap_err();
        assert_eq!(err, GalleryInsertError::DuplicateIdentity("alice".into()));
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_gallery_rejects_dimension_mismatch() {
        let mut gallery = Gallery::new();
        gallery.insert("alice", emb(&[1.0, 0.0])).unwrap();
        let err = gallery.insert("bob", emb(&[1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(
            err,
            GalleryInsertError::DimensionMismatch { expected: 2, actual: 3, .. }
        ));
    }

    #[test]
    fn test_gallery_rejects_empty_embedding() {
        let mut gallery = Gallery::new();
        assert!(gallery.insert("ghost", emb(&[])).is_err());
        assert!(gallery.is_empty());
        assert_eq!(gallery.dimension(), None);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [AttendanceStatus::Present, AttendanceStatus::Absent] {
            assert_eq!(status.as_str().parse::<AttendanceStatus>().unwrap(), status);
        }
        assert!("Late".parse::<AttendanceStatus>().is_err());
    }
}
