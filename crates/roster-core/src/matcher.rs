//! Identity matching: nearest gallery entry by Euclidean distance.

use crate::types::{Embedding, Gallery, MatchResult};

/// Strategy for comparing a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// Confidence is `max(0, 1 - distance)`. A match is accepted when the
/// minimum distance is `<= threshold`. Equidistant minima resolve to the
/// first entry in gallery insertion order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        // Strict `<` keeps the earliest entry on ties.
        for (i, entry) in gallery.entries().iter().enumerate() {
            let dist = probe.euclidean_distance(&entry.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let Some(idx) = best_idx else {
            return MatchResult::unknown();
        };

        let confidence = (1.0 - best_dist).max(0.0);
        let identity = if best_dist <= threshold {
            Some(gallery.entries()[idx].identity.clone())
        } else {
            None
        };

        MatchResult {
            identity,
            confidence,
            distance: Some(best_dist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn gallery(entries: &[(&str, &[f32])]) -> Gallery {
        let mut g = Gallery::new();
        for (name, values) in entries {
            g.insert(*name, emb(values)).unwrap();
        }
        g
    }

    #[test]
    fn test_match_nearest_within_threshold() {
        let g = gallery(&[("alice", &[1.0, 0.0, 0.0]), ("bob", &[0.0, 1.0, 0.0])]);
        let result = EuclideanMatcher.compare(&emb(&[0.9, 0.1, 0.0]), &g, 0.5);

        assert_eq!(result.identity.as_deref(), Some("alice"));
        let expected_dist = (0.01f32 + 0.01).sqrt();
        assert!((result.distance.unwrap() - expected_dist).abs() < 1e-5);
        assert!((result.confidence - 0.8586).abs() < 1e-3, "got {}", result.confidence);
    }

    #[test]
    fn test_match_empty_gallery() {
        let result = EuclideanMatcher.compare(&emb(&[1.0, 0.0]), &Gallery::new(), 0.5);
        assert!(!result.matched());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.distance, None);
    }

    #[test]
    fn test_match_threshold_is_inclusive() {
        let g = gallery(&[("alice", &[0.5, 0.0, 0.0])]);
        let probe = emb(&[1.0, 0.0, 0.0]);

        let at = EuclideanMatcher.compare(&probe, &g, 0.5);
        assert_eq!(at.distance, Some(0.5));
        assert_eq!(at.identity.as_deref(), Some("alice"));
        assert!((at.confidence - 0.5).abs() < 1e-6);

        let below = EuclideanMatcher.compare(&probe, &g, 0.49);
        assert!(!below.matched());
    }

    #[test]
    fn test_rejected_match_still_reports_confidence() {
        let g = gallery(&[("alice", &[1.0, 0.0]), ("bob", &[0.0, 1.0])]);
        let result = EuclideanMatcher.compare(&emb(&[0.4, 0.0]), &g, 0.5);
        assert!(!result.matched());
        assert!((result.distance.unwrap() - 0.6).abs() < 1e-6);
        assert!((result.confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_clamped_at_zero() {
        let g = gallery(&[("alice", &[1.0, 0.0])]);
        let result = EuclideanMatcher.compare(&emb(&[-2.0, 0.0]), &g, 0.5);
        assert_eq!(result.confidence, 0.0);
        assert!(!result.matched());
    }

    #[test]
    fn test_tie_break_picks_first_inserted() {
        let g = gallery(&[
            ("decoy", &[0.0, 0.0, 1.0]),
            ("first", &[1.0, 0.0, 0.0]),
            ("second", &[-1.0, 0.0, 0.0]),
        ]);
        // Equidistant (1.0) from every entry.
        let probe = emb(&[0.0, 0.0, 0.0]);
        for _ in 0..10 {
            let result = EuclideanMatcher.compare(&probe, &g, 1.0);
            assert_eq!(result.identity.as_deref(), Some("decoy"));
        }

        let g = gallery(&[("first", &[1.0, 0.0]), ("second", &[-1.0, 0.0])]);
        let result = EuclideanMatcher.compare(&emb(&[0.0, 0.0]), &g, 1.0);
        assert_eq!(result.identity.as_deref(), Some("first"));
    }

    #[test]
    fn test_scans_whole_gallery() {
        // Best match is the last entry.
        let g = gallery(&[
            ("decoy1", &[0.0, 1.0, 0.0]),
            ("decoy2", &[0.0, 0.0, 1.0]),
            ("match", &[1.0, 0.0, 0.0]),
        ]);
        let result = EuclideanMatcher.compare(&emb(&[1.0, 0.0, 0.0]), &g, 0.5);
        assert_eq!(result.identity.as_deref(), Some("match"));
        assert!((result.confidence - 1.0).abs() < 1e-6);
    }
}
