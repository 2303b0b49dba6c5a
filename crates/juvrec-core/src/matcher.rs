//! Gallery matching by Euclidean distance.
//!
//! A single linear scan serves both the enrollment duplicate check and the
//! recognition lookup; callers state which one they are doing through
//! [`MatchIntent`] so the two policies cannot drift apart.

use crate::types::{Embedding, IdentityId};

/// Distance below which two embeddings are considered the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.4;

/// One stored (identity, embedding) pair.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: IdentityId,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched { identity: IdentityId, distance: f32 },
    NoMatch { best_distance: f32 },
    EmptyGallery,
}

impl MatchResult {
    pub fn identity(&self) -> Option<&IdentityId> {
        match self {
            MatchResult::Matched { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

/// Why a gallery is being searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchIntent {
    /// "Is this face already enrolled?" before storing a new record.
    DuplicateCheck,
    /// "Who is this?" when a returning subject is scanned.
    Identify,
}

impl MatchIntent {
    fn as_str(self) -> &'static str {
        match self {
            MatchIntent::DuplicateCheck => "duplicate_check",
            MatchIntent::Identify => "identify",
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, intent: MatchIntent, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult;
}

/// True when `candidate` lies strictly closer than `threshold` to `query`.
/// Incomparable embeddings never match.
pub fn within_threshold(query: &Embedding, candidate: &Embedding, threshold: f32) -> bool {
    query
        .distance(candidate)
        .is_some_and(|d| d < threshold)
}

/// Euclidean nearest-neighbour matcher over the full gallery.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, intent: MatchIntent, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        let mut compared = 0usize;

        // Always visit every entry; strict `<` keeps the first identity on ties.
        for (i, entry) in gallery.iter().enumerate() {
            let Some(distance) = probe.distance(&entry.embedding) else {
                tracing::warn!(
                    identity = %entry.identity,
                    probe_dim = probe.dim(),
                    stored_dim = entry.embedding.dim(),
                    "skipping incomparable gallery embedding"
                );
                continue;
            };
            compared += 1;
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        let result = match best {
            None => MatchResult::EmptyGallery,
            Some((idx, distance)) if within_threshold(probe, &gallery[idx].embedding, self.threshold) => {
                MatchResult::Matched {
                    identity: gallery[idx].identity.clone(),
                    distance,
                }
            }
            Some((_, distance)) => MatchResult::NoMatch {
                best_distance: distance,
            },
        };

        tracing::debug!(
            intent = intent.as_str(),
            gallery = gallery.len(),
            compared,
            threshold = self.threshold,
            ?result,
            "gallery compared"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity: IdentityId::from(id),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher::default().compare(MatchIntent::Identify, &probe, &[]);
        assert_eq!(result, MatchResult::EmptyGallery);
    }

    #[test]
    fn test_single_entry_within_threshold() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![entry("A", vec![0.3, 0.0])];
        let result = EuclideanMatcher::default().compare(MatchIntent::Identify, &probe, &gallery);
        match result {
            MatchResult::Matched { identity, distance } => {
                assert_eq!(identity.as_str(), "A");
                assert!((distance - 0.3).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_single_entry_outside_threshold() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![entry("A", vec![0.5, 0.0])];
        let result = EuclideanMatcher::default().compare(MatchIntent::Identify, &probe, &gallery);
        match result {
            MatchResult::NoMatch { best_distance } => assert!((best_distance - 0.5).abs() < 1e-6),
            other => panic!("expected no match, got {other:?}"),
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let probe = Embedding::new(vec![0.0]);
        let gallery = vec![entry("A", vec![0.25])];
        let result = EuclideanMatcher::new(0.25).compare(MatchIntent::Identify, &probe, &gallery);
        assert!(matches!(result, MatchResult::NoMatch { .. }));
    }

    #[test]
    fn test_closest_wins_not_first_inserted() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            entry("A", vec![0.3, 0.0]),
            entry("B", vec![0.0, 0.1]),
        ];
        let result = EuclideanMatcher::new(0.4).compare(MatchIntent::Identify, &probe, &gallery);
        match result {
            MatchResult::Matched { identity, distance } => {
                assert_eq!(identity.as_str(), "B");
                assert!((distance - 0.1).abs() < 1e-6);
            }
            other => panic!("expected B, got {other:?}"),
        }
    }

    #[test]
    fn test_tie_keeps_first_identity() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            entry("first", vec![0.2, 0.0]),
            entry("second", vec![0.0, 0.2]),
        ];
        let result = EuclideanMatcher::default().compare(MatchIntent::DuplicateCheck, &probe, &gallery);
        assert_eq!(result.identity().map(IdentityId::as_str), Some("first"));
    }

    #[test]
    fn test_incomparable_entries_skipped() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            entry("short", vec![0.0]),
            entry("ok", vec![0.1, 0.0]),
        ];
        let result = EuclideanMatcher::default().compare(MatchIntent::Identify, &probe, &gallery);
        assert_eq!(result.identity().map(IdentityId::as_str), Some("ok"));

        // A gallery of only incomparable entries behaves like an empty one.
        let result = EuclideanMatcher::default().compare(MatchIntent::Identify, &probe, &gallery[..1]);
        assert_eq!(result, MatchResult::EmptyGallery);
    }

    #[test]
    fn test_within_threshold() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.3, 0.0]);
        assert!(within_threshold(&a, &b, 0.4));
        assert!(!within_threshold(&a, &b, 0.3));
        assert!(!within_threshold(&a, &Embedding::new(vec![0.0]), 10.0));
    }
}
