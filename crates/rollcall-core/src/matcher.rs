//! Nearest-signature matching against the gallery.

use crate::gallery::Gallery;
use crate::types::{DetectionEvent, MatchResult};

/// Strategy for comparing a detected face against the gallery.
pub trait Matcher {
    fn compare(&self, detection: &DetectionEvent, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// Scans the whole gallery in order and keeps the first entry reaching the
/// minimum distance, so equal distances resolve to the earlier entry.
/// A face is known only when `distance < threshold`; a distance exactly at
/// the threshold is unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, detection: &DetectionEvent, gallery: &Gallery, threshold: f32) -> MatchResult {
        let query = &detection.signature;
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            if entry.signature.len() != query.len() {
                continue;
            }
            let dist = query.euclidean_distance(&entry.signature);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                identity: Some(gallery.entries()[idx].identity.clone()),
                confidence: 1.0 - best_dist,
                region: detection.region,
            },
            Some(_) => MatchResult {
                identity: None,
                confidence: best_dist,
                region: detection.region,
            },
            None => MatchResult {
                identity: None,
                confidence: 0.0,
                region: detection.region,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GalleryEntry, Identity, IdentityId, Region, Signature};

    fn entry(id: i64, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity: Identity {
                id: IdentityId(id),
                display_name: format!("student {id}"),
            },
            signature: Signature::new(values),
        }
    }

    fn query(values: Vec<f32>) -> DetectionEvent {
        DetectionEvent {
            region: Region { x: 10, y: 20, width: 30, height: 40 },
            signature: Signature::new(values),
        }
    }

    #[test]
    fn test_exact_match_full_confidence() {
        let gallery = Gallery::new(vec![entry(1, vec![0.0, 1.0]), entry(2, vec![1.0, 0.0])]);
        let result = EuclideanMatcher.compare(&query(vec![1.0, 0.0]), &gallery, 0.6);
        assert_eq!(result.identity.map(|i| i.id), Some(IdentityId(2)));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.region, Region { x: 10, y: 20, width: 30, height: 40 });
    }

    #[test]
    fn test_scans_whole_gallery() {
        let gallery = Gallery::new(vec![
            entry(1, vec![0.0, 1.0, 0.0]),
            entry(2, vec![0.0, 0.0, 1.0]),
            entry(3, vec![1.0, 0.0, 0.0]),
        ]);
        let result = EuclideanMatcher.compare(&query(vec![0.9, 0.0, 0.0]), &gallery, 0.6);
        assert_eq!(result.identity.map(|i| i.id), Some(IdentityId(3)));
        assert!((result.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_distance_at_threshold_is_unknown() {
        let gallery = Gallery::new(vec![entry(1, vec![0.0])]);
        let result = EuclideanMatcher.compare(&query(vec![0.5]), &gallery, 0.5);
        assert!(result.identity.is_none());
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_unknown_reports_distance() {
        let gallery = Gallery::new(vec![entry(1, vec![0.0, 0.0])]);
        let result = EuclideanMatcher.compare(&query(vec![3.0, 4.0]), &gallery, 0.6);
        assert!(result.identity.is_none());
        assert!((result.confidence - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let result = EuclideanMatcher.compare(&query(vec![0.1, 0.2]), &Gallery::default(), 0.6);
        assert!(result.identity.is_none());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_tie_keeps_first_entry() {
        let gallery = Gallery::new(vec![entry(4, vec![1.0, 0.0]), entry(5, vec![-1.0, 0.0])]);
        let result = EuclideanMatcher.compare(&query(vec![0.0, 0.0]), &gallery, 1.5);
        assert_eq!(result.identity.map(|i| i.id), Some(IdentityId(4)));
    }

    #[test]
    fn test_repeated_calls_identical() {
        let gallery = Gallery::new(vec![entry(1, vec![0.2, 0.4]), entry(2, vec![0.4, 0.2])]);
        let p = query(vec![0.3, 0.3]);
        let first = EuclideanMatcher.compare(&p, &gallery, 0.6);
        for _ in 0..10 {
            assert_eq!(EuclideanMatcher.compare(&p, &gallery, 0.6), first);
        }
    }

    #[test]
    fn test_probe_of_other_dimension_never_matches() {
        let gallery = Gallery::new(vec![entry(1, vec![0.0, 0.0])]);
        let result = EuclideanMatcher.compare(&query(vec![0.0, 0.0, 0.0]), &gallery, 0.6);
        assert!(result.identity.is_none());
        assert_eq!(result.confidence, 0.0);
    }
}
