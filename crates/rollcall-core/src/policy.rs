//! Recognition decision policy.
//!
//! Turns raw per-face predictions into accepted attendance matches
//! under a confidence threshold and candidate-set restriction, and
//! guards enrollment against registering the same person under two
//! identities.

use crate::types::{CandidateSet, Prediction, RecognizedFace};

/// Minimum confidence (exclusive) for an attendance match.
pub const CONFIDENCE_THRESHOLD: f32 = 0.7;
/// Minimum confidence (exclusive) for flagging a duplicate enrollment.
pub const DUPLICATE_THRESHOLD: f32 = 0.8;

/// Filter raw predictions down to accepted matches: confidence strictly
/// above `threshold` AND identity present in the candidate set.
///
/// Faces are judged independently; duplicate identities across faces
/// are not collapsed here (the attendance layer upserts per identity).
/// No match is an empty result, never an error.
pub fn accept_matches(
    predictions: &[Prediction],
    candidates: &CandidateSet,
    threshold: f32,
) -> Vec<RecognizedFace> {
    predictions
        .iter()
        .filter(|p| p.confidence > threshold && candidates.contains(&p.identity))
        .map(|p| RecognizedFace {
            identity: p.identity.clone(),
            confidence: p.confidence,
            face: p.face.clone(),
        })
        .collect()
}

/// Enrollment duplicate guard: if any face in the enrollment image is
/// recognized as a DIFFERENT identity strictly above `threshold`, the
/// enrollment is a likely duplicate-person registration. Returns the
/// strongest conflicting prediction for human review.
pub fn duplicate_conflict<'a>(
    predictions: &'a [Prediction],
    enrolling_identity: &str,
    threshold: f32,
) -> Option<&'a Prediction> {
    predictions
        .iter()
        .filter(|p| p.identity != enrolling_identity && p.confidence > threshold)
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaceBox;

    fn pred(identity: &str, confidence: f32) -> Prediction {
        Prediction {
            identity: identity.to_string(),
            confidence,
            face: FaceBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 1.0,
            },
        }
    }

    fn candidates(ids: &[&str]) -> CandidateSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_accept_above_threshold_in_candidates() {
        let preds = vec![pred("1", 0.9)];
        let accepted = accept_matches(&preds, &candidates(&["1", "2"]), CONFIDENCE_THRESHOLD);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].identity, "1");
        assert!((accepted[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_reject_boundary_confidence() {
        // Exactly 0.7 is rejected: the threshold is strict.
        let preds = vec![pred("1", 0.7)];
        let accepted = accept_matches(&preds, &candidates(&["1"]), CONFIDENCE_THRESHOLD);
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_accept_just_above_boundary() {
        let preds = vec![pred("1", 0.700_1)];
        let accepted = accept_matches(&preds, &candidates(&["1"]), CONFIDENCE_THRESHOLD);
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn test_reject_outside_candidate_set() {
        let preds = vec![pred("9", 0.99)];
        let accepted = accept_matches(&preds, &candidates(&["1", "2"]), CONFIDENCE_THRESHOLD);
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_multiple_faces_judged_independently() {
        let preds = vec![
            pred("1", 0.95),
            pred("2", 0.5),  // below threshold
            pred("3", 0.85), // not a candidate
            pred("2", 0.75),
        ];
        let accepted = accept_matches(&preds, &candidates(&["1", "2"]), CONFIDENCE_THRESHOLD);
        let ids: Vec<&str> = accepted.iter().map(|m| m.identity.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_duplicate_identities_not_collapsed() {
        let preds = vec![pred("1", 0.8), pred("1", 0.9)];
        let accepted = accept_matches(&preds, &candidates(&["1"]), CONFIDENCE_THRESHOLD);
        assert_eq!(accepted.len(), 2);
    }

    #[test]
    fn test_empty_predictions_empty_result() {
        let accepted = accept_matches(&[], &candidates(&["1"]), CONFIDENCE_THRESHOLD);
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_duplicate_guard_flags_other_identity() {
        let preds = vec![pred("2", 0.85)];
        let conflict = duplicate_conflict(&preds, "1", DUPLICATE_THRESHOLD).unwrap();
        assert_eq!(conflict.identity, "2");
    }

    #[test]
    fn test_duplicate_guard_boundary_accepted() {
        // Exactly 0.8 passes: the guard is strict.
        let preds = vec![pred("2", 0.8)];
        assert!(duplicate_conflict(&preds, "1", DUPLICATE_THRESHOLD).is_none());
    }

    #[test]
    fn test_duplicate_guard_ignores_same_identity() {
        // Recognizing the enrolling identity itself is expected.
        let preds = vec![pred("1", 0.99)];
        assert!(duplicate_conflict(&preds, "1", DUPLICATE_THRESHOLD).is_none());
    }

    #[test]
    fn test_duplicate_guard_returns_strongest_conflict() {
        let preds = vec![pred("2", 0.82), pred("3", 0.95)];
        let conflict = duplicate_conflict(&preds, "1", DUPLICATE_THRESHOLD).unwrap();
        assert_eq!(conflict.identity, "3");
    }
}
