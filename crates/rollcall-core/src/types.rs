use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box for a detected face, in source-image pixels.
///
/// `confidence` is the raw detector score (unbounded); the classifier's
/// probability lives on [`Prediction`], not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Raw per-face classifier output: top-1 identity and its softmax
/// probability. Transient: produced fresh per recognition call, never
/// cached or persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub identity: String,
    /// Top-1 class probability in [0, 1]. Not independently calibrated.
    pub confidence: f32,
    pub face: FaceBox,
}

/// An accepted identity match, surfaced to the attendance layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizedFace {
    pub identity: String,
    pub confidence: f32,
    pub face: FaceBox,
}

/// The identities eligible to match during one recognition call.
///
/// Supplied externally per call (e.g. a session's target users that
/// have at least one reference image); never owned by the core.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    ids: HashSet<String>,
}

impl CandidateSet {
    pub fn contains(&self, identity: &str) -> bool {
        self.ids.contains(identity)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

impl<S: Into<String>> FromIterator<S> for CandidateSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_set_membership() {
        let set: CandidateSet = ["3", "7"].into_iter().collect();
        assert!(set.contains("3"));
        assert!(set.contains("7"));
        assert!(!set.contains("9"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_candidate_set_empty() {
        let set = CandidateSet::default();
        assert!(set.is_empty());
        assert!(!set.contains("1"));
    }
}
