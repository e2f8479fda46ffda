//! Identity-label encoder.
//!
//! Bidirectional mapping between identity ids and the classifier head's
//! class indices. The class-to-index assignment is order-dependent and
//! regenerated on every train; the fitted encoder and the head weights
//! form one atomically-versioned pair and must never be loaded apart.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Fitted label encoder: `classes[i]` is the identity for class index `i`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Fit against the exact distinct label set present in `labels`.
    /// Classes are assigned indices in sorted order, so refitting on the
    /// same label set always produces the same mapping.
    pub fn fit<S: AsRef<str>>(labels: &[S]) -> Self {
        let distinct: BTreeSet<&str> = labels.iter().map(|l| l.as_ref()).collect();
        Self {
            classes: distinct.into_iter().map(str::to_owned).collect(),
        }
    }

    /// Class index for an identity, if it was present at fit time.
    pub fn encode(&self, identity: &str) -> Option<usize> {
        self.classes.binary_search_by(|c| c.as_str().cmp(identity)).ok()
    }

    /// Identity for a class index, if in range.
    pub fn decode(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_distinct_sorted() {
        let enc = LabelEncoder::fit(&["7", "3", "7", "12", "3"]);
        // Sorted lexicographically, duplicates removed
        assert_eq!(enc.classes(), &["12", "3", "7"]);
        assert_eq!(enc.num_classes(), 3);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let enc = LabelEncoder::fit(&["alice", "bob", "carol"]);
        for identity in ["alice", "bob", "carol"] {
            let idx = enc.encode(identity).unwrap();
            assert_eq!(enc.decode(idx), Some(identity));
        }
    }

    #[test]
    fn test_encode_unknown() {
        let enc = LabelEncoder::fit(&["1", "2"]);
        assert_eq!(enc.encode("3"), None);
        assert_eq!(enc.decode(5), None);
    }

    #[test]
    fn test_refit_is_stable() {
        let a = LabelEncoder::fit(&["b", "a", "c"]);
        let b = LabelEncoder::fit(&["c", "c", "b", "a"]);
        assert_eq!(a, b);
    }
}
