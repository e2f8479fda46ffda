//! Frozen convolutional feature backbone via ONNX Runtime.
//!
//! Transfer learning: the pretrained backbone is inference-only and is
//! never updated by training; it turns a preprocessed 224×224 face crop
//! into a fixed-width feature vector for the trainable head.

use ndarray::{Array1, Array3, Array4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

use crate::error::ClassifierError;

/// Classifier input edge length, in pixels.
pub const INPUT_SIZE: usize = 224;
/// Channel width of the backbone's final feature map.
pub const FEATURE_DIM: usize = 1280;

/// Produces a fixed-width feature vector from a preprocessed face crop.
///
/// The trait seam lets tests drive the classifier with a deterministic
/// stand-in instead of a real network.
pub trait FeatureExtractor {
    fn feature_dim(&self) -> usize;
    fn extract(&mut self, face: &Array3<f32>) -> Result<Array1<f32>, ClassifierError>;
}

/// Pretrained backbone loaded from an ONNX export.
///
/// Accepts exports that emit either globally-pooled `(1, D)` features
/// or a `(1, D, H, W)` feature map; the latter is average-pooled here.
pub struct OnnxBackbone {
    session: Session,
    feature_dim: usize,
}

impl OnnxBackbone {
    /// Load the backbone model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::BackboneNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded feature backbone"
        );

        Ok(Self {
            session,
            feature_dim: FEATURE_DIM,
        })
    }
}

impl FeatureExtractor for OnnxBackbone {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn extract(&mut self, face: &Array3<f32>) -> Result<Array1<f32>, ClassifierError> {
        // Add the batch dimension: (3, H, W) → (1, 3, H, W).
        let input: Array4<f32> = face.view().insert_axis(Axis(0)).to_owned();

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0].try_extract_tensor::<f32>()?;

        pool_features(raw, self.feature_dim)
    }
}

/// Reduce a raw backbone output to a `dim`-wide feature vector.
///
/// A `dim`-length output is already pooled; a `dim × spatial` output is
/// a CHW feature map and gets global average pooling per channel.
fn pool_features(raw: &[f32], dim: usize) -> Result<Array1<f32>, ClassifierError> {
    if raw.len() == dim {
        return Ok(Array1::from_vec(raw.to_vec()));
    }
    if raw.is_empty() || raw.len() % dim != 0 {
        return Err(ClassifierError::FeatureShape {
            expected: dim,
            got: raw.len(),
        });
    }

    let spatial = raw.len() / dim;
    let mut pooled = Array1::zeros(dim);
    for c in 0..dim {
        let channel = &raw[c * spatial..(c + 1) * spatial];
        pooled[c] = channel.iter().sum::<f32>() / spatial as f32;
    }
    Ok(pooled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_features_already_pooled() {
        let raw = vec![1.0, 2.0, 3.0];
        let pooled = pool_features(&raw, 3).unwrap();
        assert_eq!(pooled.to_vec(), raw);
    }

    #[test]
    fn test_pool_features_spatial_map() {
        // 2 channels × 4 spatial positions.
        let raw = vec![1.0, 1.0, 3.0, 3.0, 10.0, 10.0, 10.0, 10.0];
        let pooled = pool_features(&raw, 2).unwrap();
        assert!((pooled[0] - 2.0).abs() < 1e-6);
        assert!((pooled[1] - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_pool_features_shape_mismatch() {
        let raw = vec![1.0; 7];
        let err = pool_features(&raw, 2).unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::FeatureShape { expected: 2, got: 7 }
        ));
    }

    #[test]
    fn test_pool_features_empty() {
        assert!(pool_features(&[], 2).is_err());
    }
}
