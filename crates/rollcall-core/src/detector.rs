//! SeetaFace funnel-cascade face detector.
//!
//! A fixed, non-learned cascade: no training, just tunable sensitivity.
//! Detection runs on grayscale and uses a two-pass policy: a strict
//! pass tuned for precision first, then one lenient retry tuned for
//! recall when the strict pass finds nothing (poorly lit or angled
//! shots). Whichever pass first finds a face wins.

use image::DynamicImage;
use rustface::{ImageData, Model};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

use crate::types::FaceBox;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to load detector model: {0}")]
    ModelLoad(String),
}

/// Cascade sensitivity parameters for one detection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    /// Smallest face edge considered, in pixels.
    pub min_face_size: u32,
    /// Cascade score cutoff; lower admits weaker candidates.
    pub score_thresh: f64,
    /// Image-pyramid scale step in (0, 1); closer to 1 scans more scales.
    pub pyramid_scale: f32,
    /// Sliding-window stride in pixels; smaller scans more positions.
    pub window_step: u32,
}

impl DetectionParams {
    /// Precision-first parameters for the initial pass.
    pub fn strict() -> Self {
        Self {
            min_face_size: 60,
            score_thresh: 4.0,
            pyramid_scale: 0.8,
            window_step: 4,
        }
    }

    /// Recall-first parameters for the fallback pass.
    pub fn lenient() -> Self {
        Self {
            min_face_size: 20,
            score_thresh: 2.0,
            pyramid_scale: 0.9,
            window_step: 2,
        }
    }
}

/// Face detector over the bundled SeetaFace frontal-face cascade model.
pub struct FaceDetector {
    model: Model,
}

impl FaceDetector {
    /// Load the cascade model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }
        let bytes = std::fs::read(model_path)
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;
        let model = rustface::read_model(Cursor::new(bytes))
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;

        tracing::info!(path = %model_path.display(), "loaded face detector model");
        Ok(Self { model })
    }

    /// Detect faces in `image`, applying the strict-then-lenient policy.
    /// An image with no detectable face yields an empty list, never an
    /// error.
    pub fn detect(&self, image: &DynamicImage) -> Vec<FaceBox> {
        let gray = image::imageops::grayscale(image);
        let (width, height) = (gray.width(), gray.height());
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let faces = two_pass(|params| self.run_pass(gray.as_raw(), width, height, params));
        tracing::debug!(count = faces.len(), width, height, "face detection complete");
        faces
    }

    /// One cascade pass over a grayscale buffer with the given
    /// sensitivity parameters.
    fn run_pass(
        &self,
        gray: &[u8],
        width: u32,
        height: u32,
        params: &DetectionParams,
    ) -> Vec<FaceBox> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(params.min_face_size);
        detector.set_score_thresh(params.score_thresh);
        detector.set_pyramid_scale_factor(params.pyramid_scale);
        detector.set_slide_window_step(params.window_step, params.window_step);

        detector
            .detect(&ImageData::new(gray, width, height))
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceBox {
                    x: bbox.x() as f32,
                    y: bbox.y() as f32,
                    width: bbox.width() as f32,
                    height: bbox.height() as f32,
                    confidence: face.score() as f32,
                }
            })
            .collect()
    }
}

/// Two-pass detection policy: return the strict pass's result when it
/// finds at least one face, otherwise retry once with lenient
/// parameters. Both passes empty ⇒ empty.
fn two_pass<F>(mut run: F) -> Vec<FaceBox>
where
    F: FnMut(&DetectionParams) -> Vec<FaceBox>,
{
    let strict = run(&DetectionParams::strict());
    if !strict.is_empty() {
        return strict;
    }
    tracing::debug!("strict detection pass found no faces, retrying lenient");
    run(&DetectionParams::lenient())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32) -> FaceBox {
        FaceBox {
            x,
            y: 0.0,
            width: 50.0,
            height: 50.0,
            confidence: 5.0,
        }
    }

    #[test]
    fn test_strict_result_wins_when_nonempty() {
        let mut passes = Vec::new();
        let result = two_pass(|params| {
            passes.push(params.clone());
            vec![face(1.0)]
        });
        assert_eq!(result.len(), 1);
        assert_eq!(passes, vec![DetectionParams::strict()]);
    }

    #[test]
    fn test_fallback_to_lenient_on_empty_strict() {
        let mut passes = Vec::new();
        let result = two_pass(|params| {
            passes.push(params.clone());
            if *params == DetectionParams::strict() {
                Vec::new()
            } else {
                vec![face(3.0), face(80.0)]
            }
        });
        // The lenient pass's faces must be returned, never an empty
        // result when the looser pass would have found something.
        assert_eq!(result.len(), 2);
        assert_eq!(
            passes,
            vec![DetectionParams::strict(), DetectionParams::lenient()]
        );
    }

    #[test]
    fn test_both_passes_empty() {
        let result = two_pass(|_| Vec::new());
        assert!(result.is_empty());
    }

    #[test]
    fn test_lenient_is_looser_than_strict() {
        let strict = DetectionParams::strict();
        let lenient = DetectionParams::lenient();
        assert!(lenient.min_face_size < strict.min_face_size);
        assert!(lenient.score_thresh < strict.score_thresh);
        assert!(lenient.pyramid_scale > strict.pyramid_scale);
        assert!(lenient.window_step < strict.window_step);
    }
}
