//! Identity classifier: frozen feature backbone + trainable head +
//! label encoder, with artifact persistence.
//!
//! The head weights and the fitted label encoder are one
//! atomically-versioned unit: they are written together after every
//! successful train (write-then-rename, so a crashed write can never be
//! picked up by a later load) and only ever loaded as a pair. A failed
//! train leaves both the in-memory model and the on-disk artifacts
//! untouched.

use ndarray::{Array2, Array3};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backbone::FeatureExtractor;
use crate::encoder::LabelEncoder;
use crate::error::ClassifierError;
use crate::head::{SoftmaxHead, TrainOptions, TrainReport};

/// One training sample: a preprocessed face tensor and its identity id.
pub struct FaceSample {
    pub label: String,
    pub tensor: Array3<f32>,
}

/// Locations of the two persisted model artifacts. Co-located on the
/// same filesystem so the rename publish step is atomic.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub head: PathBuf,
    pub encoder: PathBuf,
}

struct TrainedModel {
    head: SoftmaxHead,
    encoder: LabelEncoder,
}

/// Closed-set identity classifier over the enrolled roster.
pub struct FaceClassifier {
    extractor: Box<dyn FeatureExtractor + Send>,
    paths: ArtifactPaths,
    trained: Option<TrainedModel>,
}

impl FaceClassifier {
    pub fn new(extractor: Box<dyn FeatureExtractor + Send>, paths: ArtifactPaths) -> Self {
        Self {
            extractor,
            paths,
            trained: None,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    /// Class count of the currently loaded model, if any.
    pub fn num_classes(&self) -> Option<usize> {
        self.trained.as_ref().map(|m| m.encoder.num_classes())
    }

    /// Identities the current model can produce, if trained.
    pub fn classes(&self) -> Option<&[String]> {
        self.trained.as_ref().map(|m| m.encoder.classes())
    }

    /// Load persisted artifacts if both are present.
    ///
    /// Weights and encoder are only ever used together; if one file is
    /// missing or the pair is inconsistent (head width ≠ encoder class
    /// count) the classifier stays untrained. Returns whether a model
    /// was loaded.
    pub fn load_if_present(&mut self) -> Result<bool, ClassifierError> {
        if !self.paths.head.exists() || !self.paths.encoder.exists() {
            tracing::info!("no persisted classifier found; starting untrained");
            return Ok(false);
        }

        let head: SoftmaxHead = read_artifact(&self.paths.head)?;
        let encoder: LabelEncoder = read_artifact(&self.paths.encoder)?;

        if head.num_classes() != encoder.num_classes() {
            tracing::warn!(
                head_classes = head.num_classes(),
                encoder_classes = encoder.num_classes(),
                "classifier weights and label encoder disagree; refusing to load"
            );
            return Ok(false);
        }

        tracing::info!(
            classes = encoder.num_classes(),
            "loaded persisted classifier"
        );
        self.trained = Some(TrainedModel { head, encoder });
        Ok(true)
    }

    /// Full retrain from scratch over `samples`.
    ///
    /// The label encoder is refit against the exact distinct label set
    /// present, and a new head is built sized to that class count (a
    /// roster change invalidates the previous head entirely). On
    /// success the new pair is persisted and then published in one
    /// assignment; on any failure the previous model remains live.
    pub fn train(
        &mut self,
        samples: &[FaceSample],
        opts: &TrainOptions,
    ) -> Result<TrainReport, ClassifierError> {
        if samples.len() < 2 {
            return Err(ClassifierError::DataInsufficient {
                needed: 2,
                got: samples.len(),
            });
        }

        let labels: Vec<&str> = samples.iter().map(|s| s.label.as_str()).collect();
        let encoder = LabelEncoder::fit(&labels);
        if encoder.num_classes() < 2 {
            return Err(ClassifierError::DataInsufficient {
                needed: 2,
                got: encoder.num_classes(),
            });
        }

        if let Some(current) = &self.trained {
            if current.encoder.num_classes() != encoder.num_classes() {
                tracing::info!(
                    old = current.encoder.num_classes(),
                    new = encoder.num_classes(),
                    "roster size changed; rebuilding classifier head"
                );
            }
        }

        // Extract backbone features for every sample.
        let dim = self.extractor.feature_dim();
        let mut features = Array2::zeros((samples.len(), dim));
        let mut class_indices = Vec::with_capacity(samples.len());
        for (i, sample) in samples.iter().enumerate() {
            let feats = self.extractor.extract(&sample.tensor)?;
            features.row_mut(i).assign(&feats);
            // fit() above guarantees every sample label is encodable.
            let idx = encoder
                .encode(&sample.label)
                .ok_or_else(|| ClassifierError::Artifact("label missing from encoder".into()))?;
            class_indices.push(idx);
        }

        let (head, report) =
            SoftmaxHead::fit(&features, &class_indices, encoder.num_classes(), opts)?;

        tracing::info!(
            classes = report.num_classes,
            samples = report.num_samples,
            epochs = report.epochs_run,
            train_accuracy = report.train_accuracy,
            val_accuracy = report.val_accuracy,
            "classifier trained"
        );

        // Persist first, publish second. Order matters: a persist
        // failure must leave the previously trained model live.
        persist_artifact(&self.paths.head, &head)?;
        persist_artifact(&self.paths.encoder, &encoder)?;
        self.trained = Some(TrainedModel { head, encoder });

        Ok(report)
    }

    /// Top-1 identity and softmax confidence for a preprocessed face.
    pub fn predict(&mut self, face: &Array3<f32>) -> Result<(String, f32), ClassifierError> {
        if self.trained.is_none() {
            return Err(ClassifierError::NotTrained);
        }
        let features = self.extractor.extract(face)?;
        let model = self.trained.as_ref().ok_or(ClassifierError::NotTrained)?;
        let (index, confidence) = model.head.predict(&features);
        let identity = model
            .encoder
            .decode(index)
            .ok_or_else(|| ClassifierError::Artifact("class index outside encoder".into()))?
            .to_owned();
        Ok((identity, confidence))
    }
}

fn read_artifact<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ClassifierError> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes)
        .map_err(|e| ClassifierError::Artifact(format!("{}: {e}", path.display())))
}

/// Atomic write: serialize to a sibling temp file, then rename into
/// place, so readers never observe a half-written artifact.
fn persist_artifact<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ClassifierError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = bincode::serialize(value)
        .map_err(|e| ClassifierError::Artifact(format!("{}: {e}", path.display())))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
