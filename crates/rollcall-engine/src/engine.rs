//! The recognition engine: a dedicated OS thread that owns the face
//! detector, the classifier, and the reference store, serving requests
//! over a channel.
//!
//! The single-thread ownership is the concurrency discipline: at most
//! one train/persist/load sequence runs at a time, and a prediction can
//! never observe a half-swapped model, since a new head/encoder pair is
//! built completely off to the side and published in one assignment.
//! Enrollment replies before its follow-up retrain runs, so
//! registration never waits on (or fails because of) model training.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use rollcall_core::detector::DetectorError;
use rollcall_core::{
    policy, preprocess, ArtifactPaths, CandidateSet, ClassifierError, FaceClassifier,
    FaceDetector, FaceSample, OnnxBackbone, Prediction, RecognizedFace, TrainOptions,
    TrainReport,
};

use crate::config::Config;
use crate::dataset;
use crate::store::{CameraRecord, ReferenceRecord, Store, StoreError};

const MIN_EVALUATION_IMAGES: usize = 5;
const LOW_ACCURACY_CUTOFF: f32 = 0.7;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of a retrain attempt. The "not enough data yet" cases are
/// reported as statuses, never as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetrainOutcome {
    Retrained(TrainReport),
    /// A retrain was warranted but failed; the previous model stays live.
    Unchanged,
    InsufficientImages,
    InsufficientUsers,
}

impl RetrainOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrainOutcome::Retrained(_) => "retrained",
            RetrainOutcome::Unchanged => "unchanged",
            RetrainOutcome::InsufficientImages => "insufficient_images",
            RetrainOutcome::InsufficientUsers => "insufficient_users",
        }
    }
}

/// Result of registering a reference image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EnrollOutcome {
    Registered {
        image_id: i64,
        /// Stored path relative to the media directory.
        path: String,
        is_primary: bool,
    },
    /// The image was recognized as an already-enrolled different
    /// identity; rejected for human review instead of contaminating
    /// that identity's training set.
    DuplicateSuspected {
        conflicting_identity: String,
        confidence: f32,
    },
}

/// Result of deleting a reference image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveOutcome {
    pub identity: String,
    pub remaining_for_identity: usize,
    /// Whether the identity still has reference images at all.
    pub recognizable: bool,
    pub model_status: RetrainOutcome,
}

/// Result of one recognition call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizeOutcome {
    pub faces_detected: usize,
    /// Accepted matches only, in detection order.
    pub matches: Vec<RecognizedFace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityAccuracy {
    pub identity: String,
    pub evaluated: usize,
    pub correct: usize,
    pub accuracy: f32,
}

/// Model evaluation over a stratified holdout of stored references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub accuracy: f32,
    pub evaluated: usize,
    pub mean_confidence: f32,
    pub per_identity: Vec<IdentityAccuracy>,
    /// Identities below the accuracy cutoff that need more or better
    /// reference images.
    pub low_performers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub trained: bool,
    pub num_classes: Option<usize>,
    pub identities_enrolled: usize,
    pub reference_images: usize,
    pub head_path: String,
    pub encoder_path: String,
}

enum EngineRequest {
    Retrain {
        reply: oneshot::Sender<Result<RetrainOutcome, EngineError>>,
    },
    Register {
        identity: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    Remove {
        image_id: i64,
        reply: oneshot::Sender<Result<RemoveOutcome, EngineError>>,
    },
    Recognize {
        image: Vec<u8>,
        candidates: CandidateSet,
        reply: oneshot::Sender<Result<RecognizeOutcome, EngineError>>,
    },
    Evaluate {
        test_split: f32,
        reply: oneshot::Sender<Result<EvaluationReport, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
    ListReferences {
        identity: Option<String>,
        reply: oneshot::Sender<Result<Vec<ReferenceRecord>, EngineError>>,
    },
    CameraSeen {
        name: String,
        ip_address: String,
        reply: oneshot::Sender<Result<CameraRecord, EngineError>>,
    },
    Cameras {
        reply: oneshot::Sender<Result<Vec<CameraRecord>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

macro_rules! request {
    ($self:ident, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply_tx, reply_rx) = oneshot::channel();
        $self
            .tx
            .send(EngineRequest::$variant { $($field: $value,)* reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }};
}

impl EngineHandle {
    /// Synchronous full retrain over every usable reference image.
    pub async fn retrain_all(&self) -> Result<RetrainOutcome, EngineError> {
        request!(self, Retrain {})
    }

    /// Register a reference image for an identity. Replies as soon as
    /// the image is stored; the follow-up retrain runs afterwards,
    /// best-effort.
    pub async fn register_face(
        &self,
        identity: String,
        image: Vec<u8>,
    ) -> Result<EnrollOutcome, EngineError> {
        request!(self, Register { identity: identity, image: image })
    }

    /// Delete a reference image and retrain if the remaining roster
    /// still supports a meaningful model.
    pub async fn remove_face(&self, image_id: i64) -> Result<RemoveOutcome, EngineError> {
        request!(self, Remove { image_id: image_id })
    }

    /// Recognize faces in an image, restricted to `candidates`.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
        candidates: CandidateSet,
    ) -> Result<RecognizeOutcome, EngineError> {
        request!(self, Recognize { image: image, candidates: candidates })
    }

    /// Evaluate the trained model on a stratified holdout.
    pub async fn evaluate(&self, test_split: f32) -> Result<EvaluationReport, EngineError> {
        request!(self, Evaluate { test_split: test_split })
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        request!(self, Status {})
    }

    pub async fn list_references(
        &self,
        identity: Option<String>,
    ) -> Result<Vec<ReferenceRecord>, EngineError> {
        request!(self, ListReferences { identity: identity })
    }

    /// Record a successful camera probe in the registry.
    pub async fn camera_seen(
        &self,
        name: String,
        ip_address: String,
    ) -> Result<CameraRecord, EngineError> {
        request!(self, CameraSeen { name: name, ip_address: ip_address })
    }

    pub async fn cameras(&self) -> Result<Vec<CameraRecord>, EngineError> {
        request!(self, Cameras {})
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the store and loads the detector, backbone, and any persisted
/// classifier artifacts synchronously, failing fast if a resource is
/// unavailable, then enters the request loop.
pub fn spawn_engine(config: Config) -> Result<EngineHandle, EngineError> {
    std::fs::create_dir_all(&config.media_dir)?;
    std::fs::create_dir_all(&config.model_dir)?;

    let store = Store::open(&config.db_path)?;
    tracing::info!(db = %config.db_path.display(), "reference store opened");

    let detector = FaceDetector::load(&config.detector_model_path())?;
    let backbone = OnnxBackbone::load(&config.backbone_model_path())?;

    let mut classifier = FaceClassifier::new(
        Box::new(backbone),
        ArtifactPaths {
            head: config.head_path(),
            encoder: config.encoder_path(),
        },
    );
    classifier.load_if_present()?;

    let mut worker = Worker {
        config,
        store,
        detector,
        classifier,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                worker.handle(req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

/// Engine state, owned exclusively by the engine thread.
struct Worker {
    config: Config,
    store: Store,
    detector: FaceDetector,
    classifier: FaceClassifier,
}

impl Worker {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Retrain { reply } => {
                let _ = reply.send(self.run_retrain());
            }
            EngineRequest::Register {
                identity,
                image,
                reply,
            } => {
                let result = self.run_register(&identity, &image);
                let registered = matches!(&result, Ok(EnrollOutcome::Registered { .. }));
                let _ = reply.send(result);
                // The enrollment has already succeeded; its retrain is
                // best-effort and must only warn on failure.
                if registered {
                    let outcome = self.best_effort_retrain();
                    tracing::info!(
                        identity = %identity,
                        status = outcome.as_str(),
                        "post-enrollment retrain"
                    );
                }
            }
            EngineRequest::Remove { image_id, reply } => {
                let _ = reply.send(self.run_remove(image_id));
            }
            EngineRequest::Recognize {
                image,
                candidates,
                reply,
            } => {
                let _ = reply.send(self.run_recognize(&image, &candidates));
            }
            EngineRequest::Evaluate { test_split, reply } => {
                let _ = reply.send(self.run_evaluate(test_split));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.run_status());
            }
            EngineRequest::ListReferences { identity, reply } => {
                let result = match identity {
                    Some(id) => self.store.references_for(&id),
                    None => self.store.references_all(),
                };
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::CameraSeen {
                name,
                ip_address,
                reply,
            } => {
                let result = self
                    .store
                    .upsert_camera(&name, &ip_address)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Cameras { reply } => {
                let _ = reply.send(self.store.cameras().map_err(EngineError::from));
            }
        }
    }

    /// Full retrain over the assembled training set, honoring the
    /// degenerate-roster statuses.
    fn run_retrain(&mut self) -> Result<RetrainOutcome, EngineError> {
        let detector = &self.detector;
        let (samples, _stats) =
            dataset::assemble(&self.store, &self.config.media_dir, |img| {
                detector.detect(img)
            })?;

        let identities = distinct_labels(&samples);
        match retrain_precheck(samples.len(), identities) {
            Precheck::InsufficientImages => {
                tracing::info!(
                    images = samples.len(),
                    "not enough images to train; model unchanged"
                );
                return Ok(RetrainOutcome::InsufficientImages);
            }
            Precheck::InsufficientUsers => {
                tracing::info!(
                    identities,
                    "not enough identities with images to train; model unchanged"
                );
                return Ok(RetrainOutcome::InsufficientUsers);
            }
            Precheck::Proceed => {}
        }

        let opts = TrainOptions {
            max_epochs: self.config.max_epochs,
            ..TrainOptions::default()
        };
        let report = self.classifier.train(&samples, &opts)?;
        Ok(RetrainOutcome::Retrained(report))
    }

    /// Retrain where failure must not fail the surrounding operation.
    fn best_effort_retrain(&mut self) -> RetrainOutcome {
        match self.run_retrain() {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "retrain failed; keeping previous model");
                RetrainOutcome::Unchanged
            }
        }
    }

    fn run_register(
        &mut self,
        identity: &str,
        image_bytes: &[u8],
    ) -> Result<EnrollOutcome, EngineError> {
        let image = image::load_from_memory(image_bytes)?;

        let faces = self.detector.detect(&image);
        if faces.is_empty() {
            return Err(EngineError::NoFaceDetected);
        }

        // Duplicate guard: a trained model recognizing this image as a
        // different identity means the person is likely already
        // enrolled under another id.
        if self.classifier.is_trained() {
            let predictions = self.predict_faces(&image, &faces)?;
            if let Some(conflict) = policy::duplicate_conflict(
                &predictions,
                identity,
                self.config.duplicate_threshold,
            ) {
                tracing::warn!(
                    enrolling = %identity,
                    conflicting = %conflict.identity,
                    confidence = conflict.confidence,
                    "enrollment rejected: likely duplicate registration"
                );
                return Ok(EnrollOutcome::DuplicateSuspected {
                    conflicting_identity: conflict.identity.clone(),
                    confidence: conflict.confidence,
                });
            }
        }

        let rel_path = format!("{identity}/face_{}.jpg", uuid::Uuid::new_v4());
        let full_path = self.config.media_dir.join(&rel_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full_path, image_bytes)?;

        let record = match self.store.insert_reference(identity, &rel_path) {
            Ok(record) => record,
            Err(e) => {
                // Don't leave an orphaned file behind a failed insert.
                let _ = std::fs::remove_file(&full_path);
                return Err(e.into());
            }
        };

        tracing::info!(
            identity = %identity,
            image_id = record.id,
            primary = record.is_primary,
            "reference image registered"
        );
        Ok(EnrollOutcome::Registered {
            image_id: record.id,
            path: record.path,
            is_primary: record.is_primary,
        })
    }

    fn run_remove(&mut self, image_id: i64) -> Result<RemoveOutcome, EngineError> {
        let record = self.store.delete_reference(image_id)?;

        let full_path = self.config.media_dir.join(&record.path);
        if full_path.exists() {
            if let Err(e) = std::fs::remove_file(&full_path) {
                tracing::warn!(path = %full_path.display(), error = %e, "could not delete image file");
            }
        }

        let remaining_for_identity = self.store.count_references_for(&record.identity)?;

        // Decide on the counts of references whose files still exist.
        let (existing_images, existing_identities) = self.existing_counts()?;
        let model_status = match retrain_precheck(existing_images, existing_identities) {
            Precheck::Proceed => self.best_effort_retrain(),
            Precheck::InsufficientImages => RetrainOutcome::InsufficientImages,
            Precheck::InsufficientUsers => RetrainOutcome::InsufficientUsers,
        };

        if !matches!(model_status, RetrainOutcome::Retrained(_)) && self.classifier.is_trained() {
            // Known grace window: the live model still predicts with
            // its stale class set until the next successful retrain.
            tracing::warn!(
                status = model_status.as_str(),
                "model not retrained after deletion; stale classes remain predictable"
            );
        }

        tracing::info!(
            identity = %record.identity,
            image_id,
            remaining = remaining_for_identity,
            status = model_status.as_str(),
            "reference image deleted"
        );

        Ok(RemoveOutcome {
            recognizable: remaining_for_identity > 0,
            identity: record.identity,
            remaining_for_identity,
            model_status,
        })
    }

    fn run_recognize(
        &mut self,
        image_bytes: &[u8],
        candidates: &CandidateSet,
    ) -> Result<RecognizeOutcome, EngineError> {
        let image = image::load_from_memory(image_bytes)?;
        let faces = self.detector.detect(&image);
        if faces.is_empty() {
            return Ok(RecognizeOutcome {
                faces_detected: 0,
                matches: Vec::new(),
            });
        }

        let predictions = self.predict_faces(&image, &faces)?;
        let matches = policy::accept_matches(
            &predictions,
            candidates,
            self.config.confidence_threshold,
        );

        tracing::info!(
            faces = faces.len(),
            accepted = matches.len(),
            candidates = candidates.len(),
            "recognition complete"
        );
        Ok(RecognizeOutcome {
            faces_detected: faces.len(),
            matches,
        })
    }

    fn run_evaluate(&mut self, test_split: f32) -> Result<EvaluationReport, EngineError> {
        if !self.classifier.is_trained() {
            return Err(EngineError::Classifier(ClassifierError::NotTrained));
        }

        let detector = &self.detector;
        let (samples, _stats) =
            dataset::assemble(&self.store, &self.config.media_dir, |img| {
                detector.detect(img)
            })?;
        if samples.len() < MIN_EVALUATION_IMAGES {
            return Err(EngineError::Classifier(ClassifierError::DataInsufficient {
                needed: MIN_EVALUATION_IMAGES,
                got: samples.len(),
            }));
        }

        let labels: Vec<&str> = samples.iter().map(|s| s.label.as_str()).collect();
        let mut rng = rand::rngs::StdRng::from_entropy();
        let test_idx = stratified_holdout(&labels, test_split, &mut rng);

        let mut per_identity: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        let mut correct = 0usize;
        let mut confidence_sum = 0.0f32;

        for &i in &test_idx {
            let sample = &samples[i];
            let (predicted, confidence) = self.classifier.predict(&sample.tensor)?;
            let entry = per_identity.entry(sample.label.clone()).or_insert((0, 0));
            entry.0 += 1;
            if predicted == sample.label {
                entry.1 += 1;
                correct += 1;
            }
            confidence_sum += confidence;
        }

        let evaluated = test_idx.len();
        let per_identity: Vec<IdentityAccuracy> = per_identity
            .into_iter()
            .map(|(identity, (total, hits))| IdentityAccuracy {
                identity,
                evaluated: total,
                correct: hits,
                accuracy: hits as f32 / total as f32,
            })
            .collect();
        let low_performers = per_identity
            .iter()
            .filter(|ia| ia.accuracy < LOW_ACCURACY_CUTOFF)
            .map(|ia| ia.identity.clone())
            .collect();

        Ok(EvaluationReport {
            accuracy: correct as f32 / evaluated.max(1) as f32,
            evaluated,
            mean_confidence: confidence_sum / evaluated.max(1) as f32,
            per_identity,
            low_performers,
        })
    }

    fn run_status(&mut self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            trained: self.classifier.is_trained(),
            num_classes: self.classifier.num_classes(),
            identities_enrolled: self.store.identities_with_references()?.len(),
            reference_images: self.store.count_references()?,
            head_path: self.config.head_path().display().to_string(),
            encoder_path: self.config.encoder_path().display().to_string(),
        })
    }

    /// Preprocess and classify every detected face in an image.
    fn predict_faces(
        &mut self,
        image: &image::DynamicImage,
        faces: &[rollcall_core::FaceBox],
    ) -> Result<Vec<Prediction>, EngineError> {
        let mut predictions = Vec::with_capacity(faces.len());
        for face in faces {
            let tensor = preprocess::extract_face(image, face);
            let (identity, confidence) = self.classifier.predict(&tensor)?;
            predictions.push(Prediction {
                identity,
                confidence,
                face: face.clone(),
            });
        }
        Ok(predictions)
    }

    /// Counts of reference images whose files still exist, and of
    /// identities owning at least one such image.
    fn existing_counts(&self) -> Result<(usize, usize), EngineError> {
        let mut images = 0usize;
        let mut identities: std::collections::BTreeSet<String> = Default::default();
        for record in self.store.references_all()? {
            if self.config.media_dir.join(&record.path).exists() {
                images += 1;
                identities.insert(record.identity);
            }
        }
        Ok((images, identities.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precheck {
    Proceed,
    InsufficientImages,
    InsufficientUsers,
}

/// Whether a roster supports retraining: at least 2 usable images in
/// total, spread over at least 2 identities. A single-identity model
/// would be degenerate (softmax over one class).
fn retrain_precheck(total_images: usize, identities_with_images: usize) -> Precheck {
    if total_images < 2 {
        Precheck::InsufficientImages
    } else if identities_with_images < 2 {
        Precheck::InsufficientUsers
    } else {
        Precheck::Proceed
    }
}

fn distinct_labels(samples: &[FaceSample]) -> usize {
    samples
        .iter()
        .map(|s| s.label.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len()
}

/// Pick evaluation holdout indices: each identity contributes
/// `max(1, floor(count * test_split))` of its samples.
fn stratified_holdout(
    labels: &[&str],
    test_split: f32,
    rng: &mut rand::rngs::StdRng,
) -> Vec<usize> {
    let mut by_label: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_label.entry(label).or_default().push(i);
    }

    let mut test = Vec::new();
    for indices in by_label.into_values() {
        let mut indices = indices;
        indices.shuffle(rng);
        let n_test = ((indices.len() as f32 * test_split).floor() as usize).max(1);
        test.extend_from_slice(&indices[..n_test.min(indices.len())]);
    }
    test
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_precheck_proceed() {
        assert_eq!(retrain_precheck(2, 2), Precheck::Proceed);
        assert_eq!(retrain_precheck(15, 3), Precheck::Proceed);
    }

    #[test]
    fn test_precheck_insufficient_images() {
        assert_eq!(retrain_precheck(0, 0), Precheck::InsufficientImages);
        assert_eq!(retrain_precheck(1, 1), Precheck::InsufficientImages);
    }

    #[test]
    fn test_precheck_insufficient_users() {
        // Plenty of images, all belonging to one identity.
        assert_eq!(retrain_precheck(6, 1), Precheck::InsufficientUsers);
    }

    #[test]
    fn test_outcome_status_strings() {
        assert_eq!(RetrainOutcome::Unchanged.as_str(), "unchanged");
        assert_eq!(
            RetrainOutcome::InsufficientImages.as_str(),
            "insufficient_images"
        );
        assert_eq!(
            RetrainOutcome::InsufficientUsers.as_str(),
            "insufficient_users"
        );
    }

    #[test]
    fn test_holdout_every_identity_represented() {
        let labels = vec!["a", "a", "a", "a", "a", "b", "b", "b", "b", "b", "c"];
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let test = stratified_holdout(&labels, 0.2, &mut rng);

        // floor(5 * 0.2) = 1 from each 5-member identity, and the
        // singleton contributes its one sample via the max(1) floor.
        assert_eq!(test.len(), 3);
        let mut held: Vec<&str> = test.iter().map(|&i| labels[i]).collect();
        held.sort_unstable();
        assert_eq!(held, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_holdout_never_exceeds_population() {
        let labels = vec!["a", "b"];
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let test = stratified_holdout(&labels, 0.9, &mut rng);
        assert_eq!(test.len(), 2);
    }
}
