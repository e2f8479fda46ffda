//! rollcall-core — Face recognition engine for attendance tracking.
//!
//! Detects faces with the SeetaFace funnel cascade, extracts features
//! with a frozen pretrained ONNX backbone, and classifies identities
//! with a small trainable softmax head over the enrolled roster.

pub mod backbone;
pub mod classifier;
pub mod detector;
pub mod encoder;
pub mod error;
pub mod head;
pub mod policy;
pub mod preprocess;
pub mod types;

pub use backbone::{FeatureExtractor, OnnxBackbone};
pub use classifier::{ArtifactPaths, FaceClassifier, FaceSample};
pub use detector::{DetectionParams, FaceDetector};
pub use encoder::LabelEncoder;
pub use error::ClassifierError;
pub use head::{SoftmaxHead, TrainOptions, TrainReport};
pub use types::{CandidateSet, FaceBox, Prediction, RecognizedFace};
