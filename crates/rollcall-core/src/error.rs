use thiserror::Error;

/// Errors produced by the identity classifier and its persistence layer.
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("not enough training data: need at least {needed}, got {got}")]
    DataInsufficient { needed: usize, got: usize },
    #[error("model not trained yet: enroll reference images and train first")]
    NotTrained,
    #[error("feature backbone model not found: {0}")]
    BackboneNotFound(String),
    #[error("backbone produced {got} features, expected a multiple of {expected}")]
    FeatureShape { expected: usize, got: usize },
    #[error("model artifact error: {0}")]
    Artifact(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}
