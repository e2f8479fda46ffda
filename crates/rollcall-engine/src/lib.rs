//! rollcall-engine — model lifecycle management for the Rollcall
//! attendance recognizer.
//!
//! Owns the reference-image store, assembles training sets from it,
//! runs retrains on a dedicated engine thread, and exposes an async
//! handle for enrollment, recognition, and evaluation requests.

pub mod capture;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod store;

pub use capture::{fetch_frame, test_connection, CaptureError};
pub use config::Config;
pub use engine::{
    spawn_engine, EngineError, EngineHandle, EngineStatus, EnrollOutcome, EvaluationReport,
    RecognizeOutcome, RemoveOutcome, RetrainOutcome,
};
pub use store::{CameraRecord, ReferenceRecord, Store, StoreError};
