use std::path::PathBuf;

use rollcall_core::policy;

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory (store, media, model artifacts).
    pub data_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory holding reference images, one subdirectory per identity.
    pub media_dir: PathBuf,
    /// Directory containing the detector and backbone model files and
    /// the trained classifier artifacts.
    pub model_dir: PathBuf,
    /// Confidence threshold (exclusive) for an attendance match.
    pub confidence_threshold: f32,
    /// Confidence threshold (exclusive) for the enrollment duplicate guard.
    pub duplicate_threshold: f32,
    /// Timeout in seconds for a networked camera capture.
    pub capture_timeout_secs: u64,
    /// Maximum training epochs per retrain.
    pub max_epochs: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with
    /// defaults under `$XDG_DATA_HOME/rollcall`.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("rollcall")
            });

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));
        let media_dir = std::env::var("ROLLCALL_MEDIA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("references"));
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        Self {
            data_dir,
            db_path,
            media_dir,
            model_dir,
            confidence_threshold: env_f32(
                "ROLLCALL_CONFIDENCE_THRESHOLD",
                policy::CONFIDENCE_THRESHOLD,
            ),
            duplicate_threshold: env_f32(
                "ROLLCALL_DUPLICATE_THRESHOLD",
                policy::DUPLICATE_THRESHOLD,
            ),
            capture_timeout_secs: env_u64("ROLLCALL_CAPTURE_TIMEOUT_SECS", 5),
            max_epochs: env_usize("ROLLCALL_MAX_EPOCHS", 20),
        }
    }

    /// Path to the SeetaFace cascade model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("seeta_fd_frontal_v1.0.bin")
    }

    /// Path to the frozen ONNX feature backbone.
    pub fn backbone_model_path(&self) -> PathBuf {
        self.model_dir.join("mobilenet_v2_features.onnx")
    }

    /// Path to the trained classifier head artifact.
    pub fn head_path(&self) -> PathBuf {
        self.model_dir.join("classifier_head.bin")
    }

    /// Path to the fitted label encoder artifact.
    pub fn encoder_path(&self) -> PathBuf {
        self.model_dir.join("label_encoder.bin")
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
