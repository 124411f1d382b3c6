//! facecheck-core: face-match decision engine building blocks.
//!
//! Decodes caller images, finds the primary face with SCRFD, extracts an
//! ArcFace embedding (both via ONNX Runtime, or through an external model
//! command), and scores two embeddings against a match threshold.

pub mod alignment;
pub mod backend;
pub mod config;
pub mod detector;
pub mod external;
pub mod loader;
pub mod policy;
pub mod recognizer;
pub mod scorer;
pub mod types;

pub use backend::{FaceBackend, OnnxBackend, PipelineError, UnavailableBackend};
pub use config::{ComparisonConfig, ConfigError, DistanceMetric, FallbackPolicy};
pub use detector::FaceDetector;
pub use external::ExternalBackend;
pub use loader::InputError;
pub use recognizer::FaceRecognizer;
pub use types::{ComparisonResult, Embedding, FaceRegion, Image, ImageInput, Origin};

use std::path::PathBuf;

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/facecheck/models`, falling back to `~/.local/share/facecheck/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecheck")
        .join("models")
}
