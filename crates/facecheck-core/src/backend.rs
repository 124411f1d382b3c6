//! Model backends: the seam between the comparison pipeline and whatever
//! actually runs face detection and embedding extraction.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::scorer::ScoreError;
use crate::types::{Embedding, FaceRegion, Image};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

/// Failures of the model pipeline. These never reach the comparison caller
/// as errors; they turn the result into a degraded one.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face detection failed: {0}")]
    DetectionFailed(String),
    #[error("embedding extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("model runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("model worker crashed: {0}")]
    WorkerCrashed(String),
    #[error("malformed model output: {0}")]
    MalformedOutput(String),
}

impl From<DetectorError> for PipelineError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::NoFaceDetected => PipelineError::NoFaceDetected,
            DetectorError::ModelNotFound(path) => PipelineError::RuntimeUnavailable(path),
            other => PipelineError::DetectionFailed(other.to_string()),
        }
    }
}

impl From<RecognizerError> for PipelineError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => PipelineError::RuntimeUnavailable(path),
            other => PipelineError::ExtractionFailed(other.to_string()),
        }
    }
}

impl From<ScoreError> for PipelineError {
    fn from(e: ScoreError) -> Self {
        match e {
            ScoreError::DimensionMismatch { left, right } => {
                PipelineError::DimensionMismatch { left, right }
            }
        }
    }
}

/// Runs face detection and embedding extraction for one image at a time.
///
/// Implementations are shared across concurrent comparisons and may block;
/// callers run them on blocking worker threads.
///
/// `deadline` is when the calling comparison gives up. Backends that can
/// cancel their own work stop by then; in-process ones may ignore it.
pub trait FaceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// All candidate faces above the backend's internal confidence floor.
    fn detect(&self, image: &Image, deadline: Instant) -> Result<Vec<FaceRegion>, PipelineError>;

    fn extract(
        &self,
        image: &Image,
        face: &FaceRegion,
        deadline: Instant,
    ) -> Result<Embedding, PipelineError>;

    /// Whether the backend reads images from disk, so in-memory payloads
    /// must be staged as files first.
    fn requires_staged_file(&self) -> bool {
        false
    }
}

/// In-process SCRFD + ArcFace pipeline.
pub struct OnnxBackend {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxBackend {
    pub fn load(
        detector_path: &Path,
        recognizer_path: &Path,
        embedding_dim: usize,
    ) -> Result<Self, PipelineError> {
        let detector = FaceDetector::load(&detector_path.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&recognizer_path.to_string_lossy(), embedding_dim)?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    fn detect(&self, image: &Image, _deadline: Instant) -> Result<Vec<FaceRegion>, PipelineError> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| PipelineError::WorkerCrashed("detector lock poisoned".to_string()))?;
        Ok(detector.detect(image)?)
    }

    fn extract(
        &self,
        image: &Image,
        face: &FaceRegion,
        _deadline: Instant,
    ) -> Result<Embedding, PipelineError> {
        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| PipelineError::WorkerCrashed("recognizer lock poisoned".to_string()))?;
        Ok(recognizer.extract(image, face)?)
    }
}

/// Stand-in used when no model runtime could be set up. Every call fails, so
/// comparisons degrade instead of blocking or crashing.
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl FaceBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn detect(&self, _image: &Image, _deadline: Instant) -> Result<Vec<FaceRegion>, PipelineError> {
        Err(PipelineError::RuntimeUnavailable(self.reason.clone()))
    }

    fn extract(
        &self,
        _image: &Image,
        _face: &FaceRegion,
        _deadline: Instant,
    ) -> Result<Embedding, PipelineError> {
        Err(PipelineError::RuntimeUnavailable(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Origin;

    #[test]
    fn test_unavailable_backend_always_fails() {
        let backend = UnavailableBackend::new("models missing");
        let image = Image::from_rgb8(vec![0; 3], 1, 1, Origin::Bytes).unwrap();
        assert!(matches!(
            backend.detect(&image, Instant::now()),
            Err(PipelineError::RuntimeUnavailable(_))
        ));
        assert!(!backend.requires_staged_file());
    }

    #[test]
    fn test_onnx_backend_missing_models_is_unavailable() {
        let result = OnnxBackend::load(
            Path::new("/nonexistent/det_10g.onnx"),
            Path::new("/nonexistent/w600k_r50.onnx"),
            512,
        );
        assert!(matches!(result, Err(PipelineError::RuntimeUnavailable(_))));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            PipelineError::from(DetectorError::NoFaceDetected),
            PipelineError::NoFaceDetected
        ));
        assert!(matches!(
            PipelineError::from(RecognizerError::UnexpectedDimension { expected: 512, actual: 128 }),
            PipelineError::ExtractionFailed(_)
        ));
        assert!(matches!(
            PipelineError::from(ScoreError::DimensionMismatch { left: 128, right: 256 }),
            PipelineError::DimensionMismatch { left: 128, right: 256 }
        ));
    }
}
