//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts face embeddings from aligned 112×112 RGB crops using the
//! w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{l2_norm, Embedding, FaceRegion, Image};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0; ArcFace uses symmetric normalization
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}: download w600k_r50.onnx from insightface and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    UnexpectedDimension { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
    embedding_dim: usize,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model; every extracted embedding must have `embedding_dim` values.
    pub fn load(model_path: &str, embedding_dim: usize) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            embedding_dim,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            embedding_dim,
        })
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Extract an L2-normalized embedding for one detected face.
    ///
    /// Deterministic for a fixed model and fixed input pixels.
    pub fn extract(&mut self, image: &Image, face: &FaceRegion) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(image, face);
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != self.embedding_dim {
            return Err(RecognizerError::UnexpectedDimension {
                expected: self.embedding_dim,
                actual: raw.len(),
            });
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(RecognizerError::InferenceFailed("non-finite embedding value".to_string()));
        }

        Ok(Embedding {
            values: normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }

    /// Aligned RGB crop to a normalized 1x3x112x112 tensor. Missing bytes read as black.
    fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, ALIGNED_SIZE, ALIGNED_SIZE), |(_, c, y, x)| {
            let pixel = aligned_face.get((y * ALIGNED_SIZE + x) * 3 + c).copied().unwrap_or(0);
            (f32::from(pixel) - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

/// L2-normalize; a zero vector is returned unchanged.
fn normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm = l2_norm(&raw);
    if norm > 0.0 {
        raw.into_iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
