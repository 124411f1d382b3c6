//! Distance and confidence between two embeddings.

use crate::config::DistanceMetric;
use crate::types::Embedding;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScoreError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    /// Non-negative distance under the chosen metric.
    pub distance: f32,
    /// `clamp(1 - distance / scale, 0, 1)`.
    pub confidence: f32,
}

/// Score two embeddings. Pure and symmetric in its arguments.
pub fn score(a: &Embedding, b: &Embedding, metric: DistanceMetric) -> Result<Score, ScoreError> {
    if a.dim() != b.dim() {
        return Err(ScoreError::DimensionMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }

    let raw = match metric {
        DistanceMetric::Cosine => 1.0 - a.similarity(b),
        DistanceMetric::EuclideanL2 => a.normalized_euclidean_distance(b),
    };
    // Rounding can push an exact self-match a hair below zero.
    let distance = if raw.is_finite() { raw.max(0.0) } else { metric.scale() };

    Ok(Score {
        distance,
        confidence: confidence_for(distance, metric),
    })
}

/// Map a distance monotonically and inversely into [0, 1].
pub fn confidence_for(distance: f32, metric: DistanceMetric) -> f32 {
    (1.0 - distance / metric.scale()).clamp(0.0, 1.0)
}
