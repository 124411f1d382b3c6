//! Per-comparison configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.75;
pub const DEFAULT_TIMEOUT_MS: u64 = 8000;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_ALLOWED_FORMATS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];
pub const DEFAULT_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("match_threshold must be in (0, 1), got {0}")]
    Threshold(f32),
    #[error("timeout_ms must be greater than zero")]
    Timeout,
    #[error("max_image_bytes must be greater than zero")]
    MaxImageBytes,
    #[error("allowed_formats must not be empty")]
    NoFormats,
    #[error("embedding_dim must be greater than zero")]
    EmbeddingDim,
    #[error("randomized fallback range must satisfy 0 <= min <= max <= 1, got [{min}, {max}]")]
    FallbackRange { min: f32, max: f32 },
}

/// How embedding distance is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2].
    #[default]
    Cosine,
    /// Euclidean distance between L2-normalized embeddings, in [0, 2].
    EuclideanL2,
}

impl DistanceMetric {
    /// Calibration constant: the distance at which confidence reaches zero.
    pub fn scale(self) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0,
            DistanceMetric::EuclideanL2 => 2.0,
        }
    }
}

/// What a comparison reports when the model pipeline cannot produce a decision.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// `match = false`, `confidence = 0`.
    #[default]
    FailClosed,
    /// Confidence drawn uniformly from `[min, max]`, matched against the threshold.
    Randomized { min: f32, max: f32 },
}

impl FallbackPolicy {
    /// Range used by deployments that relied on randomized fallback scores.
    pub const LEGACY_RANDOMIZED: FallbackPolicy = FallbackPolicy::Randomized { min: 0.7, max: 1.0 };
}

/// Comparison settings, supplied per deployment or per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Confidence strictly above this value is a match.
    pub match_threshold: f32,
    /// Wall-clock budget for one comparison, loading through decision.
    pub timeout_ms: u64,
    /// Accepted encoded formats, by extension name. `jpg` and `jpeg` are equivalent.
    pub allowed_formats: Vec<String>,
    pub max_image_bytes: usize,
    pub metric: DistanceMetric,
    /// Length every extracted embedding must have.
    pub embedding_dim: usize,
    pub fallback: FallbackPolicy,
    /// Directory for staged payload files. Defaults to the system temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            allowed_formats: DEFAULT_ALLOWED_FORMATS.iter().map(|s| s.to_string()).collect(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            metric: DistanceMetric::default(),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            fallback: FallbackPolicy::default(),
            temp_dir: None,
        }
    }
}

impl ComparisonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Written so NaN fails too.
        if !(self.match_threshold > 0.0 && self.match_threshold < 1.0) {
            return Err(ConfigError::Threshold(self.match_threshold));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Timeout);
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::MaxImageBytes);
        }
        if self.allowed_formats.iter().all(|f| f.trim().is_empty()) {
            return Err(ConfigError::NoFormats);
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::EmbeddingDim);
        }
        if let FallbackPolicy::Randomized { min, max } = self.fallback {
            if !(0.0 <= min && min <= max && max <= 1.0) {
                return Err(ConfigError::FallbackRange { min, max });
            }
        }
        Ok(())
    }

    /// Whether `name` (an extension or MIME subtype) is an accepted format.
    pub fn allows_format(&self, name: &str) -> bool {
        let name = normalize_format_name(name);
        self.allowed_formats
            .iter()
            .any(|allowed| normalize_format_name(allowed) == name)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Lowercase, trimmed, with `jpg` folded into `jpeg`.
pub fn normalize_format_name(name: &str) -> String {
    let name = name.trim().trim_start_matches('.').to_ascii_lowercase();
    if name == "jpg" {
        "jpeg".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ComparisonConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.match_threshold, 0.75);
        assert_eq!(config.timeout_ms, 8000);
        assert_eq!(config.max_image_bytes, 10_485_760);
        assert_eq!(config.fallback, FallbackPolicy::FailClosed);
    }

    #[test]
    fn test_threshold_bounds() {
        for bad in [0.0, 1.0, -0.1, 1.5, f32::NAN] {
            let config = ComparisonConfig {
                match_threshold: bad,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::Threshold(_))), "{bad}");
        }
    }

    #[test]
    fn test_fallback_range_checked() {
        let config = ComparisonConfig {
            fallback: FallbackPolicy::Randomized { min: 0.9, max: 0.7 },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::FallbackRange { .. })));
        let config = ComparisonConfig {
            fallback: FallbackPolicy::LEGACY_RANDOMIZED,
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_format_aliases() {
        let config = ComparisonConfig::default();
        assert!(config.allows_format("JPG"));
        assert!(config.allows_format("jpeg"));
        assert!(config.allows_format(".png"));
        assert!(!config.allows_format("webp"));

        let only_jpg = ComparisonConfig {
            allowed_formats: vec!["jpg".into()],
            ..Default::default()
        };
        assert!(only_jpg.allows_format("jpeg"));
        assert!(!only_jpg.allows_format("gif"));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: ComparisonConfig = serde_json::from_str(
            r#"{"match_threshold": 0.6, "fallback": {"mode": "randomized", "min": 0.7, "max": 1.0}}"#,
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.fallback, FallbackPolicy::LEGACY_RANDOMIZED);
    }
}
