use facecheck_core::{ComparisonConfig, ConfigError, FallbackPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Engine configuration: process-wide comparison defaults plus backend selection.
///
/// Loaded from an optional TOML file (`FACECHECK_CONFIG`), then overridden by
/// `FACECHECK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// External model command (program + leading args). Replaces the ONNX backend when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_command: Option<Vec<String>>,
    /// Defaults applied to every comparison that does not bring its own config.
    pub comparison: ComparisonConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: facecheck_core::default_model_dir(),
            external_command: None,
            comparison: ComparisonConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `FACECHECK_CONFIG` (if set) and the environment, then validate.
    pub fn load() -> Result<Self, EngineConfigError> {
        let base = match std::env::var_os("FACECHECK_CONFIG") {
            Some(path) => Self::from_toml_file(Path::new(&path))?,
            None => Self::default(),
        };
        let config = base.with_env_overrides();
        config.comparison.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, EngineConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| EngineConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, EngineConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACECHECK_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = var("FACECHECK_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = var("FACECHECK_EXTERNAL_COMMAND") {
            let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            self.external_command = if parts.is_empty() { None } else { Some(parts) };
        }

        let c = &mut self.comparison;
        c.match_threshold = parsed(&var, "FACECHECK_MATCH_THRESHOLD", c.match_threshold);
        c.timeout_ms = parsed(&var, "FACECHECK_TIMEOUT_MS", c.timeout_ms);
        c.max_image_bytes = parsed(&var, "FACECHECK_MAX_IMAGE_BYTES", c.max_image_bytes);
        c.embedding_dim = parsed(&var, "FACECHECK_EMBEDDING_DIM", c.embedding_dim);
        if let Some(formats) = var("FACECHECK_ALLOWED_FORMATS") {
            c.allowed_formats = formats
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(mode) = var("FACECHECK_FALLBACK") {
            match mode.trim() {
                "fail_closed" => c.fallback = FallbackPolicy::FailClosed,
                "randomized" => c.fallback = FallbackPolicy::LEGACY_RANDOMIZED,
                other => tracing::warn!(value = other, "ignoring unknown FACECHECK_FALLBACK"),
            }
        }
        if let Some(dir) = var("FACECHECK_TEMP_DIR") {
            c.temp_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(facecheck_core::DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(facecheck_core::RECOGNIZER_MODEL_FILE)
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match var(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable config value");
                current
            }
        },
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default().with_overrides(env(&[
            ("FACECHECK_MODEL_DIR", "/opt/models"),
            ("FACECHECK_MATCH_THRESHOLD", "0.6"),
            ("FACECHECK_TIMEOUT_MS", "2500"),
            ("FACECHECK_ALLOWED_FORMATS", "png, jpg"),
            ("FACECHECK_FALLBACK", "randomized"),
            ("FACECHECK_EXTERNAL_COMMAND", "python3 face_model.py"),
        ]));
        assert_eq!(config.detector_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(config.comparison.match_threshold, 0.6);
        assert_eq!(config.comparison.timeout_ms, 2500);
        assert_eq!(config.comparison.allowed_formats, vec!["png", "jpg"]);
        assert_eq!(config.comparison.fallback, FallbackPolicy::LEGACY_RANDOMIZED);
        assert_eq!(
            config.external_command,
            Some(vec!["python3".to_string(), "face_model.py".to_string()])
        );
    }

    #[test]
    fn test_unparsable_env_keeps_current() {
        let config = EngineConfig::default().with_overrides(env(&[
            ("FACECHECK_TIMEOUT_MS", "soon"),
            ("FACECHECK_FALLBACK", "coin_flip"),
        ]));
        assert_eq!(config.comparison.timeout_ms, 8000);
        assert_eq!(config.comparison.fallback, FallbackPolicy::FailClosed);
    }

    #[test]
    fn test_toml_file() {
        let config = EngineConfig::from_toml_str(
            r#"
            model_dir = "/srv/models"

            [comparison]
            match_threshold = 0.8
            metric = "euclidean_l2"

            [comparison.fallback]
            mode = "randomized"
            min = 0.5
            max = 0.6
            "#,
        )
        .unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.comparison.match_threshold, 0.8);
        assert_eq!(config.comparison.timeout_ms, 8000);
        assert_eq!(config.comparison.metric, facecheck_core::DistanceMetric::EuclideanL2);
        assert_eq!(config.comparison.fallback, FallbackPolicy::Randomized { min: 0.5, max: 0.6 });
    }

    #[test]
    fn test_toml_roundtrips_through_serializer() {
        let config = EngineConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("comparison = 3"),
            Err(EngineConfigError::Parse(_))
        ));
    }
}
