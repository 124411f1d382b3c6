use crate::config::EngineConfig;
use crate::fallback;
use crate::stage::{Stage, StageTracker};
use crate::staging::StagedFile;
use facecheck_core::{
    detector, loader, policy, scorer, ComparisonConfig, ComparisonResult, ConfigError, Embedding,
    ExternalBackend, FaceBackend, FaceRegion, Image, ImageInput, InputError, OnnxBackend,
    PipelineError, UnavailableBackend,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Why a comparison fell back to a degraded result. The display text becomes
/// the result's `reason`.
#[derive(Error, Debug)]
enum DegradeCause {
    #[error("loading: {0}")]
    Loading(PipelineError),
    #[error("image {index}: {source}")]
    Image {
        index: usize,
        #[source]
        source: PipelineError,
    },
    #[error("scoring: {0}")]
    Scoring(PipelineError),
    #[error("could not stage image {index}: {source}")]
    Staging {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {timeout_ms} ms while {stage}")]
    Timeout { timeout_ms: u64, stage: Stage },
}

/// How a comparison ended short of a result.
enum Failure {
    Rejected(InputError),
    Degraded(DegradeCause),
}

impl From<InputError> for Failure {
    fn from(e: InputError) -> Self {
        Failure::Rejected(e)
    }
}

impl From<DegradeCause> for Failure {
    fn from(cause: DegradeCause) -> Self {
        Failure::Degraded(cause)
    }
}

/// Both images decoded, with the temp files that back them if any.
struct Prepared {
    images: [Image; 2],
    staged: Vec<StagedFile>,
}

/// A comparison request as a transport layer would deserialize it.
///
/// Images are optional here so that a missing one is reported as a
/// caller-input error instead of a deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct CompareRequest {
    pub image1: Option<ImageInput>,
    pub image2: Option<ImageInput>,
    /// Per-call override of the engine defaults.
    #[serde(default)]
    pub config: Option<ComparisonConfig>,
}

/// The comparison orchestrator.
///
/// Stateless across calls and cheap to clone; concurrent comparisons share
/// only the backend and the read-only default config.
#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn FaceBackend>,
    defaults: Arc<ComparisonConfig>,
}

impl Engine {
    pub fn new(backend: Arc<dyn FaceBackend>, defaults: ComparisonConfig) -> Result<Self, ConfigError> {
        defaults.validate()?;
        Ok(Self {
            backend,
            defaults: Arc::new(defaults),
        })
    }

    /// Build an engine with the backend `config` selects.
    ///
    /// Never fails on model problems: if the runtime cannot be set up the
    /// engine still starts and every comparison degrades.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Self::new(open_backend(config), config.comparison.clone())
    }

    pub fn defaults(&self) -> &ComparisonConfig {
        &self.defaults
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Compare two images with the engine's default config.
    pub async fn compare(
        &self,
        first: ImageInput,
        second: ImageInput,
    ) -> Result<ComparisonResult, InputError> {
        let defaults = Arc::clone(&self.defaults);
        self.compare_with(first, second, &defaults).await
    }

    /// Handle a transport-level request: both images must be present.
    pub async fn handle(&self, request: CompareRequest) -> Result<ComparisonResult, InputError> {
        let first = request.image1.ok_or(InputError::MissingImage(1))?;
        let second = request.image2.ok_or(InputError::MissingImage(2))?;
        match request.config {
            Some(config) => self.compare_with(first, second, &config).await,
            None => self.compare(first, second).await,
        }
    }

    /// Compare two images.
    ///
    /// Caller-input problems (bad config, unreadable, oversized, undecodable or
    /// disallowed images) are returned as errors. Everything that goes wrong
    /// in the model pipeline, including the deadline, yields a result with
    /// `degraded = true`. The deadline covers loading too; if it passes before
    /// both images are loaded the result degrades without waiting for the
    /// loader. Staged temp files are removed before this returns, or by the
    /// abandoned loader once it finishes.
    pub async fn compare_with(
        &self,
        first: ImageInput,
        second: ImageInput,
        config: &ComparisonConfig,
    ) -> Result<ComparisonResult, InputError> {
        config.validate()?;

        let invocation = uuid::Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(config.timeout_ms);
        let tracker = StageTracker::new();
        tracker.advance(Stage::Loading);

        let mut staged = Vec::new();
        let attempt = async {
            let prepared: Result<Prepared, Failure> = self
                .spawn_prepare([first, second], config, &invocation)
                .await
                .unwrap_or_else(|join| {
                    let crashed = PipelineError::WorkerCrashed(join.to_string());
                    Err(Failure::Degraded(DegradeCause::Loading(crashed)))
                });
            let Prepared {
                images: [image1, image2],
                staged: files,
            } = prepared?;
            staged = files;
            self.run_pipeline(image1, image2, config, tracker.clone(), deadline)
                .await
                .map_err(Failure::Degraded)
        };
        let outcome = match tokio::time::timeout_at(deadline, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Failure::Degraded(DegradeCause::Timeout {
                timeout_ms: config.timeout_ms,
                stage: tracker.current(),
            })),
        };

        for file in staged {
            file.remove();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(result) => {
                tracker.finish(Stage::Done);
                tracing::info!(
                    %invocation,
                    matched = result.matched,
                    confidence = result.confidence,
                    distance = result.distance,
                    elapsed_ms,
                    "comparison done"
                );
                result
            }
            Err(Failure::Rejected(e)) => {
                tracker.finish(Stage::Failed);
                tracing::info!(%invocation, error = %e, elapsed_ms, "comparison rejected");
                return Err(e);
            }
            Err(Failure::Degraded(cause)) => {
                let stage = tracker.finish(Stage::Degraded);
                tracing::warn!(
                    %invocation,
                    %stage,
                    reason = %cause,
                    elapsed_ms,
                    fallback = ?config.fallback,
                    "comparison degraded"
                );
                fallback::degraded_result(config.fallback, config.match_threshold, cause.to_string())
            }
        };
        Ok(result)
    }

    /// Detect faces in one image with the default config, for diagnostics.
    ///
    /// The outer result carries caller-input errors, the inner one pipeline
    /// errors. Loading, staging and detection share one deadline.
    pub async fn detect(
        &self,
        input: ImageInput,
    ) -> Result<Result<Vec<FaceRegion>, PipelineError>, InputError> {
        let config = Arc::clone(&self.defaults);
        let backend = Arc::clone(&self.backend);
        let invocation = uuid::Uuid::new_v4().simple().to_string();
        let timeout = Duration::from_millis(config.timeout_ms);
        let deadline = std::time::Instant::now() + timeout;

        let task = tokio::task::spawn_blocking(move || -> Result<_, InputError> {
            let image = loader::load(&input, &config)?;
            let mut staged = Vec::new();
            let detected = match stage(backend.as_ref(), image, &config, &invocation, 1, &mut staged) {
                Ok(image) => backend.detect(&image, deadline),
                Err(cause) => Err(PipelineError::RuntimeUnavailable(cause.to_string())),
            };
            for file in staged {
                file.remove();
            }
            Ok(detected)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Ok(Err(PipelineError::WorkerCrashed(join.to_string()))),
            Err(_) => Ok(Err(PipelineError::DetectionFailed(format!(
                "timed out after {} ms",
                timeout.as_millis()
            )))),
        }
    }

    /// Load and stage both images on a blocking worker.
    ///
    /// If the handle is dropped the worker runs to completion on its own and
    /// its staged files are deleted when its result is discarded.
    fn spawn_prepare(
        &self,
        inputs: [ImageInput; 2],
        config: &ComparisonConfig,
        invocation: &str,
    ) -> JoinHandle<Result<Prepared, Failure>> {
        let backend = Arc::clone(&self.backend);
        let config = config.clone();
        let invocation = invocation.to_string();
        tokio::task::spawn_blocking(move || prepare(backend.as_ref(), inputs, &config, &invocation))
    }

    async fn run_pipeline(
        &self,
        image1: Image,
        image2: Image,
        config: &ComparisonConfig,
        tracker: StageTracker,
        deadline: Instant,
    ) -> Result<ComparisonResult, DegradeCause> {
        let first = self.spawn_embed(image1, tracker.clone(), deadline);
        let second = self.spawn_embed(image2, tracker.clone(), deadline);
        let (first, second) = tokio::join!(first, second);
        let first = joined(1, first)?;
        let second = joined(2, second)?;

        tracker.advance(Stage::Scoring);
        let score = scorer::score(&first, &second, config.metric)
            .map_err(|e| DegradeCause::Scoring(e.into()))?;

        tracker.advance(Stage::Deciding);
        let matched = policy::decide(score.confidence, config.match_threshold);

        Ok(ComparisonResult {
            matched,
            confidence: score.confidence,
            distance: score.distance,
            degraded: false,
            reason: None,
        })
    }

    /// Run detection and extraction for one image on a blocking worker.
    ///
    /// On timeout the handle is dropped and the worker is abandoned, not killed.
    fn spawn_embed(
        &self,
        image: Image,
        tracker: StageTracker,
        deadline: Instant,
    ) -> JoinHandle<Result<Embedding, PipelineError>> {
        let backend = Arc::clone(&self.backend);
        let deadline = deadline.into_std();
        tokio::task::spawn_blocking(move || {
            embed_primary_face(backend.as_ref(), &image, &tracker, deadline)
        })
    }
}

fn prepare(
    backend: &dyn FaceBackend,
    inputs: [ImageInput; 2],
    config: &ComparisonConfig,
    invocation: &str,
) -> Result<Prepared, Failure> {
    let [first, second] = inputs;
    let image1 = loader::load(&first, config)?;
    let image2 = loader::load(&second, config)?;

    let mut staged = Vec::new();
    let image1 = stage(backend, image1, config, invocation, 1, &mut staged)?;
    let image2 = stage(backend, image2, config, invocation, 2, &mut staged)?;
    Ok(Prepared {
        images: [image1, image2],
        staged,
    })
}

/// Give an in-memory image a file on disk when the backend needs one.
///
/// A created file is pushed to `staged` before returning, so whoever owns
/// `staged` cleans it up whatever happens afterwards.
fn stage(
    backend: &dyn FaceBackend,
    image: Image,
    config: &ComparisonConfig,
    invocation: &str,
    index: usize,
    staged: &mut Vec<StagedFile>,
) -> Result<Image, DegradeCause> {
    if !backend.requires_staged_file() || image.file().is_some() {
        return Ok(image);
    }
    let file = StagedFile::write(&config.temp_dir(), invocation, index, &image)
        .map_err(|source| DegradeCause::Staging { index, source })?;
    let path = file.path().to_path_buf();
    staged.push(file);
    Ok(image.with_file(path))
}

fn joined(
    index: usize,
    result: Result<Result<Embedding, PipelineError>, tokio::task::JoinError>,
) -> Result<Embedding, DegradeCause> {
    match result {
        Ok(Ok(embedding)) => Ok(embedding),
        Ok(Err(source)) => Err(DegradeCause::Image { index, source }),
        Err(join) => Err(DegradeCause::Image {
            index,
            source: PipelineError::WorkerCrashed(join.to_string()),
        }),
    }
}

/// Detect, pick the primary face, extract its embedding.
fn embed_primary_face(
    backend: &dyn FaceBackend,
    image: &Image,
    tracker: &StageTracker,
    deadline: std::time::Instant,
) -> Result<Embedding, PipelineError> {
    tracker.advance(Stage::Detecting);
    let regions = backend.detect(image, deadline)?;
    let face = detector::select_primary(&regions).ok_or(PipelineError::NoFaceDetected)?;
    tracing::debug!(
        origin = %image.origin(),
        candidates = regions.len(),
        confidence = face.confidence,
        width = face.width,
        height = face.height,
        "primary face selected"
    );

    tracker.advance(Stage::Extracting);
    backend.extract(image, face, deadline)
}

/// Pick the backend `config` asks for, falling back to [`UnavailableBackend`]
/// when it cannot be set up.
pub fn open_backend(config: &EngineConfig) -> Arc<dyn FaceBackend> {
    let dim = config.comparison.embedding_dim;

    let opened = match &config.external_command {
        Some(command) => {
            ExternalBackend::new(command, dim).map(|b| Arc::new(b) as Arc<dyn FaceBackend>)
        }
        None => OnnxBackend::load(
            &config.detector_model_path(),
            &config.recognizer_model_path(),
            dim,
        )
        .map(|b| Arc::new(b) as Arc<dyn FaceBackend>),
    };

    match opened {
        Ok(backend) => {
            tracing::info!(backend = backend.name(), "face backend ready");
            backend
        }
        Err(e) => {
            tracing::warn!(error = %e, "face backend unavailable; comparisons will degrade");
            Arc::new(UnavailableBackend::new(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrade_reasons() {
        let cause = DegradeCause::Image {
            index: 2,
            source: PipelineError::NoFaceDetected,
        };
        assert_eq!(cause.to_string(), "image 2: no face detected");

        let cause = DegradeCause::Timeout {
            timeout_ms: 8000,
            stage: Stage::Extracting,
        };
        assert_eq!(cause.to_string(), "timed out after 8000 ms while extracting");

        let cause = DegradeCause::Loading(PipelineError::WorkerCrashed("decoder panicked".into()));
        assert_eq!(cause.to_string(), "loading: model worker crashed: decoder panicked");
    }

    #[test]
    fn test_request_deserializes_with_missing_image() {
        let request: CompareRequest =
            serde_json::from_str(r#"{"image1": {"data_url": "data:image/png;base64,AA=="}}"#).unwrap();
        assert!(request.image1.is_some());
        assert!(request.image2.is_none());
        assert!(request.config.is_none());
    }

    #[test]
    fn test_open_backend_without_models_is_unavailable() {
        let config = EngineConfig {
            model_dir: "/nonexistent/facecheck-models".into(),
            ..Default::default()
        };
        assert_eq!(open_backend(&config).name(), "unavailable");
    }

    #[tokio::test]
    async fn test_handle_reports_missing_image() {
        let engine = Engine::new(
            Arc::new(UnavailableBackend::new("test")),
            ComparisonConfig::default(),
        )
        .unwrap();
        let err = engine.handle(CompareRequest::default()).await.unwrap_err();
        assert!(matches!(err, InputError::MissingImage(1)));
    }
}
