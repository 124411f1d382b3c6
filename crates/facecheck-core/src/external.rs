//! Backend that delegates to an external model-serving command.
//!
//! Protocol (one process per call, image passed as a file path):
//!
//! ```text
//! <cmd> [args..] detect <image>              -> stdout: [{"x":..,"y":..,"width":..,"height":..,"confidence":..}, ..]
//! <cmd> [args..] embed <image> <x> <y> <w> <h> -> stdout: {"embedding": [..]}
//! ```
//!
//! A non-zero exit status, a missing program, or stdout that does not parse
//! all surface as [`PipelineError`]s.

use crate::backend::{FaceBackend, PipelineError};
use crate::types::{Embedding, FaceRegion, Image};
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

#[derive(Deserialize)]
struct EmbedOutput {
    embedding: Vec<f32>,
    #[serde(default)]
    model: Option<String>,
}

pub struct ExternalBackend {
    program: String,
    args: Vec<String>,
    embedding_dim: usize,
}

impl ExternalBackend {
    /// `command` is the program followed by its leading arguments.
    pub fn new(command: &[String], embedding_dim: usize) -> Result<Self, PipelineError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| PipelineError::RuntimeUnavailable("empty external command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            embedding_dim,
        })
    }

    /// Run the command once and return its stdout. A child still running at
    /// `deadline` is killed.
    async fn call(&self, extra: &[String], deadline: Instant) -> Result<Vec<u8>, PipelineError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    PipelineError::RuntimeUnavailable(format!("{}: program not found", self.program))
                }
                _ => PipelineError::WorkerCrashed(format!("{}: spawn failed: {e}", self.program)),
            })?;

        let budget = deadline.saturating_duration_since(Instant::now());
        let output = tokio::time::timeout(budget, child.wait_with_output())
            .await
            .map_err(|_| {
                PipelineError::WorkerCrashed(format!(
                    "{} killed after {} ms",
                    self.program,
                    budget.as_millis()
                ))
            })?
            .map_err(|e| PipelineError::WorkerCrashed(format!("{}: wait failed: {e}", self.program)))?;

        if !output.status.success() {
            return Err(PipelineError::WorkerCrashed(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }
        Ok(output.stdout)
    }

    fn run(&self, extra: &[String], deadline: Instant) -> Result<Vec<u8>, PipelineError> {
        block_on(self.call(extra, deadline))?
    }
}

/// Drive `future` from a blocking worker: on the caller's runtime when there
/// is one, else on a private single-threaded one.
fn block_on<F: Future>(future: F) -> Result<F::Output, PipelineError> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| PipelineError::RuntimeUnavailable(format!("async runtime: {e}")))?;
            Ok(runtime.block_on(future))
        }
    }
}

fn image_path(image: &Image) -> Result<&Path, PipelineError> {
    image.file().ok_or_else(|| {
        PipelineError::RuntimeUnavailable("external backend needs the image on disk".to_string())
    })
}

/// Last non-empty stdout line; model tools tend to print banners before the result.
fn last_json_line(stdout: &[u8]) -> Result<&str, PipelineError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| PipelineError::MalformedOutput(format!("stdout is not UTF-8: {e}")))?;
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| PipelineError::MalformedOutput("empty stdout".to_string()))
}

fn parse_regions(stdout: &[u8]) -> Result<Vec<FaceRegion>, PipelineError> {
    serde_json::from_str(last_json_line(stdout)?)
        .map_err(|e| PipelineError::MalformedOutput(format!("detect output: {e}")))
}

fn parse_embedding(stdout: &[u8], expected_dim: usize) -> Result<Embedding, PipelineError> {
    let parsed: EmbedOutput = serde_json::from_str(last_json_line(stdout)?)
        .map_err(|e| PipelineError::MalformedOutput(format!("embed output: {e}")))?;
    if parsed.embedding.len() != expected_dim {
        return Err(PipelineError::ExtractionFailed(format!(
            "expected {expected_dim}-dim embedding, got {}",
            parsed.embedding.len()
        )));
    }
    Ok(Embedding {
        values: parsed.embedding,
        model_version: parsed.model,
    })
}

impl FaceBackend for ExternalBackend {
    fn name(&self) -> &str {
        "external"
    }

    fn detect(&self, image: &Image, deadline: Instant) -> Result<Vec<FaceRegion>, PipelineError> {
        let path = image_path(image)?;
        let stdout = self.run(
            &["detect".to_string(), path.to_string_lossy().into_owned()],
            deadline,
        )?;
        parse_regions(&stdout)
    }

    fn extract(
        &self,
        image: &Image,
        face: &FaceRegion,
        deadline: Instant,
    ) -> Result<Embedding, PipelineError> {
        let path = image_path(image)?;
        let stdout = self.run(
            &[
                "embed".to_string(),
                path.to_string_lossy().into_owned(),
                face.x.to_string(),
                face.y.to_string(),
                face.width.to_string(),
                face.height.to_string(),
            ],
            deadline,
        )?;
        parse_embedding(&stdout, self.embedding_dim)
    }

    fn requires_staged_file(&self) -> bool {
        true
    }
}
