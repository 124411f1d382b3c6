//! facecheck-engine: runs timed face comparisons on top of `facecheck-core`.
//!
//! The [`Engine`] loads both images, runs detection and extraction on
//! blocking workers under one deadline, and turns every pipeline failure into
//! a degraded result chosen by the configured fallback policy.

pub mod config;
pub mod engine;
pub mod fallback;
pub mod stage;
pub mod staging;

pub use config::{EngineConfig, EngineConfigError};
pub use engine::{open_backend, CompareRequest, Engine};
pub use stage::{Stage, StageTracker};
