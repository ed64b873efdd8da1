// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;

// Stages, in pipeline order
pub mod ingest;
pub mod dedup;
pub mod analyze;
pub mod classify;
pub mod aggregate;

pub mod pipeline;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::config::AppConfig;
pub use crate::error::{ConfigError, StageError};
pub use crate::pipeline::{GapReport, Pipeline, RunOutput, RunParams, RunReport, RunStatus};
pub use crate::store::{OutputStore, Query};
