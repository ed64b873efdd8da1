// src/error.rs
//! Error types shared across pipeline stages.
//!
//! `StageError` is the reportable taxonomy: every per-source, per-item and
//! per-batch failure ends up as one of these inside a run report instead of
//! aborting the run. `ConfigError` is the only fatal class.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Reportable, non-fatal failure captured by a pipeline stage.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    /// Retryable I/O failure that survived every retry.
    #[error("transient I/O error: {detail}")]
    TransientIo { detail: String },

    /// Circuit-broken or deactivated source, skipped for this run.
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable {
        source_id: String,
        reason: String,
        until: Option<DateTime<Utc>>,
    },

    /// Bad feed document or bad raw item.
    #[error("malformed input from {origin}: {detail}")]
    MalformedInput { origin: String, detail: String },

    /// Batch submission ran out of attempts (or budget).
    #[error("classification exhausted for {batch_id} after {attempts} attempt(s): {last_error}")]
    ClassificationExhausted {
        batch_id: String,
        attempts: u32,
        last_error: String,
    },

    /// Response received but no record could be recovered from it.
    #[error("no records recoverable from response of {batch_id}")]
    ParseRecoveryFailure { batch_id: String },
}

impl StageError {
    /// Short stable label used for grouping in summaries and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::TransientIo { .. } => "transient_io",
            StageError::SourceUnavailable { .. } => "source_unavailable",
            StageError::MalformedInput { .. } => "malformed_input",
            StageError::ClassificationExhausted { .. } => "classification_exhausted",
            StageError::ParseRecoveryFailure { .. } => "parse_recovery_failure",
        }
    }

    pub fn malformed(origin: impl Into<String>, detail: impl Into<String>) -> Self {
        StageError::MalformedInput {
            origin: origin.into(),
            detail: detail.into(),
        }
    }
}

/// Startup configuration problems. Fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("missing environment variable {0}")]
    MissingEnv(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}
