// src/config/mod.rs
//! Pipeline configuration (`config/pipeline.toml`).
//!
//! Every field has a default, so a file only needs `[[sources]]` and the
//! scoring categories. `FEED_TRIAGE_CONFIG` points at another file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::TrendThresholds;
use crate::analyze::{LocalScorer, ScoringConfig};
use crate::classify::{ClassifyConfig, ServiceConfig};
use crate::dedup::DedupConfig;
use crate::error::ConfigError;
use crate::ingest::registry::BreakerPolicy;
use crate::ingest::{FetchOptions, Source, SourceRegistry};
use crate::retry::RetryPolicy;

pub const ENV_CONFIG_PATH: &str = "FEED_TRIAGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// Upper bound for hour-valued settings (ten years).
pub const MAX_HOURS: u64 = 10 * 366 * 24;
/// Upper bound for `run.deadline_secs` (one week).
pub const MAX_DEADLINE_SECS: u64 = 7 * 24 * 3600;

/// An hour-valued setting as a duration. Zero and values above [`MAX_HOURS`]
/// are rejected.
pub fn hours_setting(field: &str, hours: u64) -> Result<chrono::Duration, ConfigError> {
    if hours == 0 || hours > MAX_HOURS {
        return Err(ConfigError::invalid(format!(
            "{field} must be within 1..={MAX_HOURS}, got {hours}"
        )));
    }
    chrono::Duration::try_hours(hours as i64)
        .ok_or_else(|| ConfigError::invalid(format!("{field} is out of range")))
}

pub fn deadline_setting(secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 || secs > MAX_DEADLINE_SECS {
        return Err(ConfigError::invalid(format!(
            "run.deadline_secs must be within 1..={MAX_DEADLINE_SECS}, got {secs}"
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn default_fetch_concurrency() -> usize {
    10
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_breaker_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    15 * 60
}
fn default_max_cooldown_secs() -> u64 {
    6 * 3600
}
fn default_deactivate_after() -> u32 {
    10
}
fn default_user_agent() -> String {
    concat!("feed-triage/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
    #[serde(default = "default_deactivate_after")]
    pub deactivate_after: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_fetch_concurrency(),
            timeout_secs: default_fetch_timeout_secs(),
            retry: RetryPolicy::default(),
            breaker_threshold: default_breaker_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
            deactivate_after: default_deactivate_after(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn breaker(&self) -> BreakerPolicy {
        BreakerPolicy {
            threshold: self.breaker_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            max_cooldown: Duration::from_secs(self.max_cooldown_secs),
            deactivate_after: self.deactivate_after,
        }
    }

    pub fn options(&self) -> FetchOptions {
        FetchOptions {
            max_concurrency: self.max_concurrency,
            per_source_timeout: Duration::from_secs(self.timeout_secs),
            retry: self.retry.clone(),
            deadline: None,
        }
    }
}

fn default_trend_id() -> String {
    "primary".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendsConfig {
    #[serde(default = "default_trend_id")]
    pub trend_id: String,
    /// Plain-language statement items are judged against in stance mode.
    #[serde(default)]
    pub description: Option<String>,
    /// Aggregation window; defaults to the run lookback.
    #[serde(default)]
    pub window_hours: Option<u64>,
    #[serde(flatten)]
    pub thresholds: TrendThresholds,
}

impl Default for TrendsConfig {
    fn default() -> Self {
        Self {
            trend_id: default_trend_id(),
            description: None,
            window_hours: None,
            thresholds: TrendThresholds::default(),
        }
    }
}

fn default_lookback_hours() -> u64 {
    72
}
fn default_top_n() -> usize {
    20
}
fn default_store_path() -> PathBuf {
    PathBuf::from("data/output.json")
}
fn default_registry_path() -> PathBuf {
    PathBuf::from("data/source_health.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,
    /// Whole-run deadline; unset means no deadline.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            deadline_secs: None,
            dry_run: false,
            top_n: default_top_n(),
            store_path: default_store_path(),
            registry_path: default_registry_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub trends: TrendsConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl AppConfig {
    /// Path from `FEED_TRIAGE_CONFIG`, else the default.
    pub fn default_path() -> PathBuf {
        std::env::var(ENV_CONFIG_PATH)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg = Self::from_toml_str(&data)?;
        tracing::debug!(target: "config", path = %path.display(), sources = cfg.sources.len(), "config loaded");
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.max_concurrency == 0 {
            return Err(ConfigError::invalid("fetch.max_concurrency must be > 0"));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::invalid("fetch.timeout_secs must be > 0"));
        }
        if self.fetch.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("fetch.retry.max_attempts must be > 0"));
        }
        if self.fetch.cooldown_secs > self.fetch.max_cooldown_secs {
            return Err(ConfigError::invalid("fetch.cooldown_secs exceeds fetch.max_cooldown_secs"));
        }

        let mut ids = HashSet::new();
        for s in &self.sources {
            if s.id.trim().is_empty() || s.url.trim().is_empty() {
                return Err(ConfigError::invalid("sources need a non-empty id and url"));
            }
            if !ids.insert(s.id.as_str()) {
                return Err(ConfigError::invalid(format!("duplicate source id `{}`", s.id)));
            }
            if !(0.0..=1.0).contains(&s.reliability) {
                return Err(ConfigError::invalid(format!(
                    "source `{}` reliability must be within [0,1]",
                    s.id
                )));
            }
        }

        let d = &self.dedup;
        if !(d.similarity_threshold > 0.0 && d.similarity_threshold <= 1.0) {
            return Err(ConfigError::invalid("dedup.similarity_threshold must be within (0,1]"));
        }
        if d.shingle_size == 0 || d.leading_words == 0 {
            return Err(ConfigError::invalid(
                "dedup.shingle_size and dedup.leading_words must be > 0",
            ));
        }
        hours_setting("dedup.time_window_hours", d.time_window_hours)?;

        // compiles categories, exclusion rules and regexes
        self.scorer()?;
        self.classify.validate()?;
        self.trends.thresholds.validate()?;

        if let Some(h) = self.trends.window_hours {
            hours_setting("trends.window_hours", h)?;
        }
        hours_setting("run.lookback_hours", self.run.lookback_hours)?;
        if let Some(secs) = self.run.deadline_secs {
            deadline_setting(secs)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<SourceRegistry, ConfigError> {
        SourceRegistry::from_sources(self.sources.iter().cloned(), self.fetch.breaker())
    }

    pub fn scorer(&self) -> Result<LocalScorer, ConfigError> {
        let reliability: HashMap<String, f32> = self
            .sources
            .iter()
            .map(|s| (s.id.clone(), s.reliability))
            .collect();
        LocalScorer::new(&self.scoring, reliability)
    }
}
