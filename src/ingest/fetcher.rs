// src/ingest/fetcher.rs
//! Concurrency-bounded feed retrieval.
//!
//! Every ready source gets its own task; a shared semaphore caps in-flight
//! requests, each attempt has its own timeout, and transient failures go
//! through the shared retry policy. Health is written back per source right
//! after its attempt finishes. Network conditions never fail `fetch_all`;
//! they show up in the `FetchReport`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::feed::parse_feed_document;
use super::registry::{Availability, SourceEntry, SourceRegistry};
use super::types::RawItem;
use crate::error::{ConfigError, StageError};
use crate::retry::{retry, RetryPolicy};

/// Transport-level failure of a single request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {0}")]
    Status(u16),
    #[error("connection error: {0}")]
    Connect(String),
    #[error("body read error: {0}")]
    Body(String),
}

impl FetchError {
    /// Timeouts, resets, 429 and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Connect(_) | FetchError::Body(_) => true,
            FetchError::Status(code) => *code == 429 || (500..=599).contains(code),
        }
    }
}

/// Anything that can turn a URL into a document body.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, FetchError>;
}

/// reqwest-backed transport used in production.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(5).min(request_timeout))
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Connect(e.to_string())
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        resp.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Body(e.to_string())
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_concurrency: usize,
    pub per_source_timeout: Duration,
    pub retry: RetryPolicy,
    /// Run-wide deadline; unfinished fetches are cancelled when it passes.
    pub deadline: Option<Instant>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            per_source_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            deadline: None,
        }
    }
}

impl FetchOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("fetch max_concurrency must be > 0"));
        }
        if self.per_source_timeout.is_zero() {
            return Err(ConfigError::invalid("fetch timeout must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("fetch retry.max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// What happened to one source during this run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Fetched {
        items: usize,
        skipped_entries: usize,
        attempts: u32,
        latency_ms: u64,
    },
    Failed {
        attempts: u32,
        error: StageError,
    },
    Skipped {
        error: StageError,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFetch {
    pub source_id: String,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchReport {
    /// One entry per registered source, in id order.
    pub sources: Vec<SourceFetch>,
    pub total_items: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub avg_latency_ms: Option<f64>,
    /// Failure counts grouped by error kind.
    pub error_summary: BTreeMap<String, usize>,
}

impl FetchReport {
    fn from_outcomes(mut sources: Vec<SourceFetch>) -> Self {
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        let mut r = FetchReport::default();
        let mut latency_sum = 0u64;
        for s in &sources {
            match &s.outcome {
                SourceOutcome::Fetched {
                    items, latency_ms, ..
                } => {
                    r.successful += 1;
                    r.total_items += items;
                    latency_sum += latency_ms;
                }
                SourceOutcome::Failed { error, .. } => {
                    r.failed += 1;
                    *r.error_summary.entry(error.kind().to_string()).or_default() += 1;
                }
                SourceOutcome::Skipped { error } => {
                    r.skipped += 1;
                    *r.error_summary.entry(error.kind().to_string()).or_default() += 1;
                }
                SourceOutcome::Cancelled => r.cancelled += 1,
            }
        }
        if r.successful > 0 {
            r.avg_latency_ms = Some(latency_sum as f64 / r.successful as f64);
        }
        r.sources = sources;
        r
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| matches!(s.outcome, SourceOutcome::Failed { .. }))
            .map(|s| s.source_id.as_str())
            .collect()
    }

    pub fn outcome(&self, source_id: &str) -> Option<&SourceOutcome> {
        self.sources
            .iter()
            .find(|s| s.source_id == source_id)
            .map(|s| &s.outcome)
    }

    /// More than 20% of the sources we actually tried failed.
    pub fn is_degraded(&self) -> bool {
        let attempted = self.successful + self.failed;
        attempted > 0 && (self.failed as f64) / (attempted as f64) > 0.20
    }
}

#[derive(Debug, Default)]
pub struct FetchOutput {
    pub items: Vec<RawItem>,
    pub report: FetchReport,
}

/// Fetch every ready source in the registry.
///
/// Fails only when `opts` is invalid.
pub async fn fetch_all(
    registry: &SourceRegistry,
    transport: Arc<dyn FeedTransport>,
    opts: &FetchOptions,
) -> Result<FetchOutput, ConfigError> {
    opts.validate()?;
    crate::metrics::ensure_metrics_described();

    let now = Utc::now();
    let pool = Arc::new(Semaphore::new(opts.max_concurrency));
    let mut outcomes = Vec::with_capacity(registry.len());
    let mut tasks = JoinSet::new();

    for entry in registry.entries() {
        let id = entry.source.id.clone();
        match entry.availability(now) {
            Availability::Inactive => {
                outcomes.push(SourceFetch {
                    source_id: id.clone(),
                    outcome: SourceOutcome::Skipped {
                        error: StageError::SourceUnavailable {
                            source_id: id,
                            reason: "deactivated".into(),
                            until: None,
                        },
                    },
                });
            }
            Availability::Cooling(until) => {
                tracing::info!(target: "fetch", source = %id, %until, "source cooling, skipped");
                outcomes.push(SourceFetch {
                    source_id: id.clone(),
                    outcome: SourceOutcome::Skipped {
                        error: StageError::SourceUnavailable {
                            source_id: id,
                            reason: "circuit open".into(),
                            until: Some(until),
                        },
                    },
                });
            }
            Availability::Ready => {
                let entry = Arc::clone(entry);
                let transport = Arc::clone(&transport);
                let pool = Arc::clone(&pool);
                let opts = opts.clone();
                let breaker = registry.policy().clone();
                tasks.spawn(async move {
                    let work = fetch_one(&entry, transport, pool, &opts, &breaker);
                    match opts.deadline {
                        Some(deadline) => match tokio::time::timeout_at(deadline, work).await {
                            Ok(done) => done,
                            Err(_) => {
                                tracing::warn!(target: "fetch", source = %entry.source.id, "deadline reached, fetch cancelled");
                                (
                                    SourceFetch {
                                        source_id: entry.source.id.clone(),
                                        outcome: SourceOutcome::Cancelled,
                                    },
                                    Vec::new(),
                                )
                            }
                        },
                        None => work.await,
                    }
                });
            }
        }
    }

    let mut by_source: BTreeMap<String, Vec<RawItem>> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((fetch, items)) => {
                by_source.insert(fetch.source_id.clone(), items);
                outcomes.push(fetch);
            }
            Err(e) => tracing::error!(target: "fetch", error = %e, "fetch task aborted"),
        }
    }

    let items: Vec<RawItem> = by_source.into_values().flatten().collect();
    let report = FetchReport::from_outcomes(outcomes);
    counter!("fetch_items_total").increment(items.len() as u64);
    tracing::info!(
        target: "fetch",
        items = items.len(),
        ok = report.successful,
        failed = report.failed,
        skipped = report.skipped,
        cancelled = report.cancelled,
        "fetch finished"
    );
    Ok(FetchOutput { items, report })
}

async fn fetch_one(
    entry: &SourceEntry,
    transport: Arc<dyn FeedTransport>,
    pool: Arc<Semaphore>,
    opts: &FetchOptions,
    breaker: &crate::ingest::registry::BreakerPolicy,
) -> (SourceFetch, Vec<RawItem>) {
    let source_id = entry.source.id.clone();
    let url = entry.source.url.clone();
    let timeout = opts.per_source_timeout;
    let started = Instant::now();

    let fetched = retry(&opts.retry, FetchError::is_transient, |_attempt| {
        let transport = Arc::clone(&transport);
        let pool = Arc::clone(&pool);
        let url = url.clone();
        async move {
            let _permit = pool
                .acquire_owned()
                .await
                .map_err(|_| FetchError::Connect("fetch pool closed".into()))?;
            counter!("fetch_attempts_total").increment(1);
            match tokio::time::timeout(timeout, transport.get(&url)).await {
                Ok(res) => res,
                Err(_) => Err(FetchError::Timeout),
            }
        }
    })
    .await;

    let now = Utc::now();
    let (error, attempts) = match fetched {
        Ok((body, attempts)) => match parse_feed_document(&source_id, &body, now) {
            Ok(parsed) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                entry.record_success(latency_ms as f64, now);
                histogram!("fetch_latency_ms").record(latency_ms as f64);
                tracing::debug!(target: "fetch", source = %source_id, items = parsed.items.len(), attempts, latency_ms, "source fetched");
                let outcome = SourceOutcome::Fetched {
                    items: parsed.items.len(),
                    skipped_entries: parsed.skipped_entries,
                    attempts,
                    latency_ms,
                };
                return (
                    SourceFetch {
                        source_id,
                        outcome,
                    },
                    parsed.items,
                );
            }
            Err(e) => (e, attempts),
        },
        Err(failure) => {
            let error = if failure.last.is_transient() {
                StageError::TransientIo {
                    detail: failure.last.to_string(),
                }
            } else {
                StageError::SourceUnavailable {
                    source_id: source_id.clone(),
                    reason: failure.last.to_string(),
                    until: None,
                }
            };
            (error, failure.attempts)
        }
    };

    let health = entry.record_failure(&error.to_string(), now, breaker);
    counter!("fetch_failures_total", "source" => source_id.clone()).increment(1);
    tracing::warn!(
        target: "fetch",
        source = %source_id,
        attempts,
        consecutive_failures = health.consecutive_failures,
        active = health.active,
        error = %error,
        "source fetch failed"
    );
    (
        SourceFetch {
            source_id,
            outcome: SourceOutcome::Failed { attempts, error },
        },
        Vec::new(),
    )
}
