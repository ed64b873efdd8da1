// src/pipeline.rs
//! One pipeline run: fetch, dedup, score, classify, aggregate.
//!
//! Every per-source, per-item and per-batch problem ends up in the run report.
//! Only configuration errors abort a run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::Serialize;
use tokio::time::Instant;

use crate::aggregate::{aggregate_trend, select_top, RankedItem, TimeWindow, TrendRecord};
use crate::analyze::{LocalScorer, ScoringSummary};
use crate::classify::{
    merge_results, plan_batches, select_candidates, BatchClassifier, ClassificationBatch,
    ClassificationService, ClassifyMode, PlainListing,
};
use crate::config::{self, AppConfig, MAX_DEADLINE_SECS, MAX_HOURS};
use crate::dedup::{deduplicate, CanonicalItem, DedupStats};
use crate::error::{ConfigError, StageError};
use crate::ingest::fetcher::SourceOutcome;
use crate::ingest::{fetch_all, FeedTransport, FetchReport, SourceRegistry};
use crate::store::StoredRun;

/// Operator-supplied knobs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub lookback: chrono::Duration,
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub dry_run: bool,
    pub mode: ClassifyMode,
    pub deadline: Option<Duration>,
    pub top_n: usize,
}

impl RunParams {
    /// Out-of-range values are clamped here and rejected by [`RunParams::validate`].
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            lookback: chrono::Duration::hours(cfg.run.lookback_hours.min(MAX_HOURS + 1) as i64),
            max_concurrency: cfg.fetch.max_concurrency,
            batch_size: cfg.classify.batch_size,
            dry_run: cfg.run.dry_run,
            mode: cfg.classify.mode,
            deadline: cfg.run.deadline_secs.map(Duration::from_secs),
            top_n: cfg.run.top_n,
        }
    }

    /// Replace the lookback with an operator override given in hours.
    pub fn set_lookback_hours(&mut self, hours: u64) -> Result<(), ConfigError> {
        self.lookback = config::hours_setting("lookback hours", hours)?;
        Ok(())
    }

    /// Replace the run deadline with an operator override given in seconds.
    pub fn set_deadline_secs(&mut self, secs: u64) -> Result<(), ConfigError> {
        self.deadline = Some(config::deadline_setting(secs)?);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.max_concurrency == 0 {
            return Err(ConfigError::invalid("batch size and max concurrency must be > 0"));
        }
        if self.lookback <= chrono::Duration::zero()
            || self.lookback > chrono::Duration::hours(MAX_HOURS as i64)
        {
            return Err(ConfigError::invalid(format!(
                "lookback must be within 1..={MAX_HOURS} hours"
            )));
        }
        if self
            .deadline
            .is_some_and(|d| d.is_zero() || d > Duration::from_secs(MAX_DEADLINE_SECS))
        {
            return Err(ConfigError::invalid(format!(
                "deadline must be within 1..={MAX_DEADLINE_SECS} seconds"
            )));
        }
        Ok(())
    }
}

/// Counts of everything that did not make it into the output, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GapReport {
    pub skipped_sources: usize,
    pub failed_sources: usize,
    pub cancelled_sources: usize,
    pub stale_items: usize,
    pub malformed_items: usize,
    pub filtered_items: usize,
    pub over_cap: usize,
    pub failed_batches: usize,
    pub unrecovered_items: usize,
    pub dropped_records: usize,
    pub deadline_hit: bool,
}

impl GapReport {
    /// Data the run should have produced but did not. Filtering, staleness,
    /// the candidate cap and malformed input are policy outcomes and do not count.
    pub fn has_data_loss(&self) -> bool {
        self.skipped_sources > 0
            || self.failed_sources > 0
            || self.cancelled_sources > 0
            || self.failed_batches > 0
            || self.unrecovered_items > 0
            || self.deadline_hit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    HardFailure,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::HardFailure => 1,
            RunStatus::PartialSuccess => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub mode: ClassifyMode,
    pub status: RunStatus,
    /// More than 20% of attempted sources failed.
    pub degraded_sources: bool,
    pub fetch: FetchReport,
    pub dedup: DedupStats,
    pub scoring: ScoringSummary,
    pub batches: Vec<ClassificationBatch>,
    pub gaps: GapReport,
    pub errors: Vec<StageError>,
    pub ranked: Vec<RankedItem>,
    pub trend: Option<TrendRecord>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub report: RunReport,
    pub items: Vec<CanonicalItem>,
}

impl RunOutput {
    pub fn stored(&self) -> StoredRun {
        StoredRun {
            finished_at: Some(self.report.finished_at),
            items: self.items.clone(),
            ranked: self.report.ranked.clone(),
            trends: self.report.trend.iter().cloned().collect(),
        }
    }
}

pub struct Pipeline {
    cfg: AppConfig,
    registry: SourceRegistry,
    scorer: LocalScorer,
    transport: Arc<dyn FeedTransport>,
    service: Option<Arc<dyn ClassificationService>>,
}

impl Pipeline {
    /// `service` may be absent for dry runs only.
    pub fn new(
        cfg: AppConfig,
        transport: Arc<dyn FeedTransport>,
        service: Option<Arc<dyn ClassificationService>>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let registry = cfg.registry()?;
        let scorer = cfg.scorer()?;
        Ok(Self {
            cfg,
            registry,
            scorer,
            transport,
            service,
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    /// Run once. `now` is the run clock used for lookback and recency.
    pub async fn run(&self, params: &RunParams, now: DateTime<Utc>) -> Result<RunOutput, ConfigError> {
        crate::metrics::ensure_metrics_described();
        params.validate()?;
        let cutoff = now
            .checked_sub_signed(params.lookback)
            .ok_or_else(|| ConfigError::invalid("lookback reaches before the earliest timestamp"))?;
        let trend_span = match self.cfg.trends.window_hours {
            Some(h) => config::hours_setting("trends.window_hours", h)?,
            None => params.lookback,
        };
        let service = match (&self.service, params.dry_run) {
            (Some(s), _) => Some(Arc::clone(s)),
            (None, true) => None,
            (None, false) => {
                return Err(ConfigError::invalid("no classification service configured"));
            }
        };
        let deadline = match params.deadline {
            Some(d) => Some(
                Instant::now()
                    .checked_add(d)
                    .ok_or_else(|| ConfigError::invalid("run deadline is out of range"))?,
            ),
            None => None,
        };
        tracing::info!(
            target: "pipeline",
            sources = self.registry.len(),
            dry_run = params.dry_run,
            mode = ?params.mode,
            "run started"
        );

        // fetch
        let mut fetch_opts = self.cfg.fetch.options();
        fetch_opts.max_concurrency = params.max_concurrency;
        fetch_opts.deadline = deadline;
        let fetched = fetch_all(&self.registry, Arc::clone(&self.transport), &fetch_opts).await?;
        let mut errors: Vec<StageError> = fetched
            .report
            .sources
            .iter()
            .filter_map(|s| match &s.outcome {
                SourceOutcome::Failed { error, .. } | SourceOutcome::Skipped { error } => {
                    Some(error.clone())
                }
                _ => None,
            })
            .collect();
        let skipped_entries: usize = fetched
            .report
            .sources
            .iter()
            .map(|s| match s.outcome {
                SourceOutcome::Fetched { skipped_entries, .. } => skipped_entries,
                _ => 0,
            })
            .sum();

        // lookback
        let (fresh, stale): (Vec<_>, Vec<_>) = fetched
            .items
            .into_iter()
            .partition(|i| i.effective_time() >= cutoff);
        if !stale.is_empty() {
            tracing::info!(target: "pipeline", stale = stale.len(), %cutoff, "items outside lookback dropped");
        }

        // dedup + score
        let deduped = deduplicate(&fresh, &self.cfg.dedup);
        errors.extend(deduped.malformed.iter().cloned());
        let mut items = deduped.items;
        let scoring = self.scorer.apply(&mut items, now);

        // classify
        let batch_cfg = crate::classify::ClassifyConfig {
            batch_size: params.batch_size,
            ..self.cfg.classify.clone()
        };
        let (batches, over_cap) = {
            let (candidates, over_cap) = select_candidates(&items, batch_cfg.candidate_cap);
            let batches = match service {
                _ if candidates.is_empty() => Vec::new(),
                None => plan_batches(&candidates, batch_cfg.batch_size),
                Some(_) if params.dry_run => plan_batches(&candidates, batch_cfg.batch_size),
                Some(service) => {
                    let classifier = BatchClassifier::new(service, &batch_cfg)?
                        .with_deadline(deadline)
                        .with_formatter(Arc::new(PlainListing {
                            body_chars: batch_cfg.body_chars,
                            trend: self.cfg.trends.description.clone(),
                        }));
                    classifier.classify(&candidates, params.mode).await
                }
            };
            (batches, over_cap)
        };
        errors.extend(batches.iter().filter_map(|b| b.error.clone()));
        let merged = merge_results(&mut items, &batches);

        // aggregate
        let ranked = match params.mode {
            ClassifyMode::Priority => select_top(&items, Some(params.top_n)),
            ClassifyMode::Stance => Vec::new(),
        };
        let trend = match params.mode {
            ClassifyMode::Stance if !params.dry_run => {
                // closes after the last fetch of this run
                let latest = Utc::now().max(now);
                let end = latest
                    .checked_add_signed(chrono::Duration::seconds(1))
                    .unwrap_or(latest);
                Some(aggregate_trend(
                    &self.cfg.trends.trend_id,
                    TimeWindow::trailing(end, trend_span),
                    &items,
                    &self.cfg.trends.thresholds,
                ))
            }
            _ => None,
        };

        let gaps = GapReport {
            skipped_sources: fetched.report.skipped,
            failed_sources: fetched.report.failed,
            cancelled_sources: fetched.report.cancelled,
            stale_items: stale.len(),
            malformed_items: deduped.stats.malformed + skipped_entries,
            filtered_items: scoring.filtered,
            over_cap,
            failed_batches: batches.iter().filter(|b| b.is_failed()).count(),
            unrecovered_items: batches
                .iter()
                .filter(|b| !b.is_planned())
                .map(|b| b.missing_ids.len())
                .sum(),
            dropped_records: batches.iter().map(|b| b.dropped).sum(),
            deadline_hit: fetched.report.cancelled > 0 || batches.iter().any(|b| b.cancelled),
        };
        let status = if gaps.has_data_loss() {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        };
        let finished_at = Utc::now();
        gauge!("pipeline_last_run_ts").set(finished_at.timestamp() as f64);

        tracing::info!(
            target: "pipeline",
            ?status,
            canonical = items.len(),
            filtered = gaps.filtered_items,
            batches = batches.len(),
            classified = merged,
            ranked = ranked.len(),
            unrecovered = gaps.unrecovered_items,
            failed_sources = gaps.failed_sources,
            "run finished"
        );

        Ok(RunOutput {
            report: RunReport {
                started_at: now,
                finished_at,
                dry_run: params.dry_run,
                mode: params.mode,
                status,
                degraded_sources: fetched.report.is_degraded(),
                fetch: fetched.report,
                dedup: deduped.stats,
                scoring,
                batches,
                gaps,
                errors,
                ranked,
                trend,
            },
            items,
        })
    }
}
