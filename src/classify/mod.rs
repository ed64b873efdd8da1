// src/classify/mod.rs
//! Remote classification of candidate items in bounded batches.
//!
//! Two independent limits apply to every request: a token bucket for the
//! request rate and a semaphore for requests in flight. Both are taken per
//! attempt, so a batch sleeping in backoff holds neither. A batch that runs out
//! of attempts is reported as failed and contributes no records.

pub mod limiter;
pub mod recovery;
pub mod service;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::dedup::CanonicalItem;
use crate::error::{ConfigError, StageError};
use crate::retry::{retry, RetryPolicy};
pub use limiter::TokenBucket;
pub use recovery::{parse, ExpectedSchema, ParseOutcome, ParseResult, RecoveryLayer};
pub use service::{
    AnthropicService, ClassificationService, PayloadFormatter, PlainListing, ServiceConfig,
    ServiceError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Supporting,
    Opposing,
    Neutral,
}

/// What the service said about one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub item_id: String,
    /// Priority in [0,1] (priority mode).
    pub score: Option<f32>,
    pub stance: Option<Stance>,
    pub confidence: Option<f32>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyMode {
    #[default]
    Priority,
    Stance,
}

fn default_batch_size() -> usize {
    10
}
fn default_max_concurrent_batches() -> usize {
    2
}
fn default_requests_per_minute() -> u32 {
    50
}
fn default_burst() -> u32 {
    5
}
fn default_candidate_cap() -> usize {
    50
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_body_chars() -> usize {
    400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_candidate_cap")]
    pub candidate_cap: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub mode: ClassifyMode,
    /// Total service requests allowed per run, retries included.
    #[serde(default)]
    pub max_requests_per_run: Option<u32>,
    #[serde(default = "default_body_chars")]
    pub body_chars: usize,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            candidate_cap: default_candidate_cap(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryPolicy::default(),
            mode: ClassifyMode::default(),
            max_requests_per_run: None,
            body_chars: default_body_chars(),
        }
    }
}

impl ClassifyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("classify.batch_size must be > 0"));
        }
        if self.max_concurrent_batches == 0 {
            return Err(ConfigError::invalid("classify.max_concurrent_batches must be > 0"));
        }
        if self.requests_per_minute == 0 || self.burst == 0 {
            return Err(ConfigError::invalid(
                "classify.requests_per_minute and classify.burst must be > 0",
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("classify.request_timeout_secs must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("classify.retry.max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// One group of items sent in a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationBatch {
    pub id: String,
    pub item_ids: Vec<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    /// None while the batch is only planned (dry run).
    pub outcome: Option<ParseOutcome>,
    pub records: Vec<ClassificationRecord>,
    pub dropped: usize,
    pub missing_ids: Vec<String>,
    pub error: Option<StageError>,
    /// Stopped by the run deadline rather than by its own failures.
    pub cancelled: bool,
}

impl ClassificationBatch {
    fn planned(index: usize, item_ids: Vec<String>) -> Self {
        Self {
            id: format!("batch-{:03}", index + 1),
            item_ids,
            submitted_at: None,
            attempts: 0,
            raw_response: None,
            outcome: None,
            records: Vec::new(),
            dropped: 0,
            missing_ids: Vec::new(),
            error: None,
            cancelled: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Some(ParseOutcome::Failed))
    }

    pub fn is_planned(&self) -> bool {
        self.outcome.is_none()
    }

    fn fail(mut self, error: StageError) -> Self {
        self.missing_ids = self.item_ids.clone();
        self.records.clear();
        self.outcome = Some(ParseOutcome::Failed);
        self.error = Some(error);
        self
    }
}

/// Unfiltered items ranked by local score (then id), capped. Returns the
/// candidates and how many eligible items fell beyond the cap.
pub fn select_candidates(items: &[CanonicalItem], cap: usize) -> (Vec<&CanonicalItem>, usize) {
    let mut eligible: Vec<&CanonicalItem> = items.iter().filter(|i| !i.is_filtered()).collect();
    eligible.sort_by(|a, b| {
        b.local_score
            .unwrap_or(0.0)
            .total_cmp(&a.local_score.unwrap_or(0.0))
            .then_with(|| a.id.cmp(&b.id))
    });
    let over_cap = eligible.len().saturating_sub(cap);
    eligible.truncate(cap);
    (eligible, over_cap)
}

/// Split candidates into fixed-size batches in candidate order.
pub fn plan_batches(candidates: &[&CanonicalItem], batch_size: usize) -> Vec<ClassificationBatch> {
    candidates
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| ClassificationBatch::planned(i, chunk.iter().map(|c| c.id.clone()).collect()))
        .collect()
}

/// Copy parsed records onto their items. Returns how many items were updated.
pub fn merge_results(items: &mut [CanonicalItem], batches: &[ClassificationBatch]) -> usize {
    let by_id: HashMap<&str, &ClassificationRecord> = batches
        .iter()
        .filter(|b| !b.is_failed())
        .flat_map(|b| b.records.iter())
        .map(|r| (r.item_id.as_str(), r))
        .collect();
    let mut merged = 0;
    for item in items.iter_mut() {
        if let Some(rec) = by_id.get(item.id.as_str()) {
            item.classification = Some((*rec).clone());
            merged += 1;
        }
    }
    merged
}

#[derive(Debug, Clone, Error)]
enum AttemptError {
    #[error("request budget for this run is spent")]
    Budget,
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Budget => false,
            AttemptError::Service(e) => e.is_retryable(),
        }
    }
}

struct Shared {
    service: Arc<dyn ClassificationService>,
    limiter: TokenBucket,
    slots: Semaphore,
    budget: Option<AtomicU32>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl Shared {
    fn take_budget(&self) -> bool {
        match &self.budget {
            None => true,
            Some(left) => left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    async fn submit_once(&self, payload: &str) -> Result<String, AttemptError> {
        if !self.take_budget() {
            return Err(AttemptError::Budget);
        }
        self.limiter.acquire().await;
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| ServiceError::Transport("request slots closed".into()))?;
        counter!("classify_requests_total").increment(1);
        match tokio::time::timeout(self.request_timeout, self.service.submit(payload)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ServiceError::Timeout.into()),
        }
    }
}

/// Submits batches under the rate and concurrency limits.
pub struct BatchClassifier {
    shared: Arc<Shared>,
    formatter: Arc<dyn PayloadFormatter>,
    batch_size: usize,
    deadline: Option<Instant>,
}

impl BatchClassifier {
    pub fn new(service: Arc<dyn ClassificationService>, cfg: &ClassifyConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                service,
                limiter: TokenBucket::new(cfg.burst, cfg.requests_per_minute),
                slots: Semaphore::new(cfg.max_concurrent_batches),
                budget: cfg.max_requests_per_run.map(AtomicU32::new),
                retry: cfg.retry.clone(),
                request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            }),
            formatter: Arc::new(PlainListing {
                body_chars: cfg.body_chars,
                trend: None,
            }),
            batch_size: cfg.batch_size,
            deadline: None,
        })
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn PayloadFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Batches still running at `deadline` are cancelled and reported failed.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Requests left in this run's budget, if one is set.
    pub fn remaining_budget(&self) -> Option<u32> {
        self.shared.budget.as_ref().map(|b| b.load(Ordering::SeqCst))
    }

    /// Submit `candidates` in batches; results come back in batch order.
    pub async fn classify(&self, candidates: &[&CanonicalItem], mode: ClassifyMode) -> Vec<ClassificationBatch> {
        crate::metrics::ensure_metrics_described();
        let planned = plan_batches(candidates, self.batch_size);
        let by_id: HashMap<&str, &CanonicalItem> = candidates.iter().map(|c| (c.id.as_str(), *c)).collect();

        let mut tasks = JoinSet::new();
        for (index, batch) in planned.into_iter().enumerate() {
            let members: Vec<&CanonicalItem> = batch
                .item_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            let payload = self.formatter.format(&members, mode);
            let shared = Arc::clone(&self.shared);
            let deadline = self.deadline;
            tasks.spawn(async move {
                let batch_id = batch.id.clone();
                let started = Arc::new(AtomicU32::new(0));
                let work = run_batch(shared, batch.clone(), payload, mode, Arc::clone(&started));
                let done = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, work).await {
                        Ok(done) => done,
                        Err(_) => {
                            let attempts = started.load(Ordering::SeqCst);
                            tracing::warn!(target: "classify", batch = %batch_id, attempts, "deadline reached, batch cancelled");
                            counter!("classify_batches_total", "outcome" => "cancelled").increment(1);
                            let mut batch = batch.fail(StageError::ClassificationExhausted {
                                batch_id,
                                attempts,
                                last_error: "run deadline reached".into(),
                            });
                            batch.attempts = attempts;
                            batch.cancelled = true;
                            batch
                        }
                    },
                    None => work.await,
                };
                (index, done)
            });
        }

        let mut results: Vec<(usize, ClassificationBatch)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => results.push(done),
                Err(e) => tracing::error!(target: "classify", error = %e, "batch task aborted"),
            }
        }
        results.sort_by_key(|(i, _)| *i);
        let batches: Vec<ClassificationBatch> = results.into_iter().map(|(_, b)| b).collect();

        let failed = batches.iter().filter(|b| b.is_failed()).count();
        tracing::info!(
            target: "classify",
            batches = batches.len(),
            failed,
            records = batches.iter().map(|b| b.records.len()).sum::<usize>(),
            "classification finished"
        );
        batches
    }
}

async fn run_batch(
    shared: Arc<Shared>,
    mut batch: ClassificationBatch,
    payload: String,
    mode: ClassifyMode,
    started: Arc<AtomicU32>,
) -> ClassificationBatch {
    batch.submitted_at = Some(Utc::now());
    let policy = shared.retry.clone();
    let result = retry(&policy, AttemptError::is_retryable, |attempt| {
        let shared = Arc::clone(&shared);
        let payload = payload.clone();
        let batch_id = batch.id.clone();
        started.store(attempt, Ordering::SeqCst);
        async move {
            let res = shared.submit_once(&payload).await;
            if let Err(e) = &res {
                tracing::warn!(target: "classify", batch = %batch_id, attempt, error = %e, "batch attempt failed");
            }
            res
        }
    })
    .await;

    match result {
        Ok((raw, attempts)) => {
            batch.attempts = attempts;
            let schema = ExpectedSchema::new(mode, batch.item_ids.clone());
            let parsed = parse(&raw, &schema);
            batch.raw_response = Some(raw);
            batch.dropped = parsed.dropped;
            batch.missing_ids = parsed.missing_ids;
            batch.records = parsed.records;
            if parsed.outcome.is_failed() {
                batch.error = Some(StageError::ParseRecoveryFailure {
                    batch_id: batch.id.clone(),
                });
            }
            counter!("classify_batches_total", "outcome" => parsed.outcome.label()).increment(1);
            batch.outcome = Some(parsed.outcome);
            batch
        }
        Err(err) => {
            counter!("classify_batches_total", "outcome" => "exhausted").increment(1);
            let batch_id = batch.id.clone();
            batch.attempts = err.attempts;
            batch.fail(StageError::ClassificationExhausted {
                batch_id,
                attempts: err.attempts,
                last_error: err.last.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, VecDeque};

    fn item(id: &str, local: f32) -> CanonicalItem {
        CanonicalItem {
            id: id.into(),
            title: format!("title {id}"),
            body: String::new(),
            url: None,
            source_ids: BTreeSet::new(),
            member_ids: BTreeSet::from([id.to_string()]),
            url_hashes: BTreeSet::new(),
            content_hashes: BTreeSet::new(),
            first_seen: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            published_at: None,
            category: None,
            local_score: Some(local),
            classification: None,
            filtered: None,
        }
    }

    /// Replays scripted responses; echoes a full answer once the script runs out.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, ServiceError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, ServiceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ClassificationService for Scripted {
        async fn submit(&self, payload: &str) -> Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.script.lock().pop_front() {
                return next;
            }
            let records: Vec<String> = payload
                .lines()
                .filter_map(|l| l.trim().split_once("id: ").map(|(_, id)| id.to_string()))
                .map(|id| format!(r#"{{"item_id": "{id}", "priority_score": 0.5}}"#))
                .collect();
            Ok(format!("[{}]", records.join(",")))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn cfg() -> ClassifyConfig {
        ClassifyConfig {
            batch_size: 2,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
                multiplier: 2.0,
                jitter: 0.0,
            },
            requests_per_minute: 6_000,
            burst: 10,
            ..ClassifyConfig::default()
        }
    }

    #[test]
    fn candidates_rank_by_local_score_and_cap() {
        let mut items = vec![item("c", 0.2), item("a", 0.9), item("b", 0.9), item("d", 0.7)];
        items[3].filtered = Some(crate::analyze::FilterReason::InsufficientSignal { hits: 0 });
        let (picked, over) = select_candidates(&items, 2);
        let ids: Vec<&str> = picked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(over, 1);
    }

    #[test]
    fn batches_are_fixed_size() {
        let items: Vec<CanonicalItem> = (0..5).map(|i| item(&format!("i{i}"), 0.5)).collect();
        let refs: Vec<&CanonicalItem> = items.iter().collect();
        let batches = plan_batches(&refs, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].item_ids, vec!["i4".to_string()]);
        assert_eq!(batches[0].id, "batch-001");
        assert!(batches.iter().all(|b| b.is_planned()));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let svc = Arc::new(Scripted::new(vec![
            Err(ServiceError::Server(503)),
            Err(ServiceError::RateLimited),
        ]));
        let classifier = BatchClassifier::new(svc.clone(), &ClassifyConfig { batch_size: 5, ..cfg() }).unwrap();
        let items = vec![item("a", 0.9), item("b", 0.8)];
        let refs: Vec<&CanonicalItem> = items.iter().collect();
        let batches = classifier.classify(&refs, ClassifyMode::Priority).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].attempts, 3);
        assert_eq!(batches[0].outcome, Some(ParseOutcome::Exact));
        assert_eq!(batches[0].records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_batch_fails_alone() {
        let svc = Arc::new(Scripted::new(vec![
            Err(ServiceError::Rejected(400)),
        ]));
        let classifier = BatchClassifier::new(
            svc.clone(),
            &ClassifyConfig {
                max_concurrent_batches: 1,
                ..cfg()
            },
        )
        .unwrap();
        let items = vec![item("a", 0.9), item("b", 0.8), item("c", 0.7), item("d", 0.6)];
        let refs: Vec<&CanonicalItem> = items.iter().collect();
        let batches = classifier.classify(&refs, ClassifyMode::Priority).await;
        assert_eq!(batches.len(), 2);
        let failed: Vec<_> = batches.iter().filter(|b| b.is_failed()).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].records.is_empty());
        assert_eq!(failed[0].missing_ids.len(), 2);
        assert!(matches!(
            failed[0].error,
            Some(StageError::ClassificationExhausted { attempts: 1, .. })
        ));
        let ok = batches.iter().find(|b| !b.is_failed()).unwrap();
        assert_eq!(ok.records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn request_budget_is_enforced() {
        let svc = Arc::new(Scripted::new(vec![]));
        let classifier = BatchClassifier::new(
            svc.clone(),
            &ClassifyConfig {
                max_requests_per_run: Some(1),
                max_concurrent_batches: 1,
                ..cfg()
            },
        )
        .unwrap();
        let items = vec![item("a", 0.9), item("b", 0.8), item("c", 0.7)];
        let refs: Vec<&CanonicalItem> = items.iter().collect();
        let batches = classifier.classify(&refs, ClassifyMode::Priority).await;
        assert_eq!(svc.calls.load(Ordering::SeqCst), 1);
        assert_eq!(batches.iter().filter(|b| b.is_failed()).count(), 1);
        assert_eq!(classifier.remaining_budget(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_response_is_a_gap() {
        let svc = Arc::new(Scripted::new(vec![Ok("I cannot help with that.".into())]));
        let classifier = BatchClassifier::new(svc, &ClassifyConfig { batch_size: 5, ..cfg() }).unwrap();
        let items = vec![item("a", 0.9)];
        let refs: Vec<&CanonicalItem> = items.iter().collect();
        let batches = classifier.classify(&refs, ClassifyMode::Priority).await;
        assert!(batches[0].is_failed());
        assert_eq!(
            batches[0].error,
            Some(StageError::ParseRecoveryFailure {
                batch_id: "batch-001".into()
            })
        );
        let mut items = items;
        assert_eq!(merge_results(&mut items, &batches), 0);
        assert!(items[0].classification.is_none());
    }

    #[test]
    fn merge_sets_classification() {
        let mut items = vec![item("a", 0.9), item("b", 0.1)];
        let mut batch = ClassificationBatch::planned(0, vec!["a".into(), "b".into()]);
        batch.outcome = Some(ParseOutcome::Partial {
            layer: None,
            missing: 1,
        });
        batch.records.push(ClassificationRecord {
            item_id: "a".into(),
            score: Some(0.7),
            stance: None,
            confidence: None,
            reasoning: None,
        });
        assert_eq!(merge_results(&mut items, &[batch]), 1);
        assert_eq!(items[0].remote_score(), Some(0.7));
        assert_eq!(items[1].remote_score(), None);
    }
}
