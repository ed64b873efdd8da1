// tests/classify_limits.rs
// Concurrency, rate, retry and budget behavior of the batch classifier.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use tokio::time::Instant;

use feed_triage::classify::{
    BatchClassifier, ClassificationService, ClassifyConfig, ClassifyMode, ParseOutcome,
    ServiceError,
};
use feed_triage::dedup::CanonicalItem;
use feed_triage::retry::RetryPolicy;

fn item(id: &str) -> CanonicalItem {
    CanonicalItem {
        id: id.into(),
        title: format!("Item {id}"),
        body: "Body text".into(),
        url: None,
        source_ids: BTreeSet::from(["s".to_string()]),
        member_ids: BTreeSet::from([id.to_string()]),
        url_hashes: BTreeSet::new(),
        content_hashes: BTreeSet::new(),
        first_seen: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        published_at: None,
        category: None,
        local_score: Some(0.5),
        classification: None,
        filtered: None,
    }
}

fn answer(payload: &str) -> String {
    let records: Vec<String> = payload
        .lines()
        .filter_map(|l| l.split_once(". id: ").map(|(_, id)| id.trim().to_string()))
        .map(|id| format!(r#"{{"item_id": "{id}", "priority_score": 0.6}}"#))
        .collect();
    format!("[{}]", records.join(","))
}

/// Tracks how many submissions are in flight at once.
struct Slow {
    in_flight: AtomicU32,
    peak: AtomicU32,
    calls: AtomicU32,
    delay: Duration,
    script: Mutex<VecDeque<Result<String, ServiceError>>>,
}

impl Slow {
    fn new(delay: Duration) -> Self {
        Self::scripted(delay, Vec::new())
    }

    fn scripted(delay: Duration, script: Vec<Result<String, ServiceError>>) -> Self {
        Self {
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            delay,
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl ClassificationService for Slow {
    async fn submit(&self, payload: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(answer(payload)))
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

fn cfg() -> ClassifyConfig {
    ClassifyConfig {
        batch_size: 1,
        max_concurrent_batches: 2,
        requests_per_minute: 60_000,
        burst: 100,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..ClassifyConfig::default()
    }
}

fn ids(n: usize) -> Vec<CanonicalItem> {
    (0..n).map(|i| item(&format!("i{i}"))).collect()
}

#[tokio::test(start_paused = true)]
async fn in_flight_requests_never_exceed_the_limit() {
    let service = Arc::new(Slow::new(Duration::from_millis(200)));
    let classifier = BatchClassifier::new(service.clone(), &cfg()).unwrap();
    let items = ids(6);
    let refs: Vec<&CanonicalItem> = items.iter().collect();

    let batches = classifier.classify(&refs, ClassifyMode::Priority).await;

    assert_eq!(batches.len(), 6);
    assert!(batches.iter().all(|b| b.outcome == Some(ParseOutcome::Exact)));
    assert_eq!(service.calls.load(Ordering::SeqCst), 6);
    let peak = service.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak in flight {peak}");
    assert_eq!(peak, 2);
}

#[tokio::test(start_paused = true)]
async fn token_bucket_paces_requests() {
    let service = Arc::new(Slow::new(Duration::ZERO));
    let config = ClassifyConfig {
        max_concurrent_batches: 5,
        requests_per_minute: 60,
        burst: 2,
        ..cfg()
    };
    let classifier = BatchClassifier::new(service.clone(), &config).unwrap();
    let items = ids(5);
    let refs: Vec<&CanonicalItem> = items.iter().collect();

    let start = Instant::now();
    let batches = classifier.classify(&refs, ClassifyMode::Priority).await;
    let elapsed = start.elapsed();

    assert!(batches.iter().all(|b| !b.is_failed()));
    // two from the burst, then one per second
    assert!(elapsed >= Duration::from_secs(3), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "finished after {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried() {
    let service = Arc::new(Slow::scripted(
        Duration::ZERO,
        vec![Err(ServiceError::Server(503)), Err(ServiceError::RateLimited)],
    ));
    let classifier = BatchClassifier::new(service.clone(), &cfg()).unwrap();
    let items = ids(1);

    let batches = classifier.classify(&[&items[0]], ClassifyMode::Priority).await;

    assert_eq!(batches[0].attempts, 3);
    assert_eq!(batches[0].outcome, Some(ParseOutcome::Exact));
    assert_eq!(batches[0].records.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_request_fails_without_retry() {
    let service = Arc::new(Slow::scripted(Duration::ZERO, vec![Err(ServiceError::Rejected(400))]));
    let classifier = BatchClassifier::new(service.clone(), &cfg()).unwrap();
    let items = ids(1);

    let batches = classifier.classify(&[&items[0]], ClassifyMode::Priority).await;

    let b = &batches[0];
    assert!(b.is_failed());
    assert_eq!(b.attempts, 1);
    assert!(b.records.is_empty());
    assert_eq!(b.missing_ids, vec!["i0".to_string()]);
    assert_eq!(b.error.as_ref().map(|e| e.kind()), Some("classification_exhausted"));
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_reported() {
    let service = Arc::new(Slow::scripted(
        Duration::ZERO,
        vec![Err(ServiceError::Timeout), Err(ServiceError::Timeout), Err(ServiceError::Timeout)],
    ));
    let classifier = BatchClassifier::new(service.clone(), &cfg()).unwrap();
    let items = ids(1);

    let batches = classifier.classify(&[&items[0]], ClassifyMode::Priority).await;

    assert!(batches[0].is_failed());
    assert_eq!(batches[0].attempts, 3);
    assert_eq!(service.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn run_budget_caps_total_requests() {
    let service = Arc::new(Slow::new(Duration::ZERO));
    let config = ClassifyConfig {
        max_requests_per_run: Some(2),
        ..cfg()
    };
    let classifier = BatchClassifier::new(service.clone(), &config).unwrap();
    let items = ids(4);
    let refs: Vec<&CanonicalItem> = items.iter().collect();

    let batches = classifier.classify(&refs, ClassifyMode::Priority).await;

    assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    assert_eq!(batches.iter().filter(|b| b.is_failed()).count(), 2);
    assert_eq!(classifier.remaining_budget(), Some(0));
    for b in batches.iter().filter(|b| b.is_failed()) {
        assert_eq!(b.attempts, 1);
        assert_eq!(b.error.as_ref().map(|e| e.kind()), Some("classification_exhausted"));
    }
}

#[tokio::test(start_paused = true)]
async fn unreadable_response_is_a_recovery_failure() {
    let service = Arc::new(Slow::scripted(
        Duration::ZERO,
        vec![Ok("I cannot help with that.".into())],
    ));
    let classifier = BatchClassifier::new(service, &cfg()).unwrap();
    let items = ids(1);

    let batches = classifier.classify(&[&items[0]], ClassifyMode::Priority).await;

    let b = &batches[0];
    assert_eq!(b.outcome, Some(ParseOutcome::Failed));
    assert!(b.records.is_empty());
    assert_eq!(b.error.as_ref().map(|e| e.kind()), Some("parse_recovery_failure"));
    assert!(b.raw_response.is_some());
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_outstanding_batches() {
    let service = Arc::new(Slow::new(Duration::from_secs(30)));
    let classifier = BatchClassifier::new(service, &cfg())
        .unwrap()
        .with_deadline(Some(Instant::now() + Duration::from_secs(5)));
    let items = ids(2);
    let refs: Vec<&CanonicalItem> = items.iter().collect();

    let batches = classifier.classify(&refs, ClassifyMode::Priority).await;

    assert_eq!(batches.len(), 2);
    for b in &batches {
        assert!(b.is_failed());
        assert!(b.cancelled);
        assert_eq!(b.attempts, 1);
        assert_eq!(b.missing_ids.len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_batch_reports_attempts_already_made() {
    // two transient failures of 1s each, then a third request still in flight
    let service = Arc::new(Slow::scripted(
        Duration::from_secs(1),
        vec![
            Err(ServiceError::Server(503)),
            Err(ServiceError::Server(503)),
        ],
    ));
    let classifier = BatchClassifier::new(service.clone(), &cfg())
        .unwrap()
        .with_deadline(Some(Instant::now() + Duration::from_millis(2_500)));
    let items = ids(1);

    let batches = classifier.classify(&[&items[0]], ClassifyMode::Priority).await;

    let b = &batches[0];
    assert!(b.cancelled);
    assert!(b.is_failed());
    assert_eq!(b.attempts, 3);
    assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    match &b.error {
        Some(feed_triage::StageError::ClassificationExhausted { attempts, .. }) => {
            assert_eq!(*attempts, 3)
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_batches_are_not_marked_cancelled() {
    let service = Arc::new(Slow::scripted(
        Duration::from_millis(10),
        vec![Err(ServiceError::Rejected(400))],
    ));
    let classifier = BatchClassifier::new(service, &cfg())
        .unwrap()
        .with_deadline(Some(Instant::now() + Duration::from_secs(60)));
    let items = ids(1);

    let batches = classifier.classify(&[&items[0]], ClassifyMode::Priority).await;

    assert!(batches[0].is_failed());
    assert!(!batches[0].cancelled);
    assert_eq!(batches[0].attempts, 1);
}
