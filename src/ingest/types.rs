// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{normalize_url, normalize_text, stable_hash};

/// Immutable description of a feed endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    /// Editorial reliability hint in [0,1], feeds the local score.
    #[serde(default)]
    pub reliability: f32,
}

impl Source {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            reliability: 0.0,
        }
    }

    pub fn with_reliability(mut self, r: f32) -> Self {
        self.reliability = r.clamp(0.0, 1.0);
        self
    }
}

/// Mutable health of one source. Only the fetcher writes it, one source at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub active: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub backoff_until: Option<DateTime<Utc>>,
    /// Exponential moving average of successful fetch latency.
    pub avg_latency_ms: Option<f64>,
}

impl Default for SourceHealth {
    fn default() -> Self {
        Self {
            active: true,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            backoff_until: None,
            avg_latency_ms: None,
        }
    }
}

impl SourceHealth {
    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|t| t > now)
    }
}

/// One fetched entry before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Stable per-source identity (guid, else url, else title).
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    /// Hash of the normalized body; absent when the body is empty.
    pub content_hash: Option<String>,
    /// Hash of the normalized URL; absent when the entry had no link.
    pub url_hash: Option<String>,
}

impl RawItem {
    /// Build an item from raw feed fields, normalizing text and deriving hashes.
    pub fn new(
        source_id: &str,
        guid: Option<&str>,
        title: &str,
        body: &str,
        url: Option<&str>,
        published_at: Option<DateTime<Utc>>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let title = normalize_text(title);
        let body = normalize_text(body);
        let url = url.map(str::trim).filter(|u| !u.is_empty()).map(String::from);

        let identity = guid
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(String::from)
            .or_else(|| url.clone())
            .unwrap_or_else(|| title.to_lowercase());
        let id = stable_hash(&format!("{source_id}|{identity}"));

        let content_hash = (!body.is_empty()).then(|| stable_hash(&body.to_lowercase()));
        let url_hash = url.as_deref().map(|u| stable_hash(&normalize_url(u)));

        Self {
            id,
            source_id: source_id.to_string(),
            title,
            body,
            url,
            published_at,
            fetched_at,
            content_hash,
            url_hash,
        }
    }

    /// Published time when present, otherwise fetch time.
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.fetched_at)
    }
}
