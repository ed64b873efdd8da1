// src/ingest/registry.rs
//! Source registry: immutable endpoint list + per-source health records.
//!
//! The set of sources is fixed while a fetch runs; each entry carries its own
//! lock so concurrent fetch workers never contend on a registry-wide lock.
//! Health survives across runs through `save_health` / `load_health`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::types::{Source, SourceHealth};
use crate::error::ConfigError;

/// Smoothing factor for the latency moving average.
const LATENCY_ALPHA: f64 = 0.3;

/// Circuit-breaker knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerPolicy {
    /// Consecutive failures before the source starts cooling.
    pub threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    /// Consecutive failures before automatic deactivation (0 = never).
    pub deactivate_after: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Duration::from_secs(15 * 60),
            max_cooldown: Duration::from_secs(6 * 3600),
            deactivate_after: 10,
        }
    }
}

impl BreakerPolicy {
    /// Cooling period after `failures` consecutive failures (None below threshold).
    pub fn cooldown_for(&self, failures: u32) -> Option<Duration> {
        if self.threshold == 0 || failures < self.threshold {
            return None;
        }
        let exp = (failures - self.threshold).min(16);
        let d = self.cooldown.saturating_mul(1u32 << exp);
        Some(d.min(self.max_cooldown))
    }
}

/// Why a source will not be fetched right now.
#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Ready,
    Cooling(DateTime<Utc>),
    Inactive,
}

#[derive(Debug)]
pub struct SourceEntry {
    pub source: Source,
    health: Mutex<SourceHealth>,
}

impl SourceEntry {
    fn new(source: Source, health: SourceHealth) -> Self {
        Self {
            source,
            health: Mutex::new(health),
        }
    }

    pub fn health(&self) -> SourceHealth {
        self.health.lock().clone()
    }

    pub fn availability(&self, now: DateTime<Utc>) -> Availability {
        let h = self.health.lock();
        if !h.active {
            Availability::Inactive
        } else if let Some(until) = h.backoff_until.filter(|t| *t > now) {
            Availability::Cooling(until)
        } else {
            Availability::Ready
        }
    }

    pub fn record_success(&self, latency_ms: f64, now: DateTime<Utc>) {
        let mut h = self.health.lock();
        h.consecutive_failures = 0;
        h.backoff_until = None;
        h.last_error = None;
        h.last_success = Some(now);
        h.avg_latency_ms = Some(match h.avg_latency_ms {
            Some(prev) => prev + LATENCY_ALPHA * (latency_ms - prev),
            None => latency_ms,
        });
    }

    /// Returns the updated health so callers can log the transition.
    pub fn record_failure(
        &self,
        error: &str,
        now: DateTime<Utc>,
        policy: &BreakerPolicy,
    ) -> SourceHealth {
        let mut h = self.health.lock();
        h.consecutive_failures = h.consecutive_failures.saturating_add(1);
        h.last_error = Some(error.to_string());
        if let Some(cool) = policy.cooldown_for(h.consecutive_failures) {
            let cool = chrono::Duration::from_std(cool)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
            h.backoff_until = now.checked_add_signed(cool);
        }
        if policy.deactivate_after > 0 && h.consecutive_failures >= policy.deactivate_after {
            h.active = false;
        }
        h.clone()
    }

    fn set_active(&self, active: bool) {
        let mut h = self.health.lock();
        h.active = active;
        if active {
            h.consecutive_failures = 0;
            h.backoff_until = None;
        }
    }
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    entries: BTreeMap<String, Arc<SourceEntry>>,
    policy: BreakerPolicy,
}

#[derive(Serialize, Deserialize)]
struct PersistedHealth {
    sources: BTreeMap<String, SourceHealth>,
}

impl SourceRegistry {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            policy,
        }
    }

    pub fn from_sources(
        sources: impl IntoIterator<Item = Source>,
        policy: BreakerPolicy,
    ) -> Result<Self, ConfigError> {
        let mut reg = Self::new(policy);
        for s in sources {
            reg.register(s)?;
        }
        Ok(reg)
    }

    pub fn register(&mut self, source: Source) -> Result<(), ConfigError> {
        if source.id.trim().is_empty() {
            return Err(ConfigError::invalid("source id must not be empty"));
        }
        if self.entries.contains_key(&source.id) {
            return Err(ConfigError::invalid(format!(
                "duplicate source id `{}`",
                source.id
            )));
        }
        let id = source.id.clone();
        self.entries
            .insert(id, Arc::new(SourceEntry::new(source, SourceHealth::default())));
        Ok(())
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<SourceEntry>> {
        self.entries.get(id).cloned()
    }

    /// Entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &Arc<SourceEntry>> {
        self.entries.values()
    }

    pub fn health(&self, id: &str) -> Option<SourceHealth> {
        self.entries.get(id).map(|e| e.health())
    }

    /// Sources are never removed, only switched off.
    pub fn deactivate(&self, id: &str) -> bool {
        self.entries.get(id).map(|e| e.set_active(false)).is_some()
    }

    pub fn reactivate(&self, id: &str) -> bool {
        self.entries.get(id).map(|e| e.set_active(true)).is_some()
    }

    /// Persist health atomically (temp file + rename).
    pub fn save_health(&self, path: &Path) -> anyhow::Result<()> {
        let state = PersistedHealth {
            sources: self
                .entries
                .iter()
                .map(|(id, e)| (id.clone(), e.health()))
                .collect(),
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(&state)?;
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(json.as_bytes())?;
        fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    /// Restore health for known ids; unknown ids in the file are ignored.
    /// A missing file is not an error.
    pub fn load_health(&self, path: &Path) -> anyhow::Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let state: PersistedHealth = serde_json::from_str(&data)
            .with_context(|| format!("parsing registry health {}", path.display()))?;
        let mut restored = 0;
        for (id, health) in state.sources {
            if let Some(e) = self.entries.get(&id) {
                *e.health.lock() = health;
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            threshold: 2,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(300),
            deactivate_after: 5,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn cooldown_grows_and_caps() {
        let p = policy();
        assert_eq!(p.cooldown_for(1), None);
        assert_eq!(p.cooldown_for(2), Some(Duration::from_secs(60)));
        assert_eq!(p.cooldown_for(3), Some(Duration::from_secs(120)));
        assert_eq!(p.cooldown_for(9), Some(Duration::from_secs(300)));
    }

    #[test]
    fn breaker_opens_after_threshold_and_success_resets() {
        let reg = SourceRegistry::from_sources([Source::new("a", "http://a.test/rss")], policy())
            .unwrap();
        let e = reg.get("a").unwrap();

        e.record_failure("timeout", ts(0), reg.policy());
        assert_eq!(e.availability(ts(1)), Availability::Ready);

        e.record_failure("timeout", ts(10), reg.policy());
        assert_eq!(e.availability(ts(11)), Availability::Cooling(ts(70)));
        assert_eq!(e.availability(ts(71)), Availability::Ready);

        e.record_success(120.0, ts(80));
        let h = e.health();
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.backoff_until, None);
        assert_eq!(h.avg_latency_ms, Some(120.0));
    }

    #[test]
    fn latency_is_smoothed() {
        let reg = SourceRegistry::from_sources([Source::new("a", "http://a.test")], policy())
            .unwrap();
        let e = reg.get("a").unwrap();
        e.record_success(100.0, ts(0));
        e.record_success(200.0, ts(1));
        let avg = e.health().avg_latency_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-9);
    }

    #[test]
    fn repeated_failures_deactivate() {
        let reg = SourceRegistry::from_sources([Source::new("a", "http://a.test")], policy())
            .unwrap();
        let e = reg.get("a").unwrap();
        for i in 0..5 {
            e.record_failure("HTTP 500", ts(i), reg.policy());
        }
        assert_eq!(e.availability(ts(10_000)), Availability::Inactive);
        assert!(reg.reactivate("a"));
        assert_eq!(e.availability(ts(10_000)), Availability::Ready);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = SourceRegistry::from_sources(
            [Source::new("a", "http://a.test"), Source::new("a", "http://b.test")],
            policy(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate source id"));
    }

    #[test]
    fn health_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/registry.json");

        let reg = SourceRegistry::from_sources(
            [Source::new("a", "http://a.test"), Source::new("b", "http://b.test")],
            policy(),
        )
        .unwrap();
        reg.get("a").unwrap().record_failure("HTTP 503", ts(0), reg.policy());
        reg.save_health(&path).unwrap();

        let fresh = SourceRegistry::from_sources(
            [Source::new("a", "http://a.test"), Source::new("b", "http://b.test")],
            policy(),
        )
        .unwrap();
        assert_eq!(fresh.load_health(&path).unwrap(), 2);
        assert_eq!(fresh.health("a").unwrap().consecutive_failures, 1);
        assert_eq!(fresh.health("b").unwrap().consecutive_failures, 0);
    }
}
