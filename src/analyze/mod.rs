// src/analyze/mod.rs
//! Local scorer: keyword categorization, exclusion rules and a bounded score.
//!
//! Scoring is a pure function of the item, the static configuration and the
//! run clock passed in by the caller. Missing signal is reported as its own
//! filter reason; it is never guessed.

pub mod rules;
pub mod scoring;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::dedup::CanonicalItem;
use crate::error::ConfigError;
pub use rules::{CompiledRule, ExclusionRule, When};
pub use scoring::{local_score, recency_decay, ScoreInputs, Weights};

fn default_min_signal() -> u32 {
    2
}
fn default_saturation_hits() -> u32 {
    6
}
fn default_half_life_hours() -> f64 {
    24.0
}
fn default_category_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub id: String,
    pub keywords: Vec<String>,
    /// Category importance in [0,1].
    #[serde(default = "default_category_weight")]
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub categories: Vec<CategoryRule>,
    #[serde(default)]
    pub exclusions: Vec<ExclusionRule>,
    /// Weighted keyword hits (title x2, body x1) the best category needs.
    #[serde(default = "default_min_signal")]
    pub min_signal: u32,
    /// Weighted hits at which keyword strength saturates to 1.0.
    #[serde(default = "default_saturation_hits")]
    pub saturation_hits: u32,
    #[serde(default = "default_half_life_hours")]
    pub recency_half_life_hours: f64,
    #[serde(default)]
    pub weights: Weights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            exclusions: Vec::new(),
            min_signal: default_min_signal(),
            saturation_hits: default_saturation_hits(),
            recency_half_life_hours: default_half_life_hours(),
            weights: Weights::default(),
        }
    }
}

/// Why an item is kept out of remote classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterReason {
    Excluded { rule: String },
    InsufficientSignal { hits: u32 },
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterReason::Excluded { rule } => write!(f, "excluded:{rule}"),
            FilterReason::InsufficientSignal { .. } => f.write_str("insufficient_signal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub category: Option<String>,
    pub local_score: f32,
    pub filtered: bool,
    pub reason: Option<FilterReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoringSummary {
    pub scored: usize,
    pub filtered: usize,
    pub by_reason: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
struct CompiledCategory {
    id: String,
    keywords: Vec<String>,
    weight: f32,
}

#[derive(Debug, Clone)]
pub struct LocalScorer {
    categories: Vec<CompiledCategory>,
    exclusions: Vec<CompiledRule>,
    reliability: HashMap<String, f32>,
    min_signal: u32,
    saturation_hits: u32,
    half_life_hours: f64,
    weights: Weights,
}

impl LocalScorer {
    /// `reliability` maps source id to its editorial reliability in [0,1].
    pub fn new(cfg: &ScoringConfig, reliability: HashMap<String, f32>) -> Result<Self, ConfigError> {
        if cfg.categories.is_empty() {
            return Err(ConfigError::invalid("scoring needs at least one category"));
        }
        if !cfg.weights.is_valid() {
            return Err(ConfigError::invalid(
                "scoring weights must be non-negative with a positive sum",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        let mut categories = Vec::with_capacity(cfg.categories.len());
        for c in &cfg.categories {
            if !seen.insert(c.id.as_str()) {
                return Err(ConfigError::invalid(format!("duplicate category `{}`", c.id)));
            }
            if !(0.0..=1.0).contains(&c.weight) {
                return Err(ConfigError::invalid(format!(
                    "category `{}` weight must be within [0,1]",
                    c.id
                )));
            }
            let keywords: Vec<String> = c
                .keywords
                .iter()
                .map(|k| rules::normalize(k))
                .filter(|k| !k.is_empty())
                .collect();
            if keywords.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "category `{}` has no keywords",
                    c.id
                )));
            }
            categories.push(CompiledCategory {
                id: c.id.clone(),
                keywords,
                weight: c.weight,
            });
        }
        let exclusions = cfg
            .exclusions
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            categories,
            exclusions,
            reliability,
            min_signal: cfg.min_signal,
            saturation_hits: cfg.saturation_hits.max(1),
            half_life_hours: cfg.recency_half_life_hours,
            weights: cfg.weights,
        })
    }

    pub fn category_ids(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.id.as_str())
    }

    /// Categorize and score one item.
    pub fn score(&self, item: &CanonicalItem, now: DateTime<Utc>) -> ScoreOutcome {
        let title = rules::normalize(&item.title);
        let body = rules::normalize(&item.body);

        // Best category by weighted hits; earlier categories win ties.
        let mut best: Option<(&CompiledCategory, u32)> = None;
        for cat in &self.categories {
            let hits: u32 = cat
                .keywords
                .iter()
                .map(|k| {
                    2 * u32::from(rules::contains(&title, k)) + u32::from(rules::contains(&body, k))
                })
                .sum();
            if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
                best = Some((cat, hits));
            }
        }
        let hits = best.map_or(0, |(_, h)| h);

        let age_hours = (now - item.recency()).num_seconds() as f64 / 3600.0;
        let source = item
            .source_ids
            .iter()
            .filter_map(|s| self.reliability.get(s))
            .fold(0.0f32, |acc, r| acc.max(*r));
        let inputs = ScoreInputs::new(
            hits as f32 / self.saturation_hits as f32,
            recency_decay(age_hours, self.half_life_hours),
            best.map_or(0.0, |(c, _)| c.weight),
            source,
        );
        let score = local_score(&inputs, &self.weights);

        let reason = if let Some(rule) = rules::first_match(&self.exclusions, &item.title, &item.body) {
            Some(FilterReason::Excluded {
                rule: rule.name.clone(),
            })
        } else if hits < self.min_signal {
            Some(FilterReason::InsufficientSignal { hits })
        } else {
            None
        };

        ScoreOutcome {
            category: best.map(|(c, _)| c.id.clone()),
            local_score: score,
            filtered: reason.is_some(),
            reason,
        }
    }

    /// Score every item in place and summarize.
    pub fn apply(&self, items: &mut [CanonicalItem], now: DateTime<Utc>) -> ScoringSummary {
        let mut summary = ScoringSummary::default();
        for item in items.iter_mut() {
            let out = self.score(item, now);
            if let Some(c) = &out.category {
                *summary.by_category.entry(c.clone()).or_default() += 1;
            }
            if let Some(r) = &out.reason {
                let label = r.to_string();
                tracing::debug!(target: "scorer", item = %item.id, reason = %label, "item filtered");
                counter!("scorer_filtered_total", "reason" => label.clone()).increment(1);
                *summary.by_reason.entry(label).or_default() += 1;
                summary.filtered += 1;
            }
            item.category = out.category;
            item.local_score = Some(out.local_score);
            item.filtered = out.reason;
            summary.scored += 1;
        }
        tracing::info!(
            target: "scorer",
            scored = summary.scored,
            filtered = summary.filtered,
            "local scoring finished"
        );
        summary
    }
}
