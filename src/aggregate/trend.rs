// src/aggregate/trend.rs
//! Trend momentum from per-item stances inside a time window.
//!
//! clarity    = |supporting - opposing| / total
//! direction  = neutral below `min_evidence` or when clarity <= `dead_zone`,
//!              otherwise the sign of supporting - opposing
//! strength   = strong / moderate when both clarity and volume clear the band,
//!              weak otherwise (and always weak for a neutral direction)
//! confidence = clarity_weight * clarity
//!            + volume_weight * min(1, total / volume_saturation)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Stance;
use crate::dedup::CanonicalItem;
use crate::error::ConfigError;

fn default_dead_zone() -> f64 {
    0.1
}
fn default_min_evidence() -> usize {
    5
}
fn default_moderate_clarity() -> f64 {
    0.3
}
fn default_strong_clarity() -> f64 {
    0.5
}
fn default_moderate_volume() -> usize {
    5
}
fn default_strong_volume() -> usize {
    10
}
fn default_volume_saturation() -> usize {
    10
}
fn default_evidence_samples() -> usize {
    2
}
fn default_clarity_weight() -> f64 {
    0.7
}
fn default_volume_weight() -> f64 {
    0.3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendThresholds {
    #[serde(default = "default_dead_zone")]
    pub dead_zone: f64,
    #[serde(default = "default_min_evidence")]
    pub min_evidence: usize,
    #[serde(default = "default_moderate_clarity")]
    pub moderate_clarity: f64,
    #[serde(default = "default_strong_clarity")]
    pub strong_clarity: f64,
    #[serde(default = "default_moderate_volume")]
    pub moderate_volume: usize,
    #[serde(default = "default_strong_volume")]
    pub strong_volume: usize,
    #[serde(default = "default_volume_saturation")]
    pub volume_saturation: usize,
    /// Evidence ids kept per side (supporting / opposing).
    #[serde(default = "default_evidence_samples")]
    pub evidence_samples: usize,
    #[serde(default = "default_clarity_weight")]
    pub clarity_weight: f64,
    #[serde(default = "default_volume_weight")]
    pub volume_weight: f64,
}

impl Default for TrendThresholds {
    fn default() -> Self {
        Self {
            dead_zone: default_dead_zone(),
            min_evidence: default_min_evidence(),
            moderate_clarity: default_moderate_clarity(),
            strong_clarity: default_strong_clarity(),
            moderate_volume: default_moderate_volume(),
            strong_volume: default_strong_volume(),
            volume_saturation: default_volume_saturation(),
            evidence_samples: default_evidence_samples(),
            clarity_weight: default_clarity_weight(),
            volume_weight: default_volume_weight(),
        }
    }
}

impl TrendThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |v: f64| (0.0..=1.0).contains(&v);
        if !unit(self.dead_zone) || !unit(self.moderate_clarity) || !unit(self.strong_clarity) {
            return Err(ConfigError::invalid("trend clarity thresholds must be within [0,1]"));
        }
        if self.moderate_clarity > self.strong_clarity {
            return Err(ConfigError::invalid("trends.moderate_clarity exceeds trends.strong_clarity"));
        }
        if self.moderate_volume > self.strong_volume {
            return Err(ConfigError::invalid("trends.moderate_volume exceeds trends.strong_volume"));
        }
        if !(self.clarity_weight >= 0.0 && self.volume_weight >= 0.0)
            || self.clarity_weight + self.volume_weight > 1.0 + 1e-9
        {
            return Err(ConfigError::invalid(
                "trends.clarity_weight and trends.volume_weight must be >= 0 and sum to at most 1",
            ));
        }
        if self.volume_saturation == 0 {
            return Err(ConfigError::invalid("trends.volume_saturation must be > 0"));
        }
        Ok(())
    }
}

/// Half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `span` leading up to (and excluding) `end`. Starts no earlier
    /// than the first representable instant.
    pub fn trailing(end: DateTime<Utc>, span: Duration) -> Self {
        let start = end
            .checked_sub_signed(span)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Gaining,
    Losing,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendStrength {
    Weak,
    Moderate,
    Strong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRecord {
    pub trend_id: String,
    pub window: TimeWindow,
    pub supporting: usize,
    pub opposing: usize,
    pub neutral: usize,
    pub direction: TrendDirection,
    pub strength: TrendStrength,
    pub confidence: f64,
    pub evidence_ids: Vec<String>,
}

impl TrendRecord {
    pub fn total(&self) -> usize {
        self.supporting + self.opposing + self.neutral
    }
}

/// Direction, strength and confidence for raw stance counts.
pub fn classify_counts(
    supporting: usize,
    opposing: usize,
    neutral: usize,
    th: &TrendThresholds,
) -> (TrendDirection, TrendStrength, f64) {
    let total = supporting + opposing + neutral;
    let clarity = if total == 0 {
        0.0
    } else {
        supporting.abs_diff(opposing) as f64 / total as f64
    };

    let direction = if total < th.min_evidence || clarity <= th.dead_zone {
        TrendDirection::Neutral
    } else if supporting > opposing {
        TrendDirection::Gaining
    } else {
        TrendDirection::Losing
    };

    let strength = match direction {
        TrendDirection::Neutral => TrendStrength::Weak,
        _ if clarity >= th.strong_clarity && total >= th.strong_volume => TrendStrength::Strong,
        _ if clarity >= th.moderate_clarity && total >= th.moderate_volume => TrendStrength::Moderate,
        _ => TrendStrength::Weak,
    };

    let volume = (total as f64 / th.volume_saturation.max(1) as f64).min(1.0);
    let confidence = clarity * th.clarity_weight + volume * th.volume_weight;
    (direction, strength, confidence)
}

/// Aggregate the stances of classified, unfiltered items inside `window`.
/// Items without a stance are not counted.
pub fn aggregate_trend(
    trend_id: &str,
    window: TimeWindow,
    items: &[CanonicalItem],
    th: &TrendThresholds,
) -> TrendRecord {
    let mut supporting: Vec<(&CanonicalItem, f32)> = Vec::new();
    let mut opposing: Vec<(&CanonicalItem, f32)> = Vec::new();
    let mut neutral = 0usize;

    for item in items.iter().filter(|i| !i.is_filtered() && window.contains(i.recency())) {
        let Some(rec) = item.classification.as_ref() else {
            continue;
        };
        let conf = rec.confidence.unwrap_or(0.0);
        match rec.stance {
            Some(Stance::Supporting) => supporting.push((item, conf)),
            Some(Stance::Opposing) => opposing.push((item, conf)),
            Some(Stance::Neutral) => neutral += 1,
            None => {}
        }
    }

    let (direction, strength, confidence) =
        classify_counts(supporting.len(), opposing.len(), neutral, th);

    let pick = |mut side: Vec<(&CanonicalItem, f32)>| -> Vec<String> {
        side.sort_by(|(a, ca), (b, cb)| cb.total_cmp(ca).then_with(|| a.id.cmp(&b.id)));
        side.into_iter()
            .take(th.evidence_samples)
            .map(|(i, _)| i.id.clone())
            .collect()
    };
    let (s, o) = (supporting.len(), opposing.len());
    let mut evidence_ids = pick(supporting);
    evidence_ids.extend(pick(opposing));

    tracing::debug!(
        target: "aggregate",
        trend = trend_id,
        supporting = s,
        opposing = o,
        neutral,
        ?direction,
        ?strength,
        confidence,
        "trend aggregated"
    );

    TrendRecord {
        trend_id: trend_id.to_string(),
        window,
        supporting: s,
        opposing: o,
        neutral,
        direction,
        strength,
        confidence,
        evidence_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassificationRecord;
    use std::collections::BTreeSet;

    fn th() -> TrendThresholds {
        TrendThresholds::default()
    }

    fn item(id: &str, stance: Stance, conf: f32, ts: i64) -> CanonicalItem {
        CanonicalItem {
            id: id.into(),
            title: id.into(),
            body: String::new(),
            url: None,
            source_ids: BTreeSet::new(),
            member_ids: BTreeSet::from([id.to_string()]),
            url_hashes: BTreeSet::new(),
            content_hashes: BTreeSet::new(),
            first_seen: DateTime::from_timestamp(ts, 0).unwrap(),
            published_at: None,
            category: None,
            local_score: None,
            classification: Some(ClassificationRecord {
                item_id: id.into(),
                score: None,
                stance: Some(stance),
                confidence: Some(conf),
                reasoning: None,
            }),
            filtered: None,
        }
    }

    #[test]
    fn even_split_is_neutral() {
        let (d, s, _) = classify_counts(10, 10, 0, &th());
        assert_eq!(d, TrendDirection::Neutral);
        assert_eq!(s, TrendStrength::Weak);
    }

    #[test]
    fn clear_majority_is_gaining() {
        let (d, s, c) = classify_counts(15, 5, 0, &th());
        assert_eq!(d, TrendDirection::Gaining);
        assert_eq!(s, TrendStrength::Strong);
        assert!((c - (0.5 * 0.7 + 0.3)).abs() < 1e-9);
        let (d, _, _) = classify_counts(5, 15, 0, &th());
        assert_eq!(d, TrendDirection::Losing);
    }

    #[test]
    fn too_little_evidence_is_neutral() {
        let (d, s, _) = classify_counts(4, 0, 0, &th());
        assert_eq!(d, TrendDirection::Neutral);
        assert_eq!(s, TrendStrength::Weak);
        let (d, _, c) = classify_counts(0, 0, 0, &th());
        assert_eq!(d, TrendDirection::Neutral);
        assert_eq!(c, 0.0);
    }

    #[test]
    fn confidence_grows_with_volume_and_clarity() {
        let (_, _, low) = classify_counts(3, 2, 0, &th());
        let (_, _, more_volume) = classify_counts(6, 4, 0, &th());
        let (_, _, more_clarity) = classify_counts(5, 0, 0, &th());
        assert!(more_volume > low);
        assert!(more_clarity > low);
    }

    #[test]
    fn moderate_band() {
        // clarity 0.4, volume 5
        let (d, s, _) = classify_counts(3, 1, 1, &th());
        assert_eq!(d, TrendDirection::Gaining);
        assert_eq!(s, TrendStrength::Moderate);
    }

    #[test]
    fn aggregates_items_inside_window_only() {
        let window = TimeWindow::new(
            DateTime::from_timestamp(1_000, 0).unwrap(),
            DateTime::from_timestamp(2_000, 0).unwrap(),
        );
        let mut items: Vec<CanonicalItem> = (0..6)
            .map(|i| item(&format!("s{i}"), Stance::Supporting, 0.5 + i as f32 * 0.05, 1_500))
            .collect();
        items.push(item("o1", Stance::Opposing, 0.9, 1_500));
        items.push(item("n1", Stance::Neutral, 0.9, 1_500));
        items.push(item("late", Stance::Opposing, 0.9, 2_000));
        let rec = aggregate_trend("ev-adoption", window, &items, &th());
        assert_eq!((rec.supporting, rec.opposing, rec.neutral), (6, 1, 1));
        assert_eq!(rec.direction, TrendDirection::Gaining);
        assert_eq!(rec.evidence_ids, vec!["s5", "s4", "o1"]);
    }

    #[test]
    fn thresholds_are_validated() {
        assert!(th().validate().is_ok());
        let bad = TrendThresholds {
            moderate_clarity: 0.8,
            strong_clarity: 0.5,
            ..th()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn confidence_weights_come_from_thresholds() {
        let volume_only = TrendThresholds {
            clarity_weight: 0.0,
            volume_weight: 1.0,
            ..th()
        };
        let (_, _, c) = classify_counts(5, 5, 0, &volume_only);
        assert!((c - 1.0).abs() < 1e-9);

        let overweight = TrendThresholds {
            clarity_weight: 0.8,
            volume_weight: 0.3,
            ..th()
        };
        assert!(overweight.validate().is_err());
        let negative = TrendThresholds {
            clarity_weight: -0.1,
            ..th()
        };
        assert!(negative.validate().is_err());
    }
}
