// src/aggregate/mod.rs
//! Final ranking of classified items.

pub mod trend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::CanonicalItem;
pub use trend::{aggregate_trend, TimeWindow, TrendDirection, TrendRecord, TrendStrength, TrendThresholds};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub rank: usize,
    pub item_id: String,
    pub title: String,
    pub url: Option<String>,
    pub category: Option<String>,
    pub remote_score: f32,
    pub local_score: f32,
    pub recency: DateTime<Utc>,
    pub reasoning: Option<String>,
}

/// Rank items that carry a remote score.
///
/// Order: remote score desc, local score desc, recency desc, canonical id asc.
/// Unclassified and filtered items never appear.
pub fn select_top(items: &[CanonicalItem], limit: Option<usize>) -> Vec<RankedItem> {
    let mut ranked: Vec<(&CanonicalItem, f32)> = items
        .iter()
        .filter(|i| !i.is_filtered())
        .filter_map(|i| i.remote_score().map(|s| (i, s)))
        .collect();

    ranked.sort_by(|(a, sa), (b, sb)| {
        sb.total_cmp(sa)
            .then_with(|| {
                b.local_score
                    .unwrap_or(0.0)
                    .total_cmp(&a.local_score.unwrap_or(0.0))
            })
            .then_with(|| b.recency().cmp(&a.recency()))
            .then_with(|| a.id.cmp(&b.id))
    });
    if let Some(n) = limit {
        ranked.truncate(n);
    }

    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (item, score))| RankedItem {
            rank: i + 1,
            item_id: item.id.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
            category: item.category.clone(),
            remote_score: score,
            local_score: item.local_score.unwrap_or(0.0),
            recency: item.recency(),
            reasoning: item.classification.as_ref().and_then(|c| c.reasoning.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassificationRecord;
    use std::collections::BTreeSet;

    fn item(id: &str, remote: Option<f32>, local: f32, ts: i64) -> CanonicalItem {
        CanonicalItem {
            id: id.into(),
            title: id.to_uppercase(),
            body: String::new(),
            url: None,
            source_ids: BTreeSet::new(),
            member_ids: BTreeSet::from([id.to_string()]),
            url_hashes: BTreeSet::new(),
            content_hashes: BTreeSet::new(),
            first_seen: DateTime::from_timestamp(ts, 0).unwrap(),
            published_at: None,
            category: None,
            local_score: Some(local),
            classification: remote.map(|s| ClassificationRecord {
                item_id: id.into(),
                score: Some(s),
                stance: None,
                confidence: None,
                reasoning: None,
            }),
            filtered: None,
        }
    }

    fn ids(r: &[RankedItem]) -> Vec<&str> {
        r.iter().map(|i| i.item_id.as_str()).collect()
    }

    #[test]
    fn full_tie_break_chain() {
        let items = vec![
            item("e", Some(0.5), 0.5, 100),
            item("d", Some(0.5), 0.5, 100),
            item("c", Some(0.5), 0.5, 200),
            item("b", Some(0.5), 0.9, 100),
            item("a", Some(0.9), 0.1, 100),
            item("z", None, 1.0, 900),
        ];
        let ranked = select_top(&items, None);
        assert_eq!(ids(&ranked), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[4].rank, 5);
    }

    #[test]
    fn order_does_not_depend_on_input_order() {
        let mut items = vec![
            item("x", Some(0.3), 0.2, 10),
            item("y", Some(0.3), 0.2, 10),
            item("w", Some(0.8), 0.2, 10),
        ];
        let first = select_top(&items, None);
        items.reverse();
        assert_eq!(first, select_top(&items, None));
    }

    #[test]
    fn limit_and_filtered_items() {
        let mut items = vec![item("a", Some(0.9), 0.1, 1), item("b", Some(0.8), 0.1, 1)];
        items[0].filtered = Some(crate::analyze::FilterReason::Excluded { rule: "x".into() });
        let ranked = select_top(&items, Some(5));
        assert_eq!(ids(&ranked), vec!["b"]);
        assert!(select_top(&items, Some(0)).is_empty());
    }
}
