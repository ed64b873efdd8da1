// tests/trend_boundaries.rs
// Direction / strength band edges and window membership for trend records.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use feed_triage::aggregate::trend::classify_counts;
use feed_triage::aggregate::{
    aggregate_trend, TimeWindow, TrendDirection, TrendStrength, TrendThresholds,
};
use feed_triage::analyze::FilterReason;
use feed_triage::classify::{ClassificationRecord, Stance};
use feed_triage::dedup::CanonicalItem;

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn item(id: &str, stance: Option<Stance>, conf: f32, at: i64) -> CanonicalItem {
    CanonicalItem {
        id: id.into(),
        title: id.into(),
        body: String::new(),
        url: None,
        source_ids: BTreeSet::from(["s".to_string()]),
        member_ids: BTreeSet::from([id.to_string()]),
        url_hashes: BTreeSet::new(),
        content_hashes: BTreeSet::new(),
        first_seen: ts(at),
        published_at: None,
        category: None,
        local_score: Some(0.5),
        classification: Some(ClassificationRecord {
            item_id: id.into(),
            score: None,
            stance,
            confidence: Some(conf),
            reasoning: None,
        }),
        filtered: None,
    }
}

#[test]
fn dead_zone_is_inclusive() {
    let th = TrendThresholds::default();
    // clarity exactly 0.1
    let (d, s, _) = classify_counts(5, 4, 1, &th);
    assert_eq!(d, TrendDirection::Neutral);
    assert_eq!(s, TrendStrength::Weak);

    let (d, _, _) = classify_counts(6, 4, 0, &th);
    assert_eq!(d, TrendDirection::Gaining);
    let (d, _, _) = classify_counts(4, 6, 0, &th);
    assert_eq!(d, TrendDirection::Losing);
}

#[test]
fn evidence_floor() {
    let th = TrendThresholds::default();
    let (d, _, c) = classify_counts(4, 0, 0, &th);
    assert_eq!(d, TrendDirection::Neutral);
    // confidence is still reported for thin evidence
    assert!((c - (0.7 + 0.3 * 0.4)).abs() < 1e-9);

    let (d, s, c) = classify_counts(5, 0, 0, &th);
    assert_eq!(d, TrendDirection::Gaining);
    assert_eq!(s, TrendStrength::Moderate);
    assert!((c - 0.85).abs() < 1e-9);
}

#[test]
fn strength_bands() {
    let th = TrendThresholds::default();
    assert_eq!(classify_counts(8, 2, 0, &th).1, TrendStrength::Strong);
    assert_eq!(classify_counts(7, 3, 0, &th).1, TrendStrength::Moderate);
    // clear but below the moderate volume
    let narrow = TrendThresholds {
        min_evidence: 3,
        ..th.clone()
    };
    assert_eq!(classify_counts(4, 0, 0, &narrow).1, TrendStrength::Weak);
    // large but muddy
    assert_eq!(classify_counts(12, 9, 0, &th).1, TrendStrength::Weak);
}

#[test]
fn confidence_stays_in_unit_range() {
    let th = TrendThresholds::default();
    for s in 0..15 {
        for o in 0..15 {
            let (_, _, c) = classify_counts(s, o, 3, &th);
            assert!((0.0..=1.0).contains(&c), "({s},{o}) -> {c}");
        }
    }
}

#[test]
fn window_is_half_open_and_skips_filtered_or_unclassified() {
    let window = TimeWindow::new(ts(0), ts(3_600));
    let mut items: Vec<CanonicalItem> = (0..5)
        .map(|i| item(&format!("s{i}"), Some(Stance::Supporting), 0.8, 0))
        .collect();
    items.push(item("o-end", Some(Stance::Opposing), 0.9, 3_600));
    items.push(item("o-before", Some(Stance::Opposing), 0.9, -1));
    items.push(item("no-stance", None, 0.9, 10));
    let mut filtered = item("o-filtered", Some(Stance::Opposing), 0.9, 10);
    filtered.filtered = Some(FilterReason::Excluded {
        rule: "sponsored".into(),
    });
    items.push(filtered);
    let mut unclassified = item("bare", None, 0.0, 10);
    unclassified.classification = None;
    items.push(unclassified);

    let rec = aggregate_trend("grid-storage", window, &items, &TrendThresholds::default());

    assert_eq!((rec.supporting, rec.opposing, rec.neutral), (5, 0, 0));
    assert_eq!(rec.total(), 5);
    assert_eq!(rec.direction, TrendDirection::Gaining);
    // equal confidence: smallest ids first
    assert_eq!(rec.evidence_ids, vec!["s0", "s1"]);
    assert_eq!(rec.window, window);
}

#[test]
fn evidence_takes_most_confident_per_side() {
    let window = TimeWindow::trailing(ts(100), Duration::seconds(100));
    let items = vec![
        item("a", Some(Stance::Supporting), 0.2, 10),
        item("b", Some(Stance::Supporting), 0.9, 10),
        item("c", Some(Stance::Supporting), 0.7, 10),
        item("x", Some(Stance::Opposing), 0.1, 10),
        item("y", Some(Stance::Opposing), 0.6, 10),
        item("z", Some(Stance::Opposing), 0.3, 10),
    ];
    let rec = aggregate_trend("t", window, &items, &TrendThresholds::default());
    assert_eq!(rec.direction, TrendDirection::Neutral);
    assert_eq!(rec.evidence_ids, vec!["b", "c", "y", "z"]);
}

#[test]
fn empty_window_is_neutral_with_zero_confidence() {
    let window = TimeWindow::trailing(ts(0), Duration::hours(24));
    let rec = aggregate_trend("t", window, &[], &TrendThresholds::default());
    assert_eq!(rec.total(), 0);
    assert_eq!(rec.direction, TrendDirection::Neutral);
    assert_eq!(rec.strength, TrendStrength::Weak);
    assert_eq!(rec.confidence, 0.0);
    assert!(rec.evidence_ids.is_empty());
}

#[test]
fn touching_windows_do_not_overlap() {
    let a = TimeWindow::new(ts(0), ts(10));
    let b = TimeWindow::new(ts(10), ts(20));
    let c = TimeWindow::trailing(ts(15), Duration::seconds(10));
    assert!(!a.overlaps(&b));
    assert!(a.overlaps(&c));
    assert!(b.overlaps(&c));
    assert!(c.contains(ts(5)));
    assert!(!c.contains(ts(15)));
}
