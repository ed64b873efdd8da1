// tests/recovery_corpus.rs
// Malformed-response corpus: one fixture file per payload shape.

use std::path::PathBuf;

use feed_triage::classify::{parse, ClassifyMode, ExpectedSchema, ParseOutcome, RecoveryLayer};

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/responses")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

fn schema() -> ExpectedSchema {
    ExpectedSchema::new(
        ClassifyMode::Priority,
        vec!["a1".into(), "a2".into(), "a3".into(), "a4".into()],
    )
}

fn ids(records: &[feed_triage::classify::ClassificationRecord]) -> Vec<&str> {
    records.iter().map(|r| r.item_id.as_str()).collect()
}

#[test]
fn clean_response_is_exact() {
    let out = parse(&fixture("clean.json"), &schema());
    assert_eq!(out.outcome, ParseOutcome::Exact);
    assert_eq!(ids(&out.records), vec!["a1", "a2", "a3", "a4"]);
    assert_eq!(out.records[0].score, Some(0.91));
    assert!(out.missing_ids.is_empty());
}

#[test]
fn corpus_layers() {
    let cases = [
        ("fenced_prose.txt", RecoveryLayer::StripProse),
        ("missing_commas.txt", RecoveryLayer::RepairDelimiters),
        ("single_quotes.txt", RecoveryLayer::NormalizeQuotes),
    ];
    for (file, layer) in cases {
        let out = parse(&fixture(file), &schema());
        assert_eq!(out.outcome, ParseOutcome::Recovered { layer }, "{file}");
        assert_eq!(ids(&out.records), vec!["a1", "a2", "a3", "a4"], "{file}");
        assert_eq!(out.dropped, 0, "{file}");
    }
}

#[test]
fn truncated_response_keeps_complete_records_only() {
    let out = parse(&fixture("truncated.txt"), &schema());
    assert_eq!(
        out.outcome,
        ParseOutcome::Partial {
            layer: Some(RecoveryLayer::CloseTruncation),
            missing: 1
        }
    );
    assert_eq!(ids(&out.records), vec!["a1", "a2", "a3"]);
    assert_eq!(out.missing_ids, vec!["a4".to_string()]);
    assert_eq!(out.outcome.layer().map(RecoveryLayer::number), Some(3));
}

#[test]
fn key_value_blocks_without_score_are_dropped() {
    let out = parse(&fixture("key_value_lines.txt"), &schema());
    assert_eq!(
        out.outcome,
        ParseOutcome::Partial {
            layer: Some(RecoveryLayer::Extract),
            missing: 1
        }
    );
    assert_eq!(ids(&out.records), vec!["a1", "a2", "a3"]);
    assert_eq!(out.records[1].score, Some(0.40));
    assert_eq!(out.dropped, 1);
    assert_eq!(out.missing_ids, vec!["a4".to_string()]);
}

#[test]
fn refusal_text_fails_with_no_records() {
    let out = parse(&fixture("garbage.txt"), &schema());
    assert!(out.outcome.is_failed());
    assert!(out.records.is_empty());
    assert_eq!(out.missing_ids.len(), 4);
}

#[test]
fn wrapper_object_is_unwrapped() {
    let out = parse(&fixture("wrapped_object.json"), &schema());
    assert_eq!(out.outcome, ParseOutcome::Exact);
    assert_eq!(out.records.len(), 4);
    assert!(out.records.iter().all(|r| r.reasoning.is_none()));
}

#[test]
fn misspelled_keys_resolve() {
    let out = parse(&fixture("fuzzy_keys.json"), &schema());
    assert_eq!(out.outcome, ParseOutcome::Exact);
    assert_eq!(ids(&out.records), vec!["a1", "a2", "a3", "a4"]);
    assert_eq!(out.records[0].score, Some(0.91));
    assert_eq!(out.records[0].reasoning.as_deref(), Some("Record auction result"));
    assert_eq!(out.records[1].score, Some(0.40));
}

#[test]
fn invalid_records_are_dropped_not_repaired() {
    let out = parse(&fixture("out_of_range.json"), &schema());
    assert_eq!(
        out.outcome,
        ParseOutcome::Partial {
            layer: None,
            missing: 2
        }
    );
    // first a2 wins; 91 is not rescaled; "high" is not guessed
    assert_eq!(ids(&out.records), vec!["a2", "a4"]);
    assert_eq!(out.records[0].score, Some(0.40));
    assert_eq!(out.dropped, 4);
    assert_eq!(out.missing_ids, vec!["a1".to_string(), "a3".to_string()]);
}

#[test]
fn every_fixture_is_handled_without_fabrication() {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/responses");
    let mut seen = 0;
    for entry in std::fs::read_dir(&dir).unwrap() {
        let path = entry.unwrap().path();
        let raw = std::fs::read_to_string(&path).unwrap();
        let out = parse(&raw, &schema());
        for r in &out.records {
            assert!(schema().item_ids.contains(&r.item_id), "{}", path.display());
            assert!(r.score.is_some_and(|s| (0.0..=1.0).contains(&s)));
        }
        assert_eq!(
            out.records.len() + out.missing_ids.len(),
            4,
            "{}",
            path.display()
        );
        seen += 1;
    }
    assert!(seen >= 10);
}
