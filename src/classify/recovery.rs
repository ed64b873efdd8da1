// src/classify/recovery.rs
//! Layered recovery of classification records from unreliable model output.
//!
//! Layers run in a fixed order and are cumulative: each one transforms the
//! output of the previous one, and a structured parse is attempted after every
//! layer that changed the text. The first parse that yields at least one valid
//! record wins and its layer is reported.
//!
//! 1. strip prose and code fences around the payload
//! 2. repair missing separators between records
//! 3. close a truncated structure after its last complete value
//! 4. normalize quotes, bare keys, trailing commas and Python literals
//! 5. extract balanced record objects (or `id: / score:` line blocks)
//!
//! Nothing here ever produces a record the response did not contain. Records
//! that do not fit the expected schema are dropped and counted.

use std::collections::HashSet;

use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ClassificationRecord, ClassifyMode, Stance};

const PREVIEW_CHARS: usize = 200;
const MAX_REASONING_CHARS: usize = 500;
const FUZZY_KEY_MIN: f64 = 0.8;

static RE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[A-Za-z]*").expect("static regex"));
static RE_ADJACENT_OBJECTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\}\s*\{").expect("static regex"));
static RE_MISSING_COMMA_NEWLINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"("|\d|true|false|null|\}|\])([ \t]*\r?\n\s*")"#).expect("static regex")
});
static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("static regex"));
static RE_BARE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").expect("static regex"));
static RE_PY_TRUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTrue\b").expect("static regex"));
static RE_PY_FALSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bFalse\b").expect("static regex"));
static RE_PY_NONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNone\b").expect("static regex"));
static RE_KV_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:[-*]|\d+[.)])?\s*["']?([A-Za-z][A-Za-z0-9 _-]*?)["']?\s*[:=]\s*(.*?)\s*,?\s*$"#)
        .expect("static regex")
});

/// Ordered recovery steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryLayer {
    StripProse,
    RepairDelimiters,
    CloseTruncation,
    NormalizeQuotes,
    Extract,
}

impl RecoveryLayer {
    /// 1-based position in the chain.
    pub fn number(self) -> u8 {
        self as u8 + 1
    }

    pub fn label(self) -> &'static str {
        match self {
            RecoveryLayer::StripProse => "strip_prose",
            RecoveryLayer::RepairDelimiters => "repair_delimiters",
            RecoveryLayer::CloseTruncation => "close_truncation",
            RecoveryLayer::NormalizeQuotes => "normalize_quotes",
            RecoveryLayer::Extract => "extract",
        }
    }

    fn apply(self, text: &str) -> String {
        match self {
            RecoveryLayer::StripProse => strip_prose(text),
            RecoveryLayer::RepairDelimiters => repair_delimiters(text),
            RecoveryLayer::CloseTruncation => close_truncation(text),
            RecoveryLayer::NormalizeQuotes => normalize_quotes(text),
            RecoveryLayer::Extract => text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ParseOutcome {
    /// Parsed as-is with every expected record present.
    Exact,
    /// Every expected record present after recovery at `layer`.
    Recovered { layer: RecoveryLayer },
    /// Some records usable; `missing` expected ids absent or dropped.
    Partial {
        layer: Option<RecoveryLayer>,
        missing: usize,
    },
    /// Nothing usable. Always comes with an empty record set.
    Failed,
}

impl ParseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ParseOutcome::Exact => "exact",
            ParseOutcome::Recovered { .. } => "recovered",
            ParseOutcome::Partial { .. } => "partial",
            ParseOutcome::Failed => "failed",
        }
    }

    pub fn layer(&self) -> Option<RecoveryLayer> {
        match self {
            ParseOutcome::Recovered { layer } => Some(*layer),
            ParseOutcome::Partial { layer, .. } => *layer,
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ParseOutcome::Failed)
    }
}

/// What a batch response is expected to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedSchema {
    pub mode: ClassifyMode,
    pub item_ids: Vec<String>,
}

impl ExpectedSchema {
    pub fn new(mode: ClassifyMode, item_ids: Vec<String>) -> Self {
        Self { mode, item_ids }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub records: Vec<ClassificationRecord>,
    pub outcome: ParseOutcome,
    /// Record-shaped values rejected by the schema (unknown id, duplicate, missing field).
    pub dropped: usize,
    /// Expected ids with no usable record, in schema order.
    pub missing_ids: Vec<String>,
}

/// Recover classification records from a raw service response. Never panics
/// on malformed input.
pub fn parse(raw: &str, schema: &ExpectedSchema) -> ParseResult {
    tracing::debug!(target: "recovery", preview = %preview(raw), "parsing response");

    if raw.trim().is_empty() {
        return finish(raw, None, Interpreted::default(), schema);
    }

    if let Some(found) = attempt(raw, schema) {
        return finish(raw, None, found, schema);
    }

    let mut text = raw.to_string();
    let mut last = Interpreted::default();
    for layer in [
        RecoveryLayer::StripProse,
        RecoveryLayer::RepairDelimiters,
        RecoveryLayer::CloseTruncation,
        RecoveryLayer::NormalizeQuotes,
    ] {
        let next = layer.apply(&text);
        if next == text {
            continue;
        }
        text = next;
        match attempt_json(&text, schema) {
            Some(found) if !found.records.is_empty() => {
                return finish(raw, Some(layer), found, schema);
            }
            Some(found) => last = found,
            None => {}
        }
    }

    let mut found = interpret(balanced_records(&text), schema);
    if found.records.is_empty() && found.dropped == 0 {
        found = interpret(line_blocks(raw), schema);
    }
    if found.records.is_empty() {
        found.dropped = found.dropped.max(last.dropped);
        return finish(raw, None, found, schema);
    }
    finish(raw, Some(RecoveryLayer::Extract), found, schema)
}

#[derive(Debug, Default)]
struct Interpreted {
    records: Vec<ClassificationRecord>,
    dropped: usize,
}

fn attempt(text: &str, schema: &ExpectedSchema) -> Option<Interpreted> {
    attempt_json(text, schema).filter(|f| !f.records.is_empty())
}

fn attempt_json(text: &str, schema: &ExpectedSchema) -> Option<Interpreted> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    Some(interpret(candidates_from_value(value), schema))
}

fn finish(raw: &str, layer: Option<RecoveryLayer>, found: Interpreted, schema: &ExpectedSchema) -> ParseResult {
    let present: HashSet<&str> = found.records.iter().map(|r| r.item_id.as_str()).collect();
    let missing_ids: Vec<String> = schema
        .item_ids
        .iter()
        .filter(|id| !present.contains(id.as_str()))
        .cloned()
        .collect();

    let outcome = if found.records.is_empty() {
        ParseOutcome::Failed
    } else if missing_ids.is_empty() && found.dropped == 0 {
        match layer {
            None => ParseOutcome::Exact,
            Some(layer) => ParseOutcome::Recovered { layer },
        }
    } else {
        ParseOutcome::Partial {
            layer,
            missing: missing_ids.len(),
        }
    };

    let label = match (&outcome, outcome.layer()) {
        (ParseOutcome::Failed, _) => "failed",
        (_, Some(l)) => l.label(),
        (_, None) => "exact",
    };
    counter!("recovery_layer_total", "layer" => label).increment(1);

    if outcome.is_failed() {
        tracing::warn!(
            target: "recovery",
            expected = schema.item_ids.len(),
            dropped = found.dropped,
            bytes = raw.len(),
            "no records recovered"
        );
    } else {
        tracing::debug!(
            target: "recovery",
            outcome = outcome.label(),
            layer = label,
            records = found.records.len(),
            dropped = found.dropped,
            missing = missing_ids.len(),
            "response parsed"
        );
    }

    ParseResult {
        records: found.records,
        outcome,
        dropped: found.dropped,
        missing_ids,
    }
}

fn preview(raw: &str) -> String {
    let mut p: String = raw.chars().take(PREVIEW_CHARS).collect();
    if raw.chars().count() > PREVIEW_CHARS {
        p.push_str("...");
    }
    p
}

// ---------------------------------------------------------------------------
// Text layers
// ---------------------------------------------------------------------------

/// Splits `text` into (is_string, slice) runs; double-quoted strings are escape aware.
fn segments(text: &str) -> Vec<(bool, &str)> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_str = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_str => {
                i += 2;
                continue;
            }
            b'"' if in_str => {
                out.push((true, &text[start..=i]));
                start = i + 1;
                in_str = false;
            }
            b'"' => {
                if start < i {
                    out.push((false, &text[start..i]));
                }
                start = i;
                in_str = true;
            }
            _ => {}
        }
        i += 1;
    }
    if start < text.len() {
        out.push((in_str, &text[start..]));
    }
    out
}

/// Rewrite only the parts of `text` outside string literals.
fn map_code(text: &str, f: impl Fn(&str) -> String) -> String {
    segments(text)
        .into_iter()
        .map(|(is_str, s)| if is_str { s.to_string() } else { f(s) })
        .collect()
}

fn strip_prose(text: &str) -> String {
    let t = RE_FENCE.replace_all(text, "");
    let start = t.find(&['[', '{'][..]);
    let end = t.rfind(&[']', '}'][..]);
    match (start, end) {
        (Some(s), Some(e)) if e > s => t[s..=e].to_string(),
        (Some(s), _) => t[s..].trim_end().to_string(),
        _ => t.trim().to_string(),
    }
}

fn repair_delimiters(text: &str) -> String {
    let joined = map_code(text, |code| RE_ADJACENT_OBJECTS.replace_all(code, "},{").into_owned());
    RE_MISSING_COMMA_NEWLINE
        .replace_all(&joined, "$1,$2")
        .into_owned()
}

/// Cut after the last complete value and append the closers still open there.
/// Text with balanced brackets is returned unchanged.
fn close_truncation(text: &str) -> String {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_str = false;
    let mut escaped = false;
    let mut last_cut: Option<(usize, Vec<u8>)> = None;

    for (i, &b) in text.as_bytes().iter().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'{' | b'[' => stack.push(b),
            b'}' | b']' => {
                stack.pop();
                last_cut = Some((i + 1, stack.clone()));
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_str {
        return text.to_string();
    }
    let Some((cut, open)) = last_cut else {
        return text.to_string();
    };
    let mut out = text[..cut].trim_end().trim_end_matches(',').to_string();
    for b in open.iter().rev() {
        out.push(if *b == b'{' { '}' } else { ']' });
    }
    out
}

fn normalize_quotes(text: &str) -> String {
    let ascii: String = text
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            _ => c,
        })
        .collect();
    let doubled = single_to_double(&ascii);
    map_code(&doubled, |code| {
        let s = RE_TRAILING_COMMA.replace_all(code, "$1");
        let s = RE_BARE_KEY.replace_all(&s, "$1\"$2\"$3");
        let s = RE_PY_TRUE.replace_all(&s, "true");
        let s = RE_PY_FALSE.replace_all(&s, "false");
        RE_PY_NONE.replace_all(&s, "null").into_owned()
    })
}

/// 'single quoted' strings outside double-quoted ones become "double quoted".
fn single_to_double(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    let mut in_double = false;
    while let Some(c) = chars.next() {
        if in_double {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(n) = chars.next() {
                        out.push(n);
                    }
                }
                '"' => in_double = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_double = true;
                out.push(c);
            }
            '\'' => {
                let mut inner = String::new();
                let mut closed = false;
                while let Some(n) = chars.next() {
                    match n {
                        '\\' => {
                            if let Some(e) = chars.next() {
                                inner.push('\\');
                                inner.push(e);
                            }
                        }
                        '\'' => {
                            closed = true;
                            break;
                        }
                        '"' => inner.push_str("\\\""),
                        _ => inner.push(n),
                    }
                }
                if closed {
                    out.push('"');
                    out.push_str(&inner);
                    out.push('"');
                } else {
                    out.push('\'');
                    out.push_str(&inner.replace("\\\"", "\""));
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Outermost balanced objects that carry an id key, parsed independently.
fn balanced_records(text: &str) -> Vec<Map<String, Value>> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut opens: Vec<usize> = Vec::new();
    let mut in_str = false;
    let mut escaped = false;
    for (i, &b) in text.as_bytes().iter().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'{' => opens.push(i),
            b'}' => {
                if let Some(start) = opens.pop() {
                    spans.push((start, i + 1));
                }
            }
            _ => {}
        }
    }
    spans.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut out = Vec::new();
    let mut accepted_end = 0;
    for (start, end) in spans {
        if start < accepted_end {
            continue;
        }
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text[start..end]) else {
            continue;
        };
        if map.keys().any(|k| matches!(resolve_key(k), Some((Field::Id, _)))) {
            accepted_end = end;
            out.push(map);
        }
    }
    out
}

/// `id: ...` starts a block; following `key: value` lines belong to it.
fn line_blocks(raw: &str) -> Vec<Map<String, Value>> {
    let mut out = Vec::new();
    let mut current: Option<Map<String, Value>> = None;
    for line in raw.lines() {
        let Some(caps) = RE_KV_LINE.captures(line) else {
            continue;
        };
        let Some((field, _)) = resolve_key(&caps[1]) else {
            continue;
        };
        let value = caps[2].trim_matches(|c| c == '"' || c == '\'').trim().to_string();
        if field == Field::Id {
            if let Some(block) = current.take() {
                out.push(block);
            }
            current = Some(Map::new());
        }
        if let Some(block) = current.as_mut() {
            block.insert(field.canonical().to_string(), Value::String(value));
        }
    }
    if let Some(block) = current {
        out.push(block);
    }
    out
}

// ---------------------------------------------------------------------------
// Record interpretation
// ---------------------------------------------------------------------------

const WRAPPER_KEYS: &[&str] = &[
    "results",
    "article_analysis",
    "records",
    "items",
    "classifications",
    "analysis",
    "data",
];

fn candidates_from_value(value: Value) -> Vec<Map<String, Value>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .collect(),
        Value::Object(mut map) => {
            if map.keys().any(|k| matches!(resolve_key(k), Some((Field::Id, _)))) {
                return vec![map];
            }
            for key in WRAPPER_KEYS {
                if let Some(inner) = map.remove(*key) {
                    return candidates_from_value(inner);
                }
            }
            match map.into_iter().find(|(_, v)| v.is_array()) {
                Some((_, inner)) => candidates_from_value(inner),
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Score,
    Stance,
    Confidence,
    Reasoning,
}

impl Field {
    fn canonical(self) -> &'static str {
        match self {
            Field::Id => "item_id",
            Field::Score => "priority_score",
            Field::Stance => "stance",
            Field::Confidence => "confidence",
            Field::Reasoning => "reasoning",
        }
    }
}

const ALIASES: &[(&str, Field)] = &[
    ("item_id", Field::Id),
    ("article_id", Field::Id),
    ("id", Field::Id),
    ("itemid", Field::Id),
    ("priority_score", Field::Score),
    ("score", Field::Score),
    ("priority", Field::Score),
    ("relevance_score", Field::Score),
    ("stance", Field::Stance),
    ("position", Field::Stance),
    ("confidence", Field::Confidence),
    ("reasoning", Field::Reasoning),
    ("reason", Field::Reasoning),
    ("rationale", Field::Reasoning),
    ("explanation", Field::Reasoning),
];

/// Maps a response key onto a schema field. Lower rank wins when a record
/// carries several keys for the same field; fuzzy matches rank after exact ones.
fn resolve_key(key: &str) -> Option<(Field, usize)> {
    let norm: String = key
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    if let Some((rank, (_, field))) = ALIASES.iter().enumerate().find(|(_, (a, _))| *a == norm) {
        return Some((*field, rank));
    }
    if norm.len() < 4 {
        return None;
    }
    ALIASES
        .iter()
        .enumerate()
        .filter(|(_, (a, _))| a.len() >= 4)
        .map(|(rank, (a, f))| (strsim::normalized_damerau_levenshtein(a, &norm), rank, *f))
        .filter(|(sim, _, _)| *sim >= FUZZY_KEY_MIN)
        .max_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, rank, field)| (field, ALIASES.len() + rank))
}

fn fields(map: &Map<String, Value>) -> [Option<&Value>; 5] {
    let mut best: [Option<(usize, &Value)>; 5] = [None; 5];
    for (k, v) in map {
        if let Some((field, rank)) = resolve_key(k) {
            let slot = &mut best[field as usize];
            if slot.map_or(true, |(r, _)| rank < r) {
                *slot = Some((rank, v));
            }
        }
    }
    best.map(|s| s.map(|(_, v)| v))
}

fn unit_interval(v: &Value) -> Option<f32> {
    let x = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (x.is_finite() && (0.0..=1.0).contains(&x)).then_some(x as f32)
}

fn parse_stance(v: &Value) -> Option<Stance> {
    let s = v.as_str()?.trim().to_ascii_lowercase();
    match s.as_str() {
        "supporting" | "support" | "supports" | "for" => Some(Stance::Supporting),
        "opposing" | "oppose" | "opposes" | "against" => Some(Stance::Opposing),
        "neutral" | "mixed" => Some(Stance::Neutral),
        _ => None,
    }
}

fn match_id<'a>(v: &Value, schema: &'a ExpectedSchema) -> Result<&'a str, String> {
    let got = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => return Err(format!("unusable id {other}")),
    };
    schema
        .item_ids
        .iter()
        .find(|id| id.as_str() == got || id.eq_ignore_ascii_case(&got))
        .map(String::as_str)
        .ok_or_else(|| format!("unknown id `{got}`"))
}

fn record_from_map(
    map: &Map<String, Value>,
    schema: &ExpectedSchema,
) -> Result<ClassificationRecord, String> {
    let [id, score, stance, confidence, reasoning] = fields(map);
    let item_id = match_id(id.ok_or("record without id")?, schema)?;
    let score = score.and_then(unit_interval);
    let stance = stance.and_then(parse_stance);
    match schema.mode {
        ClassifyMode::Priority if score.is_none() => {
            return Err(format!("`{item_id}` has no usable priority_score"));
        }
        ClassifyMode::Stance if stance.is_none() => {
            return Err(format!("`{item_id}` has no usable stance"));
        }
        _ => {}
    }
    Ok(ClassificationRecord {
        item_id: item_id.to_string(),
        score,
        stance,
        confidence: confidence.and_then(unit_interval),
        reasoning: reasoning
            .and_then(Value::as_str)
            .map(|s| s.chars().take(MAX_REASONING_CHARS).collect()),
    })
}

fn interpret(candidates: Vec<Map<String, Value>>, schema: &ExpectedSchema) -> Interpreted {
    let mut seen = HashSet::new();
    let mut out = Interpreted::default();
    for map in &candidates {
        match record_from_map(map, schema) {
            Ok(rec) if seen.insert(rec.item_id.clone()) => out.records.push(rec),
            Ok(rec) => {
                tracing::debug!(target: "recovery", item = %rec.item_id, "duplicate record dropped");
                out.dropped += 1;
            }
            Err(why) => {
                tracing::debug!(target: "recovery", reason = %why, "record dropped");
                out.dropped += 1;
            }
        }
    }
    out
}
