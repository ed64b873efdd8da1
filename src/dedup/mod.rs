// src/dedup/mod.rs
//! Two-stage deduplication of raw items into canonical items.
//!
//! 1. Exact: items sharing a url hash or a content hash are unioned.
//! 2. Near: items in neighbouring (time bucket, length bucket) cells are
//!    compared by shingle Jaccard over title + leading body words.
//!
//! Items are sorted by identity before any union, so the clustering is the
//! same for every permutation of the input.

pub mod similarity;
pub mod union_find;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::analyze::FilterReason;
use crate::classify::ClassificationRecord;
use crate::error::StageError;
use crate::ingest::RawItem;
use similarity::{jaccard, length_bucket, shingles, tokens};
use union_find::UnionFind;

fn default_similarity_threshold() -> f64 {
    0.6
}
fn default_shingle_size() -> usize {
    2
}
fn default_time_window_hours() -> u64 {
    72
}
fn default_leading_words() -> usize {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Jaccard at or above this merges two items.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_shingle_size")]
    pub shingle_size: usize,
    /// Width of a time bucket; also the max publish-time distance for a near match.
    #[serde(default = "default_time_window_hours")]
    pub time_window_hours: u64,
    /// Body words included in the similarity signature.
    #[serde(default = "default_leading_words")]
    pub leading_words: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            shingle_size: default_shingle_size(),
            time_window_hours: default_time_window_hours(),
            leading_words: default_leading_words(),
        }
    }
}

/// Deduplicated representative of one cluster of raw items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: String,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub source_ids: BTreeSet<String>,
    pub member_ids: BTreeSet<String>,
    pub url_hashes: BTreeSet<String>,
    pub content_hashes: BTreeSet<String>,
    /// Minimum fetch time across members.
    pub first_seen: DateTime<Utc>,
    /// Earliest publish time across members, when any member had one.
    pub published_at: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub local_score: Option<f32>,
    pub classification: Option<ClassificationRecord>,
    /// Set by the local scorer; filtered items stay in the set for audit.
    pub filtered: Option<FilterReason>,
}

impl CanonicalItem {
    pub fn is_filtered(&self) -> bool {
        self.filtered.is_some()
    }

    /// Timestamp used for recency ordering.
    pub fn recency(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.first_seen)
    }

    pub fn remote_score(&self) -> Option<f32> {
        self.classification.as_ref().and_then(|c| c.score)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupStats {
    pub input: usize,
    pub malformed: usize,
    pub identity_merges: usize,
    pub url_merges: usize,
    pub content_merges: usize,
    pub near_merges: usize,
    pub clusters: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutput {
    /// Sorted by canonical id.
    pub items: Vec<CanonicalItem>,
    pub malformed: Vec<StageError>,
    pub stats: DedupStats,
}

fn validate(item: &RawItem) -> Result<(), StageError> {
    let origin = if item.source_id.trim().is_empty() {
        "unknown source"
    } else {
        item.source_id.as_str()
    };
    let missing = if item.id.trim().is_empty() {
        Some("id")
    } else if item.source_id.trim().is_empty() {
        Some("source id")
    } else if item.title.trim().is_empty() {
        Some("title")
    } else {
        None
    };
    match missing {
        Some(field) => Err(StageError::malformed(
            origin,
            format!("raw item `{}` missing {field}", item.id),
        )),
        None => Ok(()),
    }
}

struct Signature {
    shingles: BTreeSet<String>,
    time_bucket: i64,
    len_bucket: u32,
    ts: i64,
}

fn signature(item: &RawItem, cfg: &DedupConfig, window_secs: i64) -> Signature {
    let mut toks = tokens(&item.title);
    toks.extend(tokens(&item.body).into_iter().take(cfg.leading_words));
    let ts = item.effective_time().timestamp();
    Signature {
        len_bucket: length_bucket(toks.len()),
        shingles: shingles(&toks, cfg.shingle_size),
        time_bucket: ts.div_euclid(window_secs),
        ts,
    }
}

/// Cluster raw items into canonical items.
pub fn deduplicate(raw: &[RawItem], cfg: &DedupConfig) -> DedupOutput {
    crate::metrics::ensure_metrics_described();
    let mut stats = DedupStats {
        input: raw.len(),
        ..DedupStats::default()
    };

    let mut malformed = Vec::new();
    let mut items: Vec<&RawItem> = Vec::with_capacity(raw.len());
    for it in raw {
        match validate(it) {
            Ok(()) => items.push(it),
            Err(e) => {
                tracing::warn!(target: "dedup", error = %e, "raw item excluded");
                malformed.push(e);
            }
        }
    }
    stats.malformed = malformed.len();

    // Canonical input order makes every later step order-independent.
    items.sort_by(|a, b| {
        (&a.id, &a.source_id, a.fetched_at, &a.title, &a.body)
            .cmp(&(&b.id, &b.source_id, b.fetched_at, &b.title, &b.body))
    });

    let mut uf = UnionFind::new(items.len());

    // --- exact stage ---
    let mut first_by_id: HashMap<&str, usize> = HashMap::new();
    let mut first_by_url: HashMap<&str, usize> = HashMap::new();
    let mut first_by_content: HashMap<&str, usize> = HashMap::new();
    for (i, it) in items.iter().enumerate() {
        let j = *first_by_id.entry(it.id.as_str()).or_insert(i);
        if uf.union(j, i) {
            stats.identity_merges += 1;
        }
        if let Some(h) = it.url_hash.as_deref() {
            let j = *first_by_url.entry(h).or_insert(i);
            if uf.union(j, i) {
                stats.url_merges += 1;
            }
        }
        if let Some(h) = it.content_hash.as_deref() {
            let j = *first_by_content.entry(h).or_insert(i);
            if uf.union(j, i) {
                stats.content_merges += 1;
            }
        }
    }

    // --- near stage ---
    let window_secs = cfg
        .time_window_hours
        .max(1)
        .checked_mul(3600)
        .and_then(|s| i64::try_from(s).ok())
        .unwrap_or(i64::MAX);
    let sigs: Vec<Signature> = items
        .iter()
        .map(|it| signature(it, cfg, window_secs))
        .collect();
    let mut cells: BTreeMap<(i64, u32), Vec<usize>> = BTreeMap::new();
    for (i, s) in sigs.iter().enumerate() {
        cells.entry((s.time_bucket, s.len_bucket)).or_default().push(i);
    }

    let mut try_pair = |uf: &mut UnionFind, a: usize, b: usize| {
        if uf.connected(a, b) {
            return;
        }
        let (sa, sb) = (&sigs[a], &sigs[b]);
        if (sa.ts - sb.ts).abs() > window_secs {
            return;
        }
        let sim = jaccard(&sa.shingles, &sb.shingles);
        if sim >= cfg.similarity_threshold {
            tracing::debug!(target: "dedup", a = %items[a].id, b = %items[b].id, sim, "near duplicate");
            uf.union(a, b);
            stats.near_merges += 1;
        }
    };

    for (&(t, l), members) in &cells {
        for (x, &a) in members.iter().enumerate() {
            for &b in &members[x + 1..] {
                try_pair(&mut uf, a, b);
            }
        }
        // Half of the neighbourhood, so every adjacent cell pair is visited once.
        let neighbours = [
            (t, l.checked_add(1)),
            (t + 1, l.checked_sub(1)),
            (t + 1, Some(l)),
            (t + 1, l.checked_add(1)),
        ];
        for (nt, nl) in neighbours {
            let Some(nl) = nl else { continue };
            if let Some(others) = cells.get(&(nt, nl)) {
                for &a in members {
                    for &b in others {
                        try_pair(&mut uf, a, b);
                    }
                }
            }
        }
    }

    // --- build canonical items ---
    let mut out: Vec<CanonicalItem> = uf
        .groups()
        .into_iter()
        .map(|group| merge_cluster(group.iter().map(|&i| items[i])))
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));

    stats.clusters = out.len();
    counter!("dedup_clusters_total").increment(out.len() as u64);
    counter!("dedup_merged_total").increment((items.len() - out.len()) as u64);
    counter!("dedup_malformed_total").increment(stats.malformed as u64);
    tracing::info!(
        target: "dedup",
        input = stats.input,
        clusters = stats.clusters,
        url = stats.url_merges,
        content = stats.content_merges,
        near = stats.near_merges,
        malformed = stats.malformed,
        "deduplication finished"
    );

    DedupOutput {
        items: out,
        malformed,
        stats,
    }
}

fn merge_cluster<'a>(members: impl Iterator<Item = &'a RawItem>) -> CanonicalItem {
    let members: Vec<&RawItem> = members.collect();
    // Representative: earliest fetched, ties by id.
    let rep = members
        .iter()
        .min_by(|a, b| (a.fetched_at, &a.id).cmp(&(b.fetched_at, &b.id)))
        .copied()
        .unwrap_or(members[0]);

    let member_ids: BTreeSet<String> = members.iter().map(|m| m.id.clone()).collect();
    CanonicalItem {
        id: member_ids.iter().next().cloned().unwrap_or_default(),
        title: rep.title.clone(),
        body: rep.body.clone(),
        url: rep
            .url
            .clone()
            .or_else(|| members.iter().find_map(|m| m.url.clone())),
        source_ids: members.iter().map(|m| m.source_id.clone()).collect(),
        url_hashes: members.iter().filter_map(|m| m.url_hash.clone()).collect(),
        content_hashes: members
            .iter()
            .filter_map(|m| m.content_hash.clone())
            .collect(),
        member_ids,
        first_seen: rep.fetched_at,
        published_at: members.iter().filter_map(|m| m.published_at).min(),
        category: None,
        local_score: None,
        classification: None,
        filtered: None,
    }
}
