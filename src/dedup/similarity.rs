// src/dedup/similarity.rs
//! Token shingles + Jaccard, used by the near-duplicate stage.

use std::collections::BTreeSet;

/// Lowercase alphanumeric tokens of length >= 3.
pub fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Contiguous `k`-token shingles; short inputs fall back to their token set.
pub fn shingles(tokens: &[String], k: usize) -> BTreeSet<String> {
    let k = k.max(1);
    if tokens.len() < k {
        return tokens.iter().cloned().collect();
    }
    tokens.windows(k).map(|w| w.join(" ")).collect()
}

/// |A ∩ B| / |A ∪ B|; two empty sets are not considered similar.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = (a.len() + b.len()) as f64 - inter;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Coarse length class: items whose token counts differ by more than ~2x
/// never get compared.
pub fn length_bucket(token_count: usize) -> u32 {
    usize::BITS - token_count.max(1).leading_zeros() - 1
}
