// src/ingest/mod.rs
pub mod feed;
pub mod fetcher;
pub mod registry;
pub mod types;

pub use fetcher::{fetch_all, FeedTransport, FetchOptions, FetchReport, HttpTransport};
pub use registry::SourceRegistry;
pub use types::{RawItem, Source, SourceHealth};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Body length cap (chars) after normalization.
pub const MAX_BODY_CHARS: usize = 1500;

/// Normalize feed text: decode entities, strip tags, ASCII quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags (a second decode catches double-escaped markup)
    let out = RE_TAGS.replace_all(&out, " ");
    let out = html_escape::decode_html_entities(&out).to_string();
    let out = RE_TAGS.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    let out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    let out = RE_WS.replace_all(&out, " ").trim().to_string();

    // 5) Length cap
    if out.chars().count() > MAX_BODY_CHARS {
        out.chars().take(MAX_BODY_CHARS).collect()
    } else {
        out
    }
}

/// Canonical form of a link for hashing: lowercase scheme/host, no fragment,
/// no trailing slash.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split('#').next().unwrap_or(url);
    let (scheme, rest) = match url.split_once("://") {
        Some((s, r)) => (s.to_ascii_lowercase(), r),
        None => (String::from("http"), url),
    };
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let path = path.trim_end_matches('/');
    format!("{scheme}://{host}{path}")
}

/// Short hex SHA-256 digest used for item identity and provenance hashes.
pub fn stable_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest[..12].iter().map(|b| format!("{b:02x}")).collect()
}
