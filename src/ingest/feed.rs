// src/ingest/feed.rs
//! RSS 2.0 / Atom document parsing into `RawItem`s.

use chrono::{DateTime, Utc};
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use super::types::RawItem;
use crate::error::StageError;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<TextNode>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<TextNode>,
    id: Option<TextNode>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<TextNode>,
    content: Option<TextNode>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

/// Element whose attributes we do not care about.
#[derive(Debug, Default, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    value: String,
}

/// Items parsed from one document plus entries that had to be skipped.
#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub items: Vec<RawItem>,
    pub skipped_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Rss,
    Atom,
}

fn sniff_format(doc: &str) -> Option<Format> {
    let head: String = doc.chars().take(4096).collect::<String>().to_ascii_lowercase();
    if head.contains("<rss") || head.contains("<rdf:rdf") {
        Some(Format::Rss)
    } else if head.contains("<feed") {
        Some(Format::Atom)
    } else {
        None
    }
}

/// Parse a syndication document. Malformed or empty documents become a
/// `MalformedInput` error; entries without a title are skipped and counted.
pub fn parse_feed_document(
    source_id: &str,
    doc: &str,
    fetched_at: DateTime<Utc>,
) -> Result<ParsedFeed, StageError> {
    let t0 = std::time::Instant::now();
    let cleaned = scrub_html_entities_for_xml(doc);

    let parsed = match sniff_format(&cleaned) {
        Some(Format::Rss) => parse_rss(source_id, &cleaned, fetched_at)?,
        Some(Format::Atom) => parse_atom(source_id, &cleaned, fetched_at)?,
        None => {
            return Err(StageError::malformed(
                source_id,
                "unrecognized feed format",
            ))
        }
    };

    histogram!("feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

    if parsed.items.is_empty() {
        let detail = if parsed.skipped_entries > 0 {
            format!("no usable entries ({} skipped)", parsed.skipped_entries)
        } else {
            "empty feed".to_string()
        };
        return Err(StageError::malformed(source_id, detail));
    }
    Ok(parsed)
}

fn parse_rss(
    source_id: &str,
    xml: &str,
    fetched_at: DateTime<Utc>,
) -> Result<ParsedFeed, StageError> {
    let rss: Rss = from_str(xml)
        .map_err(|e| StageError::malformed(source_id, format!("rss parse error: {e}")))?;

    let mut out = ParsedFeed::default();
    for it in rss.channel.item {
        let Some(title) = it.title.as_deref().filter(|t| !t.trim().is_empty()) else {
            out.skipped_entries += 1;
            continue;
        };
        let item = RawItem::new(
            source_id,
            it.guid.as_ref().map(|g| g.value.as_str()),
            title,
            it.description.as_deref().unwrap_or_default(),
            it.link.as_deref(),
            it.pub_date.as_deref().and_then(parse_rfc2822),
            fetched_at,
        );
        if item.title.is_empty() {
            out.skipped_entries += 1;
            continue;
        }
        out.items.push(item);
    }
    Ok(out)
}

fn parse_atom(
    source_id: &str,
    xml: &str,
    fetched_at: DateTime<Utc>,
) -> Result<ParsedFeed, StageError> {
    let feed: AtomFeed = from_str(xml)
        .map_err(|e| StageError::malformed(source_id, format!("atom parse error: {e}")))?;

    let mut out = ParsedFeed::default();
    for e in feed.entry {
        let Some(title) = e.title.as_ref().map(|t| t.value.as_str()).filter(|t| !t.trim().is_empty())
        else {
            out.skipped_entries += 1;
            continue;
        };
        let link = e
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
            .or_else(|| e.links.first())
            .and_then(|l| l.href.as_deref());
        let body = e
            .content
            .as_ref()
            .or(e.summary.as_ref())
            .map(|t| t.value.as_str())
            .unwrap_or_default();
        let published = e
            .published
            .as_deref()
            .or(e.updated.as_deref())
            .and_then(parse_rfc3339);

        let item = RawItem::new(
            source_id,
            e.id.as_ref().map(|i| i.value.as_str()),
            title,
            body,
            link,
            published,
            fetched_at,
        );
        if item.title.is_empty() {
            out.skipped_entries += 1;
            continue;
        }
        out.items.push(item);
    }
    Ok(out)
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .and_then(|dt| from_unix(dt.unix_timestamp()))
        // Obsolete zone names ("GMT", "EST") are common in the wild.
        .or_else(|| {
            DateTime::parse_from_rfc2822(ts)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc3339)
        .ok()
        .and_then(|dt| from_unix(dt.unix_timestamp()))
}

/// XML only knows five named entities; HTML ones break the parser.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}
