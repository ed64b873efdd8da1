//! Content-exclusion rules.
//!
//! Minimal DSL for conditions over an item's title + body (case-insensitive,
//! matched on word boundaries):
//! - `any_contains`: match if at least `min_hits` (default 1) phrases appear
//! - `all_contains`: match if ALL phrases appear
//! - `not_contains`: match if NONE of the phrases appear
//! - `min_len`:      match if body length >= min_len (chars)
//! - `title_regex`:  match if the title matches the pattern
//!
//! Every condition present must hold. The first matching rule (config order)
//! names the exclusion reason.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub name: String,
    #[serde(default)]
    pub when: When,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct When {
    pub any_contains: Option<Vec<String>>,
    pub min_hits: Option<usize>,
    pub all_contains: Option<Vec<String>>,
    pub not_contains: Option<Vec<String>>,
    pub min_len: Option<usize>,
    pub title_regex: Option<String>,
}

impl When {
    fn is_empty(&self) -> bool {
        self.any_contains.is_none()
            && self.all_contains.is_none()
            && self.not_contains.is_none()
            && self.min_len.is_none()
            && self.title_regex.is_none()
    }
}

/// Rule with phrases pre-normalized and its regex compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    any: Vec<String>,
    min_hits: usize,
    all: Vec<String>,
    none: Vec<String>,
    min_len: Option<usize>,
    title_re: Option<Regex>,
}

impl CompiledRule {
    pub fn compile(rule: &ExclusionRule) -> Result<Self, ConfigError> {
        if rule.name.trim().is_empty() {
            return Err(ConfigError::invalid("exclusion rule without a name"));
        }
        if rule.when.is_empty() {
            return Err(ConfigError::invalid(format!(
                "exclusion rule `{}` has no conditions",
                rule.name
            )));
        }
        let norm = |v: &Option<Vec<String>>| -> Vec<String> {
            v.iter()
                .flatten()
                .map(|p| normalize(p))
                .filter(|p| !p.is_empty())
                .collect()
        };
        let title_re = rule
            .when
            .title_regex
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Self {
            name: rule.name.clone(),
            any: norm(&rule.when.any_contains),
            min_hits: rule.when.min_hits.unwrap_or(1).max(1),
            all: norm(&rule.when.all_contains),
            none: norm(&rule.when.not_contains),
            min_len: rule.when.min_len,
            title_re,
        })
    }

    /// `text` must come from `normalize`; `title`/`body` are the raw fields.
    pub fn matches(&self, text: &str, title: &str, body: &str) -> bool {
        if let Some(min) = self.min_len {
            if body.chars().count() < min {
                return false;
            }
        }
        if !self.any.is_empty() {
            let hits = self.any.iter().filter(|p| contains(text, p)).count();
            if hits < self.min_hits {
                return false;
            }
        }
        if !self.all.iter().all(|p| contains(text, p)) {
            return false;
        }
        if self.none.iter().any(|p| contains(text, p)) {
            return false;
        }
        if let Some(re) = &self.title_re {
            if !re.is_match(title) {
                return false;
            }
        }
        true
    }
}

/// First matching rule, if any.
pub fn first_match<'a>(
    rules: &'a [CompiledRule],
    title: &str,
    body: &str,
) -> Option<&'a CompiledRule> {
    let text = normalize(&format!("{title} {body}"));
    rules.iter().find(|r| r.matches(&text, title, body))
}

/// Phrase match on word boundaries; both sides already normalized.
pub fn contains(text: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    text.match_indices(phrase).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + phrase.len()..].chars().next();
        before.is_none_or_space() && after.is_none_or_space()
    })
}

trait BoundaryExt {
    fn is_none_or_space(self) -> bool;
}

impl BoundaryExt for Option<char> {
    fn is_none_or_space(self) -> bool {
        self.map_or(true, |c| c == ' ')
    }
}

/// Lowercase, non-alphanumerics to spaces, whitespace condensed.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = true;
    for ch in input.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}
