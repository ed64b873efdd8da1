// src/store.rs
//! JSON-file store for the latest run's output, read by reporting.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{RankedItem, TimeWindow, TrendRecord};
use crate::dedup::CanonicalItem;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub finished_at: Option<DateTime<Utc>>,
    pub items: Vec<CanonicalItem>,
    pub ranked: Vec<RankedItem>,
    pub trends: Vec<TrendRecord>,
}

/// Filter for `OutputStore::query`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub window: Option<TimeWindow>,
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<'a> {
    pub items: Vec<&'a CanonicalItem>,
    pub trends: Vec<&'a TrendRecord>,
}

pub struct OutputStore {
    path: PathBuf,
    run: StoredRun,
}

impl OutputStore {
    /// Open the store at `path`; a missing file opens empty.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let run = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("parsing output store {}", path.display()))?
        } else {
            StoredRun::default()
        };
        Ok(Self { path, run })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run(&self) -> &StoredRun {
        &self.run
    }

    /// Replace the stored run and write it out (temp file + rename).
    pub fn replace(&mut self, run: StoredRun) -> anyhow::Result<()> {
        self.run = run;
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.run)?;
        let tmp = self.path.with_extension("json.tmp");
        let mut f =
            fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(json.as_bytes())?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        tracing::debug!(
            target: "store",
            path = %self.path.display(),
            items = self.run.items.len(),
            trends = self.run.trends.len(),
            "output stored"
        );
        Ok(())
    }

    /// Items first seen inside the window whose score (remote, else local) is
    /// at least `min_score`, plus trends whose window overlaps the query window.
    pub fn query(&self, q: &Query) -> QueryResult<'_> {
        let items = self
            .run
            .items
            .iter()
            .filter(|i| q.window.map_or(true, |w| w.contains(i.first_seen)))
            .filter(|i| {
                q.min_score.map_or(true, |min| {
                    i.remote_score().or(i.local_score).map_or(false, |s| s >= min)
                })
            })
            .collect();
        let trends = self
            .run
            .trends
            .iter()
            .filter(|t| q.window.map_or(true, |w| w.overlaps(&t.window)))
            .collect();
        QueryResult { items, trends }
    }
}
