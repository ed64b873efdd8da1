//! Local priority score.
//!
//! `ScoreInputs` are four normalized signals in [0,1]:
//! - `strength_score` : keyword signal of the winning category
//! - `recency_score`  : half-life decay of the item's age
//! - `category_score` : configured weight of the winning category
//! - `source_score`   : best editorial reliability among the item's sources
//!
//! local score = weighted sum / sum of weights, clamped to [0,1].

use serde::{Deserialize, Serialize};

fn w_strength() -> f32 {
    0.45
}
fn w_recency() -> f32 {
    0.25
}
fn w_category() -> f32 {
    0.20
}
fn w_source() -> f32 {
    0.10
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    #[serde(default = "w_strength")]
    pub w_strength: f32,
    #[serde(default = "w_recency")]
    pub w_recency: f32,
    #[serde(default = "w_category")]
    pub w_category: f32,
    #[serde(default = "w_source")]
    pub w_source: f32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            w_strength: w_strength(),
            w_recency: w_recency(),
            w_category: w_category(),
            w_source: w_source(),
        }
    }
}

impl Weights {
    pub fn is_valid(&self) -> bool {
        let all = [self.w_strength, self.w_recency, self.w_category, self.w_source];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && all.iter().sum::<f32>() > 0.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreInputs {
    pub strength_score: f32,
    pub recency_score: f32,
    pub category_score: f32,
    pub source_score: f32,
}

impl ScoreInputs {
    /// Safe constructor with clamping.
    pub fn new(strength: f32, recency: f32, category: f32, source: f32) -> Self {
        fn c(x: f32) -> f32 {
            if x.is_nan() {
                0.0
            } else {
                x.clamp(0.0, 1.0)
            }
        }
        Self {
            strength_score: c(strength),
            recency_score: c(recency),
            category_score: c(category),
            source_score: c(source),
        }
    }
}

pub fn local_score(inputs: &ScoreInputs, w: &Weights) -> f32 {
    let raw = inputs.strength_score * w.w_strength
        + inputs.recency_score * w.w_recency
        + inputs.category_score * w.w_category
        + inputs.source_score * w.w_source;
    let denom = (w.w_strength + w.w_recency + w.w_category + w.w_source).max(1e-6);
    (raw / denom).clamp(0.0, 1.0)
}

/// 1.0 for a fresh item, 0.5 after one half-life; future timestamps count as fresh.
pub fn recency_decay(age_hours: f64, half_life_hours: f64) -> f32 {
    if half_life_hours <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(age_hours.max(0.0) / half_life_hours) as f32
}
