// src/classify/service.rs
//! Remote classification service seam plus the Anthropic Messages client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ClassifyMode;
use crate::dedup::CanonicalItem;
use crate::error::ConfigError;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by service")]
    RateLimited,
    #[error("service error (HTTP {0})")]
    Server(u16),
    #[error("request rejected (HTTP {0})")]
    Rejected(u16),
    #[error("transport: {0}")]
    Transport(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ServiceError::Rejected(_))
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ServiceError::RateLimited,
            500..=599 => ServiceError::Server(status),
            other => ServiceError::Rejected(other),
        }
    }
}

/// Sends one prepared batch payload, returns the raw response text.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    async fn submit(&self, payload: &str) -> Result<String, ServiceError>;

    fn name(&self) -> &'static str;
}

/// Renders a batch of items into the request text.
pub trait PayloadFormatter: Send + Sync {
    fn format(&self, items: &[&CanonicalItem], mode: ClassifyMode) -> String;
}

/// Numbered listing with ids and a JSON answer template.
#[derive(Debug, Clone, Default)]
pub struct PlainListing {
    pub body_chars: usize,
    /// Statement judged in stance mode.
    pub trend: Option<String>,
}

impl PayloadFormatter for PlainListing {
    fn format(&self, items: &[&CanonicalItem], mode: ClassifyMode) -> String {
        let limit = if self.body_chars == 0 { 400 } else { self.body_chars };
        let mut out = String::new();
        match mode {
            ClassifyMode::Priority => out.push_str(
                "Rate how important each item is for the reader on a scale from 0.0 to 1.0.\n\
                 Answer with a JSON array only: \
                 [{\"item_id\": \"<id>\", \"priority_score\": <0.0-1.0>, \"reasoning\": \"<short>\"}]\n\n",
            ),
            ClassifyMode::Stance => {
                if let Some(trend) = &self.trend {
                    out.push_str(&format!("Trend: {trend}\n"));
                }
                out.push_str(
                    "For each item decide whether it supports, opposes or is neutral toward the trend.\n\
                     Answer with a JSON array only: \
                     [{\"item_id\": \"<id>\", \"stance\": \"supporting|opposing|neutral\", \
                     \"confidence\": <0.0-1.0>, \"reasoning\": \"<short>\"}]\n\n",
                )
            }
        }
        for (i, item) in items.iter().enumerate() {
            let body: String = item.body.chars().take(limit).collect();
            out.push_str(&format!(
                "{}. id: {}\n   title: {}\n   body: {}\n",
                i + 1,
                item.id,
                item.title,
                body
            ));
        }
        out
    }
}

fn default_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}
fn default_base_url() -> String {
    ANTHROPIC_API_URL.to_string()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_api_key() -> String {
    "ENV".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Literal key, or "ENV" to read ANTHROPIC_API_KEY.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            model: default_model(),
            base_url: default_base_url(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl ServiceConfig {
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if self.api_key == "ENV" {
            match std::env::var("ANTHROPIC_API_KEY") {
                Ok(k) if !k.trim().is_empty() => Ok(k),
                _ => Err(ConfigError::MissingEnv("ANTHROPIC_API_KEY".into())),
            }
        } else {
            Ok(self.api_key.clone())
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

pub struct AnthropicService {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicService {
    pub fn new(cfg: &ServiceConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_key: cfg.resolve_api_key()?,
            model: cfg.model.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            max_tokens: cfg.max_tokens,
        })
    }

    fn headers(&self) -> Result<HeaderMap, ServiceError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| ServiceError::Transport(format!("invalid api key header: {e}")))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl ClassificationService for AnthropicService {
    async fn submit(&self, payload: &str) -> Result<String, ServiceError> {
        let url = format!("{}/messages", self.base_url);
        let req = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: payload,
            }],
        };
        tracing::debug!(target: "classify", model = %self.model, bytes = payload.len(), "messages request");

        let resp = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&req)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ServiceError::from_status(status.as_u16()));
        }
        let body: MessagesResponse = resp.json().await.map_err(map_reqwest)?;
        let text: String = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

fn map_reqwest(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout
    } else if let Some(status) = e.status() {
        ServiceError::from_status(status.as_u16())
    } else {
        ServiceError::Transport(e.to_string())
    }
}
