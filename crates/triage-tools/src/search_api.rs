//! HTTP search API client
//!
//! Talks to a support-article search service exposing
//! `GET {base}/search?q=...&k=...` and returning ranked passages.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

#[derive(Clone)]
pub struct SearchClient {
    client: reqwest::Client,
    base_url: Arc<String>,
    api_key: Option<Arc<String>>,
}

impl SearchClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("Triage/0.1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: Arc::new(base_url.into().trim_end_matches('/').to_string()),
            api_key: api_key.map(Arc::new),
        })
    }

    /// Fetch at most `k` passages for a query, best first
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchPassage>, SearchError> {
        let url = format!("{}/search", self.base_url);

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[("q", query.to_string()), ("k", k.to_string())]);

        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SearchError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let body: SearchResponse = response.json().await?;
        debug!("Search returned {} passages", body.results.len());
        Ok(body.ranked(k))
    }
}

impl std::fmt::Debug for SearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchPassage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchPassage {
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
    #[serde(default)]
    pub score: Option<f32>,
}

impl SearchResponse {
    /// Order by score (unscored results keep their position after scored ones) and truncate
    pub fn ranked(mut self, k: usize) -> Vec<SearchPassage> {
        self.results.sort_by(|a, b| match (a.score, b.score) {
            (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        self.results.truncate(k);
        self.results
    }
}

impl SearchPassage {
    pub fn format(&self) -> String {
        match &self.title {
            Some(title) if !title.is_empty() => format!("{}: {}", title, self.text),
            _ => self.text.clone(),
        }
    }
}
