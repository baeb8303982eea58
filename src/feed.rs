//! Decision feed: the source of new and expired decisions.

use crate::decision::{Decision, DecisionBatch, Scope};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Feed error.
#[derive(Debug)]
pub enum FeedError {
    /// HTTP transport failure.
    Http(reqwest::Error),
    /// Non-success HTTP status.
    Status { status: u16, body: String },
    /// Feed misconfigured (bad URL or key).
    Config(String),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Http(e) => write!(f, "HTTP error: {}", e),
            FeedError::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            FeedError::Config(msg) => write!(f, "Invalid feed configuration: {}", msg),
        }
    }
}

impl std::error::Error for FeedError {}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        FeedError::Http(e)
    }
}

/// A source of decision batches.
#[async_trait]
pub trait DecisionFeed: Send {
    /// Wait for the next batch. `None` means the feed is exhausted; an
    /// error ends it too.
    async fn next_batch(&mut self) -> Result<Option<DecisionBatch>, FeedError>;
}

/// Decision stream response body.
#[derive(Debug, Default, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    new: Option<Vec<WireDecision>>,
    #[serde(default)]
    deleted: Option<Vec<WireDecision>>,
}

#[derive(Debug, Deserialize)]
struct WireDecision {
    scope: String,
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(default)]
    scenario: String,
}

impl StreamResponse {
    fn into_batch(self) -> DecisionBatch {
        DecisionBatch {
            new: convert(self.new.unwrap_or_default()),
            expired: convert(self.deleted.unwrap_or_default()),
        }
    }
}

fn convert(decisions: Vec<WireDecision>) -> Vec<Arc<Decision>> {
    decisions
        .into_iter()
        .filter_map(|d| match Scope::parse(&d.scope) {
            Some(scope) => Some(Arc::new(Decision::new(scope, &d.kind, &d.value, &d.scenario))),
            None => {
                debug!(scope = %d.scope, value = %d.value, "Dropping decision with unsupported scope");
                None
            }
        })
        .collect()
}

/// Polls the CrowdSec local API decision stream.
pub struct LapiStream {
    client: Client,
    url: String,
    api_key: String,
    interval: Duration,
    startup: bool,
    polled: bool,
}

impl LapiStream {
    pub fn new(
        lapi_url: &str,
        api_key: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, FeedError> {
        if api_key.is_empty() {
            return Err(FeedError::Config("empty API key".to_string()));
        }
        let url = reqwest::Url::parse(lapi_url)
            .map_err(|e| FeedError::Config(format!("{}: {}", lapi_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cloudflare-ban-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: url.as_str().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            interval,
            startup: true,
            polled: false,
        })
    }

    fn stream_url(&self) -> String {
        format!("{}/v1/decisions/stream?startup={}", self.url, self.startup)
    }

    async fn poll(&self) -> Result<StreamResponse, FeedError> {
        let response = self
            .client
            .get(self.stream_url())
            .header("X-Api-Key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Status { status, body });
        }

        // An empty stream answers with `null` fields, or an empty body on
        // some versions.
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(StreamResponse::default());
        }
        serde_json::from_str(&body).map_err(|e| FeedError::Status {
            status: 200,
            body: format!("invalid decision stream body: {}", e),
        })
    }
}

#[async_trait]
impl DecisionFeed for LapiStream {
    async fn next_batch(&mut self) -> Result<Option<DecisionBatch>, FeedError> {
        loop {
            if self.polled {
                tokio::time::sleep(self.interval).await;
            }
            self.polled = true;

            match self.poll().await {
                Ok(response) => {
                    let batch = response.into_batch();
                    if self.startup {
                        info!(decisions = batch.len(), "Received initial decision stream");
                    } else {
                        debug!(new = batch.new.len(), expired = batch.expired.len(), "Polled decision stream");
                    }
                    self.startup = false;
                    return Ok(Some(batch));
                }
                Err(e) => {
                    warn!(error = %e, startup = self.startup, "Failed to poll decision stream, retrying");
                }
            }
        }
    }
}
