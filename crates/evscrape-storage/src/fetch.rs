use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use crate::BackoffPolicy;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A listing or detail page as handed to a source adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    /// URL after redirects; relative links resolve against this.
    pub final_url: String,
    pub status: u16,
    pub body: String,
}

impl FetchedPage {
    /// Page whose body did not come over the network (fixtures, tests).
    pub fn from_text(url: impl Into<String>, body: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            status: 200,
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Throttling, server errors, timeouts and refused connections are worth
    /// another attempt; anything else will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building page fetcher client")?,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_page(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("fetch_page", source_id, url);
        async {
            let mut attempt = 0;
            loop {
                match self.get_once(url).await {
                    Err(err) if err.is_retryable() && attempt < self.backoff.max_retries => {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, ?delay, error = %err, "page fetch failed; retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    other => return other,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = response.text().await?;
        debug!(bytes = body.len(), %final_url, "page fetched");
        Ok(FetchedPage {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            body,
        })
    }
}
