use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::{FeedscopeError, Result};

const ACCEPT_FEEDS: &str =
    "application/rss+xml, application/atom+xml, application/rdf+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";

/// Downloads feed documents with a hard per-request deadline.
#[derive(Clone)]
pub struct FeedFetcher {
    client: Client,
    timeout: Duration,
}

impl FeedFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FeedscopeError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    pub fn from_config(config: &common::Config) -> Result<Self> {
        Self::new(&config.user_agent(), config.fetch_timeout())
    }

    /// Fetch the raw document at `url`. The in-flight request is dropped when
    /// the deadline passes. Any non-2xx status is a failure.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let request = async {
            let response = self
                .client
                .get(url)
                .header("Accept", ACCEPT_FEEDS)
                .send()
                .await
                .map_err(|e| FeedscopeError::Fetch(format!("{}: {}", url, e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FeedscopeError::Fetch(format!("{} returned {}", url, status)));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| FeedscopeError::Fetch(format!("{}: failed to read body: {}", url, e)))?;
            Ok::<_, FeedscopeError>(bytes.to_vec())
        };

        let bytes = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| FeedscopeError::Fetch(format!("{} timed out after {:?}", url, self.timeout)))??;

        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }
}
