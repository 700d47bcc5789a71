//! HTTP range fetcher with retry and exponential backoff.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, instrument, warn};

use super::{slice_to_range, RangeFetcher};
use crate::config::HttpFetcherConfig;
use crate::error::BoxError;
use crate::types::ByteRange;

/// Fetches byte ranges with HTTP `Range` requests.
///
/// Transient failures (connection errors, 5xx, 429) are retried with
/// exponential backoff. Other 4xx responses fail immediately.
pub struct HttpRangeFetcher {
    client: Client,
    config: HttpFetcherConfig,
}

impl HttpRangeFetcher {
    /// Create a new fetcher with the given configuration.
    pub fn new(config: HttpFetcherConfig) -> Result<Self, BoxError> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(8)
            .tcp_nodelay(true)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { client, config })
    }

    /// Create a fetcher configured from the environment.
    pub fn from_env() -> Result<Self, BoxError> {
        Self::new(HttpFetcherConfig::from_env())
    }

    async fn fetch_once(&self, url: &str, range: ByteRange) -> Result<Bytes, Attempt> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, range.header_value())
            .send()
            .await
            .map_err(|e| Attempt::Retryable(e.into()))?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => response
                .bytes()
                .await
                .map_err(|e| Attempt::Retryable(e.into())),
            StatusCode::OK => {
                // Server ignored the Range header
                debug!(url = %url, "Server returned full body for ranged request");
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| Attempt::Retryable(e.into()))?;
                Ok(slice_to_range(body, range))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                Err(Attempt::Retryable(format!("HTTP error: {}", status).into()))
            }
            status => Err(Attempt::Fatal(format!("HTTP error: {}", status).into())),
        }
    }
}

enum Attempt {
    Retryable(BoxError),
    Fatal(BoxError),
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    #[instrument(skip_all, fields(url = %url, range = %range))]
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, BoxError> {
        let mut retry_count = 0;

        loop {
            match self.fetch_once(url, range).await {
                Ok(bytes) => {
                    debug!(bytes = bytes.len(), "Fetched range");
                    return Ok(bytes);
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retryable(e)) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        return Err(format!(
                            "request failed after {} retries: {}",
                            self.config.max_retries, e
                        )
                        .into());
                    }

                    let delay = self.config.retry_delay(retry_count);
                    warn!(
                        error = %e,
                        retry = retry_count,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Range request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
