//! Retrying HTTP GET for provider APIs and bulk downloads.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delay before retry `retry` (0-based), capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let factor = 2u32.checked_pow(retry as u32).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Longest a `fetch_bytes` call can take when every attempt runs into
    /// `request_timeout`: all attempts plus the sleeps between them.
    pub fn attempt_budget(&self, request_timeout: Duration) -> Duration {
        let attempts = u32::try_from(self.max_retries.saturating_add(1)).unwrap_or(u32::MAX);
        let sleeps = (0..self.max_retries)
            .map(|retry| self.delay_for_retry(retry))
            .fold(Duration::ZERO, Duration::saturating_add);
        request_timeout.saturating_mul(attempts).saturating_add(sleeps)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout, body included.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests allowed in flight across all providers.
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    /// Server errors, throttling, timeouts and refused connections are
    /// worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::Closed => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            backoff: config.backoff,
        })
    }

    /// GET `url?query`, retrying transient failures with exponential backoff.
    pub async fn fetch_bytes(
        &self,
        provider: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", provider, url);
        async {
            let mut retry = 0;
            loop {
                match self.attempt(url, query).await {
                    Ok(response) => {
                        debug!(bytes = response.body.len(), retries = retry, "fetched");
                        return Ok(response);
                    }
                    Err(err) if err.is_transient() && retry < self.backoff.max_retries => {
                        let delay = self.backoff.delay_for_retry(retry);
                        warn!(error = %err, retry, delay_ms = delay.as_millis() as u64, "transient fetch failure; retrying");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = response.bytes().await?.to_vec();
        Ok(FetchedResponse { final_url, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        let delays = (0..6).map(|r| policy.delay_for_retry(r).as_millis()).collect::<Vec<_>>();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
        assert_eq!(policy.delay_for_retry(64), Duration::from_secs(3));
    }

    #[test]
    fn attempt_budget_covers_every_retry_and_sleep() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        };
        // 4 x 60s requests + 0.5s + 1s + 2s of backoff
        assert_eq!(
            policy.attempt_budget(Duration::from_secs(60)),
            Duration::from_millis(243_500)
        );

        let no_retries = BackoffPolicy {
            max_retries: 0,
            ..policy
        };
        assert_eq!(no_retries.attempt_budget(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn only_server_side_statuses_are_retried() {
        let status = |status| FetchError::HttpStatus {
            status,
            url: "https://api.open-meteo.com/v1/forecast".to_string(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(400).is_transient());
        assert!(!FetchError::Closed.is_transient());
    }
}
