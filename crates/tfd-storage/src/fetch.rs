use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are worth another attempt; every other non-success status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Doubling delay between attempts, capped at `max_delay`.
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
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry number `attempt + 1`, or `None` once retries are spent.
    fn next_delay(&self, disposition: RetryDisposition, attempt: usize) -> Option<Duration> {
        (disposition == RetryDisposition::Retryable && attempt < self.max_retries)
            .then(|| self.delay_for_attempt(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// GET client for the provider export; transient failures are retried with backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            backoff: config.backoff,
        })
    }

    /// Response body of a successful GET.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0usize;
        loop {
            let err = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => FetchError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: resp.url().to_string(),
                },
                Err(err) => FetchError::Request(err),
            };

            let disposition = match &err {
                FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                    .map(classify_status)
                    .unwrap_or(RetryDisposition::NonRetryable),
                FetchError::Request(inner) => classify_reqwest_error(inner),
            };
            let Some(delay) = self.backoff.next_delay(disposition, attempt) else {
                return Err(err);
            };
            warn!(error = %err, attempt, ?delay, "retrying export request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_from_half_a_second_up_to_ten() {
        let policy = BackoffPolicy::default();
        let delays = (0..3)
            .map(|attempt| policy.delay_for_attempt(attempt))
            .collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ]
        );
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(10));
    }

    #[test]
    fn retries_stop_after_the_budget() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.next_delay(RetryDisposition::Retryable, 2),
            Some(Duration::from_secs(2))
        );
        assert_eq!(policy.next_delay(RetryDisposition::Retryable, 3), None);
        assert_eq!(policy.next_delay(RetryDisposition::NonRetryable, 0), None);
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }
}
