//! Retrying HTTP client used by the search adapters.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// Quota (429) and provider-side (5xx) statuses are worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub initial_backoff: Duration,
    /// Also caps a server-sent `Retry-After`.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_backoff: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Pause before retry number `retry` (0-based): doubles each time, never above the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let doubled = self
            .initial_backoff
            .checked_mul(2u32.saturating_pow(retry))
            .unwrap_or(self.backoff_cap);
        doubled.min(self.backoff_cap)
    }

    fn pause_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff(retry);
        match retry_after {
            Some(hint) => hint.max(backoff).min(self.backoff_cap),
            None => backoff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout. The whole search call is bounded separately by the caller.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{endpoint} answered {status}")]
    Status { status: u16, endpoint: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

enum Attempt {
    Done(Vec<u8>),
    Retry {
        error: FetchError,
        retry_after: Option<Duration>,
    },
    Fail(FetchError),
}

/// GET-only client for JSON search APIs. Requests are sent one at a time by the
/// caller; this type only adds timeouts, compression and retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            client: builder.build().context("building search http client")?,
            retry: config.retry,
        })
    }

    /// Body of a successful GET. The query string is never logged or put in errors,
    /// since search APIs carry their key there.
    pub async fn get_body(&self, provider: &str, url: Url) -> Result<Vec<u8>, FetchError> {
        let endpoint = format!("{}{}", url.origin().ascii_serialization(), url.path());
        let span = info_span!("http_fetch", provider, endpoint = %endpoint);
        async {
            let mut retry = 0u32;
            loop {
                match self.attempt(&url, &endpoint).await {
                    Attempt::Done(body) => return Ok(body),
                    Attempt::Fail(error) => return Err(error),
                    Attempt::Retry { error, .. } if retry >= self.retry.retries => return Err(error),
                    Attempt::Retry { error, retry_after } => {
                        let pause = self.retry.pause_for(retry, retry_after);
                        debug!(error = %error, retry, pause_ms = pause.as_millis() as u64, "retrying search request");
                        tokio::time::sleep(pause).await;
                        retry += 1;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &Url, endpoint: &str) -> Attempt {
        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(err) => {
                let retryable = is_retryable_error(&err);
                let error = FetchError::Request(err.without_url());
                return if retryable {
                    Attempt::Retry {
                        error,
                        retry_after: None,
                    }
                } else {
                    Attempt::Fail(error)
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.bytes().await {
                Ok(body) => Attempt::Done(body.to_vec()),
                Err(err) => Attempt::Fail(FetchError::Request(err.without_url())),
            };
        }

        let error = FetchError::Status {
            status: status.as_u16(),
            endpoint: endpoint.to_string(),
        };
        if is_retryable_status(status) {
            Attempt::Retry {
                error,
                retry_after: retry_after(&response),
            }
        } else {
            Attempt::Fail(error)
        }
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            retries: 5,
            initial_backoff: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(1),
        };
        let pauses: Vec<_> = (0..4).map(|r| policy.backoff(r).as_millis()).collect();
        assert_eq!(pauses, vec![250, 500, 1000, 1000]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn retry_after_hint_is_honoured_but_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.pause_for(0, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(policy.pause_for(0, Some(Duration::from_secs(60))), policy.backoff_cap);
        assert_eq!(policy.pause_for(1, Some(Duration::ZERO)), Duration::from_secs(1));
    }

    #[test]
    fn quota_and_server_errors_are_retryable() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn status_errors_expose_code_without_query() {
        let err = FetchError::Status {
            status: 403,
            endpoint: "https://search.example/v1".into(),
        };
        assert_eq!(err.status(), Some(403));
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "https://search.example/v1 answered 403");
    }

    #[test]
    fn client_builds_with_user_agent() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("fitrec-test/0.1".into()),
            retry: RetryPolicy::none(),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
