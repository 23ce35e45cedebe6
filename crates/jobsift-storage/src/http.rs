//! One-attempt HTTP helpers. They classify failures into [`TaskFailure`] and
//! leave retries, pacing and concurrency to the [`crate::RequestQueue`].

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info_span, Instrument};

use crate::queue::{RetryDisposition, TaskFailure};

/// Body marker Apify returns once the account's monthly budget is spent.
pub const HARD_LIMIT_MARKER: &str = "Monthly usage hard limit exceeded";

const MAX_ERROR_BODY: usize = 300;

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

/// Maps a non-success response to the failure the queue acts on.
pub fn failure_for_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> TaskFailure {
    let excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("http {} {}", status.as_u16(), excerpt.trim());

    if status == StatusCode::PAYMENT_REQUIRED || body.contains(HARD_LIMIT_MARKER) {
        return TaskFailure::QuotaExhausted(message);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return TaskFailure::RateLimited {
            retry_after,
            message,
        };
    }
    match classify_status(status) {
        RetryDisposition::Retryable => TaskFailure::Transient(message),
        RetryDisposition::NonRetryable => TaskFailure::Permanent(message),
    }
}

pub fn failure_for_error(err: &reqwest::Error) -> TaskFailure {
    match classify_reqwest_error(err) {
        RetryDisposition::Retryable => TaskFailure::Transient(err.to_string()),
        RetryDisposition::NonRetryable => TaskFailure::Permanent(err.to_string()),
    }
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, TaskFailure> {
        let span = info_span!("http_fetch", method = "GET", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| failure_for_error(&e))?;
            read_text(resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, bearer: Option<&str>) -> Result<T, TaskFailure> {
        let span = info_span!("http_fetch", method = "GET", url);
        async {
            let mut req = self.client.get(url);
            if let Some(token) = bearer {
                req = req.bearer_auth(token);
            }
            let resp = req.send().await.map_err(|e| failure_for_error(&e))?;
            decode_json(&read_text(resp).await?)
        }
        .instrument(span)
        .await
    }

    pub async fn post_json<B, T>(&self, url: &str, bearer: Option<&str>, body: &B) -> Result<T, TaskFailure>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let span = info_span!("http_fetch", method = "POST", url);
        async {
            let mut req = self.client.post(url).json(body);
            if let Some(token) = bearer {
                req = req.bearer_auth(token);
            }
            let resp = req.send().await.map_err(|e| failure_for_error(&e))?;
            decode_json(&read_text(resp).await?)
        }
        .instrument(span)
        .await
    }
}

async fn read_text(resp: reqwest::Response) -> Result<String, TaskFailure> {
    let status = resp.status();
    let retry_after = parse_retry_after(resp.headers());
    let body = resp.text().await.map_err(|e| failure_for_error(&e))?;
    debug!(status = status.as_u16(), bytes = body.len(), "http response");
    if status.is_success() {
        Ok(body)
    } else {
        Err(failure_for_status(status, retry_after, &body))
    }
}

fn decode_json<T: DeserializeOwned>(body: &str) -> Result<T, TaskFailure> {
    serde_json::from_str(body).map_err(|e| TaskFailure::Permanent(format!("invalid json response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn server_errors_and_429_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn hard_limit_body_maps_to_quota_exhausted() {
        let failure = failure_for_status(
            StatusCode::FORBIDDEN,
            None,
            r#"{"error":{"type":"platform-feature-disabled","message":"Monthly usage hard limit exceeded"}}"#,
        );
        assert!(matches!(failure, TaskFailure::QuotaExhausted(_)));
        assert!(matches!(
            failure_for_status(StatusCode::PAYMENT_REQUIRED, None, ""),
            TaskFailure::QuotaExhausted(_)
        ));
    }

    #[test]
    fn rate_limits_carry_the_retry_after_hint() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        let hint = parse_retry_after(&headers);
        assert_eq!(hint, Some(Duration::from_secs(12)));
        assert_eq!(
            failure_for_status(StatusCode::TOO_MANY_REQUESTS, hint, "slow down"),
            TaskFailure::RateLimited {
                retry_after: Some(Duration::from_secs(12)),
                message: "http 429 slow down".into(),
            }
        );

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(matches!(
            failure_for_status(StatusCode::BAD_REQUEST, None, "bad input"),
            TaskFailure::Permanent(_)
        ));
        assert!(matches!(
            failure_for_status(StatusCode::SERVICE_UNAVAILABLE, None, ""),
            TaskFailure::Transient(_)
        ));
    }

    #[test]
    fn malformed_json_is_permanent() {
        let result: Result<serde_json::Value, _> = decode_json("<html>");
        assert!(matches!(result, Err(TaskFailure::Permanent(_))));
    }
}
