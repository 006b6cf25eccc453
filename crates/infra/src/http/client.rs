//! HTTP client with bounded retry and rate-limit handling.
//!
//! Shared by all source API clients: timeouts, exponential backoff with a
//! little jitter on transport errors and 5xx responses, and 429 handling
//! that sleeps for the server-provided `Retry-After` before retrying.

use std::time::Duration;

use inflow_domain::{InflowError, Result};
use rand::Rng;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tokio::time::sleep;
use tracing::{info, warn};

/// Default ceiling for a single `Retry-After` sleep.
const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Wrapper around [`reqwest::Client`] with retry policy.
pub struct HttpClient {
    inner: reqwest::Client,
    max_attempts: u32,
    retry_base: Duration,
    max_retry_after: Duration,
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    timeout: Duration,
    max_attempts: u32,
    retry_base: Duration,
    max_retry_after: Duration,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }
}

impl HttpClientBuilder {
    /// Per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total attempts per request (first try included).
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Base delay of the exponential retry backoff.
    pub fn retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let inner = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| InflowError::Internal(format!("failed to build http client: {err}")))?;

        Ok(HttpClient {
            inner,
            max_attempts: self.max_attempts,
            retry_base: self.retry_base,
            max_retry_after: self.max_retry_after,
        })
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Start building a request; finish with [`HttpClient::send`].
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.inner.request(method, url)
    }

    /// Send with the retry policy. The final response is returned whatever
    /// its status; callers decide how to map non-success codes.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        if request.try_clone().is_none() {
            // Streaming bodies cannot be replayed; single shot.
            return request
                .send()
                .await
                .map_err(|err| InflowError::Network(err.to_string()));
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let current = match request.try_clone() {
                Some(clone) => clone,
                None => return Err(InflowError::Internal("request became non-cloneable".into())),
            };

            match current.send().await {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= self.max_attempts {
                        return Ok(response);
                    }
                    let delay = self.retry_after(&response);
                    warn!(delay_secs = delay.as_secs(), "rate limited, waiting before retry");
                    sleep(delay).await;
                }
                Ok(response)
                    if response.status().is_server_error() && attempt < self.max_attempts =>
                {
                    let delay = self.backoff(attempt);
                    warn!(
                        status = response.status().as_u16(),
                        delay_ms = delay.as_millis() as u64,
                        "server error, retrying"
                    );
                    sleep(delay).await;
                }
                Ok(response) => return Ok(response),
                Err(err)
                    if (err.is_connect() || err.is_timeout()) && attempt < self.max_attempts =>
                {
                    let delay = self.backoff(attempt);
                    info!(error = %err, delay_ms = delay.as_millis() as u64, "transport error, retrying");
                    sleep(delay).await;
                }
                Err(err) => return Err(InflowError::Network(err.to_string())),
            }
        }
    }

    /// Sleep duration demanded by a 429, capped.
    fn retry_after(&self, response: &Response) -> Duration {
        let seconds = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(60);
        Duration::from_secs(seconds).min(self.max_retry_after)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(8);
        let base = self.retry_base.saturating_mul(1 << exp);
        let jitter_ms = rand::thread_rng().gen_range(0..250);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Map a non-success response into a domain error with the status class
/// preserved. 404 maps to `NotFound` so normalizers can turn it into a
/// delete sentinel.
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("{url} returned status {status}")
    } else {
        let preview: String = body.chars().take(2000).collect();
        format!("{url} returned status {status}: {preview}")
    };

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InflowError::Auth(message),
        StatusCode::NOT_FOUND => InflowError::NotFound(message),
        _ => InflowError::Network(message),
    })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(max_attempts: u32) -> HttpClient {
        HttpClient::builder()
            .timeout(Duration::from_secs(2))
            .max_attempts(max_attempts)
            .retry_base(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn returns_response_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fine"))
            .mount(&server)
            .await;

        let client = client(3);
        let response =
            client.send(client.request(Method::GET, &format!("{}/ok", server.uri()))).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client(3);
        let response = client
            .send(client.request(Method::GET, &format!("{}/flaky", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn honours_retry_after_on_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client(3);
        let response = client
            .send(client.request(Method::GET, &format!("{}/limited", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client(2);
        let response = client
            .send(client.request(Method::GET, &format!("{}/down", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn ensure_success_maps_status_classes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/secret"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client(1);
        let missing = client
            .send(client.request(Method::GET, &format!("{}/missing", server.uri())))
            .await
            .unwrap();
        assert!(matches!(ensure_success(missing).await, Err(InflowError::NotFound(_))));

        let secret = client
            .send(client.request(Method::GET, &format!("{}/secret", server.uri())))
            .await
            .unwrap();
        assert!(matches!(ensure_success(secret).await, Err(InflowError::Auth(_))));
    }
}
