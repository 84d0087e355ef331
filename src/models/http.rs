//! Shared HTTP plumbing for the vendor adapters.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::{detect_mime_type, HealthStatus};

pub struct HttpBackend {
    provider: String,
    client: Client,
    timeout: Duration,
    max_retries: usize,
}

impl HttpBackend {
    pub fn new(provider: impl Into<String>, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| Error::model_provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            provider: provider.into(),
            client,
            timeout,
            max_retries: max_retries as usize,
        })
    }

    /// Sends a request, retrying only connection failures. Anything the
    /// server actually answered is returned or mapped on the first try.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_secs(1))
            .map(jitter)
            .take(self.max_retries);

        let response = RetryIf::spawn(
            strategy,
            || build(&self.client).send(),
            |e: &reqwest::Error| {
                let retry = e.is_connect();
                if retry {
                    debug!("Connection to {} failed, retrying: {}", self.provider, e);
                }
                retry
            },
        )
        .await
        .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        warn!("{} API error: {} - {}", self.provider, status, body);
        Err(status_error(&self.provider, status, &body, self.timeout))
    }

    pub async fn post_json<B, R>(&self, url: &str, headers: &HeaderMap, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .send(|client| client.post(url).headers(headers.clone()).json(body))
            .await?;
        self.parse(response).await
    }

    pub async fn get_json<R: DeserializeOwned>(&self, url: &str, headers: &HeaderMap) -> Result<R> {
        let response = self.send(|client| client.get(url).headers(headers.clone())).await?;
        self.parse(response).await
    }

    /// GETs `url` and reports reachability as a health status.
    pub async fn probe(&self, url: &str, headers: &HeaderMap) -> HealthStatus {
        let start_time = Instant::now();
        match self.send(|client| client.get(url).headers(headers.clone())).await {
            Ok(_) => HealthStatus::healthy(start_time.elapsed().as_millis() as u64),
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }

    async fn parse<R: DeserializeOwned>(&self, response: Response) -> Result<R> {
        response
            .json::<R>()
            .await
            .map_err(|e| Error::model_provider(format!("Failed to parse {} response: {}", self.provider, e)))
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                provider: self.provider.clone(),
                seconds: self.timeout.as_secs(),
            }
        } else {
            Error::model_provider(format!("Request to {} failed: {}", self.provider, e))
        }
    }
}

/// Maps a non-success HTTP status onto the shared error taxonomy.
pub fn status_error(provider: &str, status: StatusCode, body: &str, timeout: Duration) -> Error {
    match status.as_u16() {
        401 | 403 => Error::authentication(provider, format!("{}: {}", status, body)),
        429 => Error::rate_limited(provider, body),
        408 | 504 => Error::Timeout {
            provider: provider.to_string(),
            seconds: timeout.as_secs(),
        },
        400 | 413 | 415 | 422 => {
            Error::invalid_input(format!("{} rejected the request ({}): {}", provider, status, body))
        }
        _ => Error::model_provider(format!("{} API error {}: {}", provider, status, body)),
    }
}

/// MIME type and base64 payload for an inline image part.
pub fn encode_image(bytes: &[u8]) -> (&'static str, String) {
    (detect_mime_type(bytes), STANDARD.encode(bytes))
}

pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_status_mapping() {
        let timeout = Duration::from_secs(30);
        let kind = |code: u16| {
            status_error("gemini", StatusCode::from_u16(code).unwrap(), "body", timeout).kind()
        };

        assert_eq!(kind(401), ErrorKind::Authentication);
        assert_eq!(kind(403), ErrorKind::Authentication);
        assert_eq!(kind(429), ErrorKind::RateLimitExceeded);
        assert_eq!(kind(408), ErrorKind::Timeout);
        assert_eq!(kind(504), ErrorKind::Timeout);
        assert_eq!(kind(400), ErrorKind::InvalidInput);
        assert_eq!(kind(413), ErrorKind::InvalidInput);
        assert_eq!(kind(500), ErrorKind::Transient);
        assert_eq!(kind(503), ErrorKind::Transient);
    }

    #[test]
    fn test_encode_image_and_join_url() {
        let (mime, data) = encode_image(&[0x89, b'P', b'N', b'G']);
        assert_eq!(mime, "image/png");
        assert_eq!(data, "iVBORw==");

        assert_eq!(join_url("http://localhost:11434/", "/api/tags"), "http://localhost:11434/api/tags");
    }

    #[tokio::test]
    async fn test_server_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::new("gemini", Duration::from_secs(5), 3).unwrap();
        let result: Result<serde_json::Value> = backend
            .get_json(&format!("{}/models", server.uri()), &HeaderMap::new())
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = HttpBackend::new("ollama", Duration::from_secs(2), 2).unwrap();
        let status = backend.probe(&format!("http://{}/api/tags", addr), &HeaderMap::new()).await;
        assert!(!status.is_healthy);

        let result: Result<serde_json::Value> = backend
            .get_json(&format!("http://{}/api/tags", addr), &HeaderMap::new())
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transient);
    }
}
