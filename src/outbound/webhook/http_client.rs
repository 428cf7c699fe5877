use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, redirect};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use super::schemas::{DeliveryResponse, RenderedRequest};

/// Response bodies are kept for audit up to this size.
pub const MAX_RESPONSE_BODY: usize = 64 * 1024;

/// Error type for HTTP client operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpClientError {
    #[error("HTTP client setup failed: {0}")]
    Setup(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timeout after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),
}

impl HttpClientError {
    /// Transport problems may resolve on their own; a malformed request won't.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::RequestFailed(_)
        )
    }

    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_connect() {
            Self::Network(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::RequestFailed(err.to_string())
        }
    }
}

/// HTTP client wrapper for webhook delivery
///
/// Holds one client that verifies TLS certificates and one that does not,
/// picked per subscription. Redirects are never followed so that a 3xx is
/// reported as-is.
#[derive(Debug, Clone)]
pub struct WebhookHttpClient {
    verified: Client,
    insecure: Client,
}

impl WebhookHttpClient {
    pub fn new(user_agent: &str) -> Result<Self, HttpClientError> {
        let build = |accept_invalid: bool| {
            Client::builder()
                .user_agent(user_agent)
                .redirect(redirect::Policy::none())
                .danger_accept_invalid_certs(accept_invalid)
                .build()
                .map_err(|e| HttpClientError::Setup(e.to_string()))
        };

        Ok(Self {
            verified: build(false)?,
            insecure: build(true)?,
        })
    }

    /// Send a frozen request.
    ///
    /// Any HTTP response, whatever its status, is `Ok`; classifying the
    /// status is up to the caller.
    pub async fn send(
        &self,
        request: &RenderedRequest,
        timeout: Duration,
        verify_ssl: bool,
    ) -> Result<DeliveryResponse, HttpClientError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HttpClientError::InvalidRequest(format!("method {}", request.method)))?;
        let headers = header_map(&request.headers)?;
        let client = if verify_ssl {
            &self.verified
        } else {
            &self.insecure
        };

        debug!(url = %request.url, method = %method, "Sending webhook");
        let start = Instant::now();

        let response = client
            .request(method, &request.url)
            .headers(headers)
            .timeout(timeout)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                warn!(url = %request.url, error = %e, "Webhook request failed");
                HttpClientError::from_reqwest(e, timeout)
            })?;

        let status_code = response.status().as_u16();
        let headers = response_headers(&response);
        let body = read_response_body(response, timeout).await?;
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        debug!(
            url = %request.url,
            status_code,
            latency_ms,
            "Webhook response received"
        );

        Ok(DeliveryResponse {
            status_code,
            headers,
            body,
            latency_ms,
        })
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, HttpClientError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HttpClientError::InvalidRequest(format!("header name {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| HttpClientError::InvalidRequest(format!("header value for {name}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn response_headers(response: &Response) -> BTreeMap<String, String> {
    response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Read the response body, keeping at most [`MAX_RESPONSE_BODY`] bytes.
async fn read_response_body(
    mut response: Response,
    timeout: Duration,
) -> Result<String, HttpClientError> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| HttpClientError::from_reqwest(e, timeout))?
    {
        let room = MAX_RESPONSE_BODY - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            debug!(max_size = MAX_RESPONSE_BODY, "Response body truncated");
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}
