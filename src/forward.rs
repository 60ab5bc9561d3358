//! Upstream HTTP forwarding.
//!
//! The core receives an already-parsed [`ProxyRequest`] from the outer
//! layer and writes the client-visible response through a [`ClientSink`];
//! it never owns a listener. [`UpstreamForwarder`] performs one attempt
//! against one endpoint: clone the request, rewrite authentication, send it
//! through the process-wide transport, and map the outcome onto the error
//! taxonomy.
//!
//! # Header rewriting
//!
//! - The client's `Authorization` is always stripped.
//! - A resolved bearer token is injected as `Authorization: Bearer <token>`.
//! - A resolved api key is injected as `x-api-key`.
//! - Endpoint-configured extra headers are merged last and win.
//!
//! Everything else passes through untouched, body included.

use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, HOST};
use reqwest::Method;
use tokio_util::sync::CancellationToken;

use crate::config::ProxySettings;
use crate::endpoint::EndpointConfig;
use crate::error::{RelayError, RelayResult};
use crate::logging::{log_debug, log_warn};

/// Header carrying the injected api key.
pub const API_KEY_HEADER: &str = "x-api-key";

// ============================================================================
// Inbound contract
// ============================================================================

/// An inbound request as handed over by the outer HTTP layer.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Original path, leading slash included.
    pub path: String,
    /// Original query string without the `?`, if any.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    pub user_agent: String,
}

impl ProxyRequest {
    /// Whether the request body declares `"stream": true`.
    pub fn wants_stream(&self) -> bool {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
            .unwrap_or(false)
    }

    /// The upstream URL for this request against the given endpoint.
    pub fn target_url(&self, endpoint_url: &str) -> String {
        match &self.query {
            Some(query) => format!("{}{}?{}", endpoint_url, self.path, query),
            None => format!("{}{}", endpoint_url, self.path),
        }
    }
}

/// Where the client-visible response goes. Implemented by the outer HTTP
/// layer; `flush` is invoked at SSE event boundaries so clients see events
/// without additional buffering.
#[async_trait]
pub trait ClientSink: Send {
    /// Write the response line and headers. Called at most once.
    async fn start_response(&mut self, status: u16, headers: &HeaderMap) -> RelayResult<()>;

    /// Relay one chunk of body bytes.
    async fn write_chunk(&mut self, chunk: Bytes) -> RelayResult<()>;

    /// Push buffered bytes to the client.
    async fn flush(&mut self) -> RelayResult<()>;
}

/// One successful upstream exchange, before the body is consumed.
pub struct UpstreamResponse {
    pub response: reqwest::Response,
    /// True when the response must flow through the stream processor.
    pub is_streaming: bool,
}

// ============================================================================
// Forwarder
// ============================================================================

/// Performs single attempts against endpoints over the shared transport.
pub struct UpstreamForwarder {
    client: reqwest::Client,
}

impl UpstreamForwarder {
    /// Build the process-wide transport, honouring the outbound proxy
    /// settings (http, https, or socks5, with optional basic auth).
    pub fn build_client(proxy: &ProxySettings) -> RelayResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if let Some(url) = proxy.effective_url() {
            let mut proxy_config = reqwest::Proxy::all(&url)
                .map_err(|e| RelayError::config_error(format!("invalid proxy url {url}: {e}")))?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                proxy_config = proxy_config.basic_auth(user, pass);
            }
            builder = builder.proxy(proxy_config);
            log_debug!(proxy_url = %url, "Outbound proxy configured");
        }
        builder
            .build()
            .map_err(|e| RelayError::config_error(format!("failed to build HTTP client: {e}")))
    }

    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Perform one attempt against one endpoint.
    ///
    /// Buffered requests honour the endpoint timeout for the whole
    /// exchange; requests that declare `stream=true` get no read deadline
    /// (idle enforcement happens per-chunk in the stream processor).
    pub async fn attempt(
        &self,
        request: &ProxyRequest,
        endpoint: &EndpointConfig,
        token: Option<&str>,
        api_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> RelayResult<UpstreamResponse> {
        let url = request.target_url(&endpoint.url);
        let headers = build_upstream_headers(request, endpoint, token, api_key)?;
        let wants_stream = request.wants_stream();

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone());
        if !wants_stream {
            builder = builder.timeout(endpoint.timeout);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            result = builder.send() => {
                result.map_err(|e| classify_transport_error(e, endpoint))?
            }
        };

        let status = response.status();
        if status.is_success() {
            let is_streaming = wants_stream || is_event_stream(response.headers());
            log_debug!(
                endpoint = %endpoint.name,
                status = status.as_u16(),
                streaming = is_streaming,
                "Upstream attempt succeeded"
            );
            return Ok(UpstreamResponse {
                response,
                is_streaming,
            });
        }

        let code = status.as_u16();
        match code {
            429 => {
                let retry_after = extract_retry_after(response.headers());
                Err(RelayError::rate_limited(retry_after))
            }
            401 | 403 => {
                let body = response.bytes().await.unwrap_or_default();
                Err(RelayError::auth(code, body))
            }
            400..=499 => {
                let body = response.bytes().await.unwrap_or_default();
                Err(RelayError::upstream(code, body))
            }
            _ => {
                let body = response.bytes().await.unwrap_or_default();
                log_warn!(
                    endpoint = %endpoint.name,
                    status = code,
                    "Upstream returned a server error"
                );
                Err(RelayError::network(
                    format!(
                        "upstream HTTP {code}: {}",
                        String::from_utf8_lossy(&body[..body.len().min(200)])
                    ),
                    None,
                ))
            }
        }
    }
}

/// Whether the response headers declare an SSE body.
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

fn classify_transport_error(error: reqwest::Error, endpoint: &EndpointConfig) -> RelayError {
    if error.is_timeout() {
        RelayError::timeout(endpoint.timeout.as_secs())
    } else {
        RelayError::network(
            format!("request to {} failed: {error}", endpoint.name),
            Some(Box::new(error)),
        )
    }
}

fn extract_retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get("retry-after")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60)
}

fn build_upstream_headers(
    request: &ProxyRequest,
    endpoint: &EndpointConfig,
    token: Option<&str>,
    api_key: Option<&str>,
) -> RelayResult<HeaderMap> {
    let mut headers = request.headers.clone();
    // The transport recomputes these for the rewritten target.
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    // Client credentials never travel upstream.
    headers.remove(AUTHORIZATION);

    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| RelayError::config_error(format!("invalid bearer token: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }
    if let Some(api_key) = api_key {
        let value = HeaderValue::from_str(api_key)
            .map_err(|e| RelayError::config_error(format!("invalid api key: {e}")))?;
        headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
    }
    for (name, value) in &endpoint.extra_headers {
        let name = HeaderName::from_str(name)
            .map_err(|e| RelayError::config_error(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RelayError::config_error(format!("invalid header value: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
