//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Retries are not done here: callers such as the pending-transaction poller
//! own their schedule and only need failures classified. Connect errors and
//! 5xx/429 answers become `NetworkUnavailable`, elapsed deadlines become
//! `Timeout`, and bodies that are not a JSON-RPC response become
//! `MalformedResponse`.

use std::time::Duration;

use async_trait::async_trait;
use podkit_core::error::TransportError;
use podkit_core::request::{JsonRpcRequest, JsonRpcResponse};
use podkit_core::transport::RpcTransport;
use podkit_core::SdkConfig;
use reqwest::StatusCode;

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpClientConfig {
    pub fn from_sdk(config: &SdkConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.http_timeout_ms),
        }
    }
}

pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            request_timeout: config.request_timeout,
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, HttpClientConfig::default())
    }

    /// Endpoint and timeout taken from an `SdkConfig`.
    pub fn from_sdk(config: &SdkConfig) -> Result<Self, TransportError> {
        Self::new(config.network.rpc_url.clone(), HttpClientConfig::from_sdk(config))
    }

    fn classify(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else if e.is_decode() {
            TransportError::MalformedResponse(e.to_string())
        } else {
            TransportError::NetworkUnavailable(e.to_string())
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        tracing::trace!(method = %req.method, id = %req.id, url = %self.url, "sending request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), method = %req.method, url = %self.url, "request failed");
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                TransportError::NetworkUnavailable(format!("HTTP {status}: {body}"))
            } else {
                TransportError::Other(format!("HTTP {status}: {body}"))
            });
        }

        let body = resp.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice::<JsonRpcResponse>(&body).map_err(|e| {
            TransportError::MalformedResponse(format!("invalid JSON-RPC response to {}: {e}", req.method))
        })
    }

    fn url(&self) -> &str {
        &self.url
    }
}
