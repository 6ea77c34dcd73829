//! HTTP transport to the analysis server.
//!
//! One [`TransportClient`] per instance wraps a pooled `reqwest::Client`, so
//! repeated analyze calls reuse their connections. Analyze calls are retried on
//! transient network failures only; any HTTP status the server returns is final.

mod request;
mod response;
mod retry;

pub use request::{AnalyzeOptions, AnalyzeRequest, Endpoint, Payload, ResponseType};
pub use response::{parse_response, ContextMap, RawResponse, CONTEXT_BASE64_HEADER, IMAGE_LEN_HEADER};
pub use retry::{Backoff, RetryConfig};

use retry::with_retries;

use crate::config::{NetworkConfig, ProcessConfig};
use crate::error::{Result, VisionError};
use crate::net;
use crate::version::ServerVersion;
use reqwest::{header, Client, Response};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pooled HTTP client bound to one server address.
#[derive(Debug, Clone)]
pub struct TransportClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
    retry: RetryConfig,
}

impl TransportClient {
    /// Create a client for `host:port` with default timeouts and retries.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_config(host, port, NetworkConfig::REQUEST_TIMEOUT, RetryConfig::default())
    }

    /// Create a client with a custom request timeout and retry policy.
    pub fn with_config(
        host: &str,
        port: u16,
        request_timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(NetworkConfig::USER_AGENT)
            .pool_max_idle_per_host(NetworkConfig::POOL_MAX_IDLE_PER_HOST)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| VisionError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: format!("http://{}:{}", net::connect_host(host), port),
            request_timeout,
            retry,
        })
    }

    /// The underlying connection pool.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send one analyze request and split the response.
    pub async fn analyze(&self, request: &AnalyzeRequest) -> Result<RawResponse> {
        let url = self.url(request.payload.endpoint().path());
        let timeout = request.options.timeout.unwrap_or(self.request_timeout);

        with_retries(&self.retry, |attempt| {
            self.analyze_once(&url, request, timeout, attempt)
        })
        .await
    }

    async fn analyze_once(
        &self,
        url: &str,
        request: &AnalyzeRequest,
        timeout: Duration,
        attempt: u32,
    ) -> Result<RawResponse> {
        let body = request.payload.body();
        debug!(
            "POST {} ({} bytes, {}, attempt {})",
            url,
            body.len(),
            request.options.response_type,
            attempt
        );

        let response = self
            .client
            .post(url)
            .query(&request.query())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| network_error(url, e))?;

        let response = check_status(url, response).await?;
        let headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(|e| network_error(url, e))?;

        parse_response(url, &headers, bytes, request.options.response_type)
    }

    /// Check that the server answers `/ping`.
    pub async fn ping(&self) -> Result<()> {
        let url = self.url("ping");
        let response = self
            .client
            .get(&url)
            .timeout(NetworkConfig::PING_TIMEOUT)
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;
        check_status(&url, response).await?;
        Ok(())
    }

    /// Query `/version`.
    ///
    /// A server that answers with an error status (older servers have no
    /// version endpoint) or an unparsable body reports `Unknown`. Only a
    /// network failure is an error, so callers can tell "no answer" apart
    /// from "no version".
    pub async fn server_version(&self) -> Result<ServerVersion> {
        let url = self.url("version");
        let response = self
            .client
            .get(&url)
            .timeout(NetworkConfig::VERSION_TIMEOUT)
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;

        if !response.status().is_success() {
            debug!("{} answered {}, version unknown", url, response.status());
            return Ok(ServerVersion::Unknown);
        }

        let text = response.text().await.map_err(|e| network_error(&url, e))?;
        let version = ServerVersion::parse(text.trim().trim_matches('"'));
        info!("Server at {} reports version {}", self.base_url, version);
        Ok(version)
    }

    /// Ask the server to shut itself down with its stop key.
    pub async fn request_stop(&self, stop_key: &str) -> Result<()> {
        let url = self.url("stop");
        let response = self
            .client
            .get(&url)
            .query(&[("key", stop_key)])
            .timeout(ProcessConfig::STOP_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;

        if !response.status().is_success() {
            warn!("Stop request to {} answered {}", self.base_url, response.status());
        }
        Ok(())
    }
}

/// Map a non-2xx response to `AnalysisFailed`, keeping the body.
async fn check_status(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!("{} answered {}: {}", url, status, body);
    Err(VisionError::AnalysisFailed {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn network_error(url: &str, err: reqwest::Error) -> VisionError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    VisionError::TransientNetwork {
        url: url.to_string(),
        attempts: 1,
        message: format!("{}: {}", kind, err),
        source: Some(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = TransportClient::new("0.0.0.0", 8100).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8100");
        assert_eq!(client.url("/ping"), "http://127.0.0.1:8100/ping");
        assert_eq!(
            client.url(Endpoint::AnalyzeRawImage.path()),
            "http://127.0.0.1:8100/analyze_raw_image"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let port = net::find_free_port().unwrap();
        let client = TransportClient::with_config(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
        .unwrap();

        let request = AnalyzeRequest {
            payload: Payload::Encoded(bytes::Bytes::from_static(b"png")),
            options: AnalyzeOptions::default(),
            context_in_body: false,
        };
        match client.analyze(&request).await.unwrap_err() {
            VisionError::TransientNetwork { attempts, url, .. } => {
                assert_eq!(attempts, 2);
                assert!(url.ends_with("/analyze_image"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(client.ping().await.unwrap_err().is_retryable());
        assert!(client.server_version().await.is_err());
    }
}
