//! Error types for the vision SDK.
//!
//! Every variant carries enough context (host/port, URL, path, status code,
//! body snippet) to diagnose a failure without reading the source.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Maximum number of body bytes kept in error messages.
const SNIPPET_LEN: usize = 256;

/// Main error type for the vision SDK.
#[derive(Debug, Error)]
pub enum VisionError {
    // Process lifecycle errors
    #[error("Failed to start server {executable}: {message}")]
    StartFailed {
        executable: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Server at {host}:{port} did not become ready within {timeout:?}")]
    StartTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("Project not found at {0}")]
    ProjectNotFound(PathBuf),

    #[error("No server installation found under {searched}")]
    InstallationNotFound { searched: PathBuf },

    #[error("Server installation does not exist at {0}")]
    InstallationMissing(PathBuf),

    #[error("Failed to stop server process {pid}: {message}")]
    ShutdownFailed { pid: u32, message: String },

    #[error("Instance {host}:{port} is not running")]
    InstanceNotRunning { host: String, port: u16 },

    // Transport errors
    #[error("Network error on {url} after {attempts} attempt(s): {message}")]
    TransientNetwork {
        url: String,
        attempts: u32,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Analysis failed on {url} with status {status}: {body}")]
    AnalysisFailed {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {url} ({body_len} bytes): {message}; body starts with {snippet:?}")]
    InvalidResponse {
        url: String,
        message: String,
        body_len: usize,
        snippet: String,
    },

    // Input errors
    #[error("Invalid response type: {0}")]
    InvalidResponseType(String),

    #[error("Invalid image: {message}")]
    InvalidImage { message: String },

    // Resource errors
    #[error("Shared memory error on {name}: {message}")]
    SharedMemory {
        name: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for vision SDK operations.
pub type Result<T> = std::result::Result<T, VisionError>;

impl From<std::io::Error> for VisionError {
    fn from(err: std::io::Error) -> Self {
        VisionError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for VisionError {
    fn from(err: serde_json::Error) -> Self {
        VisionError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl VisionError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        VisionError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create an invalid-response error, keeping a short snippet of the body.
    pub fn invalid_response(url: &str, message: impl Into<String>, body: &[u8]) -> Self {
        let end = body.len().min(SNIPPET_LEN);
        VisionError::InvalidResponse {
            url: url.to_string(),
            message: message.into(),
            body_len: body.len(),
            snippet: String::from_utf8_lossy(&body[..end]).into_owned(),
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VisionError::TransientNetwork { .. })
    }

    /// Record the number of attempts on a network error. Other errors pass through.
    pub fn with_attempts(self, attempts: u32) -> Self {
        match self {
            VisionError::TransientNetwork {
                url,
                message,
                source,
                ..
            } => VisionError::TransientNetwork {
                url,
                attempts,
                message,
                source,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VisionError::InstanceNotRunning {
            host: "127.0.0.1".into(),
            port: 8000,
        };
        assert_eq!(err.to_string(), "Instance 127.0.0.1:8000 is not running");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(VisionError::TransientNetwork {
            url: "http://127.0.0.1:1/ping".into(),
            attempts: 1,
            message: "connection refused".into(),
            source: None,
        }
        .is_retryable());
        assert!(!VisionError::AnalysisFailed {
            url: "http://127.0.0.1:1/analyze_image".into(),
            status: 500,
            body: "{}".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_invalid_response_snippet_is_bounded() {
        let body = vec![b'x'; 1000];
        match VisionError::invalid_response("http://h/a", "bad", &body) {
            VisionError::InvalidResponse {
                body_len, snippet, ..
            } => {
                assert_eq!(body_len, 1000);
                assert_eq!(snippet.len(), SNIPPET_LEN);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
