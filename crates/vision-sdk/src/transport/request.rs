//! Analyze request model and query construction.

use crate::error::VisionError;
use crate::shm::ShmReference;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What the server sends back alongside the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Context only, no image.
    #[default]
    Context,
    /// The processed image.
    Image,
    /// The processed image with detected rectangles drawn on it.
    AnnotatedImage,
    /// Layered heatmaps of the processed image.
    Heatmap,
}

impl ResponseType {
    pub const ALL: [ResponseType; 4] = [
        ResponseType::Context,
        ResponseType::Image,
        ResponseType::AnnotatedImage,
        ResponseType::Heatmap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Context => "context",
            ResponseType::Image => "image",
            ResponseType::AnnotatedImage => "annotated_image",
            ResponseType::Heatmap => "heatmap",
        }
    }

    /// Whether the server returns an image for this response type.
    pub fn has_image(&self) -> bool {
        !matches!(self, ResponseType::Context)
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseType {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResponseType::ALL
            .into_iter()
            .find(|rt| rt.as_str() == s)
            .ok_or_else(|| VisionError::InvalidResponseType(s.to_string()))
    }
}

/// Per-call options for `Instance::analyze`.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub response_type: ResponseType,
    /// Free-form string the project sees under the `"data"` context key.
    pub data: Option<String>,
    /// Extra query parameters forwarded to the server.
    pub extra_params: Vec<(String, String)>,
    /// Overrides the instance's request timeout.
    pub timeout: Option<Duration>,
}

impl AnalyzeOptions {
    pub fn new(response_type: ResponseType) -> Self {
        Self {
            response_type,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<ResponseType> for AnalyzeOptions {
    fn from(response_type: ResponseType) -> Self {
        Self::new(response_type)
    }
}

/// Server endpoint for an analyze call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Encoded image (PNG, JPEG, ...) in the body.
    AnalyzeImage,
    /// Raw pixels in the body.
    AnalyzeRawImage,
    /// Raw pixels in a shared memory segment.
    AnalyzeSharedMemory,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::AnalyzeImage => "analyze_image",
            Endpoint::AnalyzeRawImage => "analyze_raw_image",
            Endpoint::AnalyzeSharedMemory => "analyze_image_shared_memory",
        }
    }
}

/// How the image reaches the server.
#[derive(Debug, Clone)]
pub enum Payload {
    Encoded(Bytes),
    Raw { width: u32, height: u32, pixels: Bytes },
    SharedMemory { width: u32, height: u32, reference: ShmReference },
}

impl Payload {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Payload::Encoded(_) => Endpoint::AnalyzeImage,
            Payload::Raw { .. } => Endpoint::AnalyzeRawImage,
            Payload::SharedMemory { .. } => Endpoint::AnalyzeSharedMemory,
        }
    }

    /// Bytes sent in the request body.
    pub fn body(&self) -> Bytes {
        match self {
            Payload::Encoded(bytes) => bytes.clone(),
            Payload::Raw { pixels, .. } => pixels.clone(),
            Payload::SharedMemory { .. } => Bytes::new(),
        }
    }
}

/// One analyze call, transient.
#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub payload: Payload,
    pub options: AnalyzeOptions,
    /// Ask the server to put the context in the body instead of a header.
    pub context_in_body: bool,
}

impl AnalyzeRequest {
    /// Query parameters in the order the server documents them.
    pub fn query(&self) -> Vec<(String, String)> {
        let mut query = vec![(
            "response_type".to_string(),
            self.options.response_type.as_str().to_string(),
        )];

        if let Some(data) = &self.options.data {
            query.push(("data".to_string(), data.clone()));
        }

        match &self.payload {
            Payload::Encoded(_) => {}
            Payload::Raw { width, height, .. } => {
                query.push(("height".to_string(), height.to_string()));
                query.push(("width".to_string(), width.to_string()));
            }
            Payload::SharedMemory {
                width,
                height,
                reference,
            } => {
                query.push(("height".to_string(), height.to_string()));
                query.push(("width".to_string(), width.to_string()));
                query.push(("name".to_string(), reference.name.clone()));
                query.push(("shm_length".to_string(), reference.length.to_string()));
                query.push(("shm_generation".to_string(), reference.generation.to_string()));
            }
        }

        query.extend(self.options.extra_params.iter().cloned());

        if self.context_in_body {
            query.push(("context_in_body".to_string(), String::new()));
        }
        query
    }
}
