//! Client for an image analysis server.
//!
//! The crate starts a local server for a project (or attaches to one that is
//! already running), sends images to it and returns the analysis context
//! together with an optional result image.
//!
//! # Architecture
//!
//! - [`Instance`] - facade owning the server process, transport and shared memory
//! - [`process`] - installation discovery, spawning and readiness polling
//! - [`transport`] - pooled HTTP client with retries and response demultiplexing
//! - [`shm`] - shared memory fast path for a co-located server
//! - [`version`] - server version parsing and capability gating
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use vision_sdk::{Instance, InstanceConfig, ResponseType};
//!
//! # async fn run() -> vision_sdk::Result<()> {
//! let mut instance = Instance::new(InstanceConfig::local("/data/my-project")).await?;
//! let result = instance
//!     .analyze(Path::new("/data/part.png"), ResponseType::AnnotatedImage)
//!     .await?;
//! println!("{:?}", result.get("result"));
//! instance.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod input;
mod instance;
pub mod net;
pub mod platform;
pub mod process;
pub mod result;
pub mod shm;
pub mod transport;
pub mod version;

pub use config::{NetworkConfig, ProcessConfig, SharedMemoryConfig};
pub use context::{Context, FullContext};
pub use error::{Result, VisionError};
pub use input::{ImageInput, RawImage};
pub use instance::{Instance, InstanceConfig, InstanceState};
pub use result::{AnalysisResult, ImageCodec};
#[cfg(feature = "codec")]
pub use result::StandardCodec;
pub use shm::{SharedMemoryChannel, ShmReference};
pub use transport::{AnalyzeOptions, ResponseType, RetryConfig, TransportClient};
pub use version::{supports_shared_memory, Capabilities, Capability, ServerVersion};
