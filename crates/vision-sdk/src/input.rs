//! Image inputs accepted by `Instance::analyze`.
//!
//! Everything is reduced to a byte payload before it reaches the transport:
//! files and encoded bytes are sent as-is, raw pixel buffers travel either in
//! the request body or through shared memory.

use crate::error::{Result, VisionError};
use bytes::Bytes;
use rand::Rng;
use std::path::{Path, PathBuf};

/// An uncompressed 8-bit image, row-major with interleaved channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    width: u32,
    height: u32,
    channels: u8,
    pixels: Bytes,
}

impl RawImage {
    /// Create a raw image, checking that the buffer matches the shape.
    pub fn new(width: u32, height: u32, channels: u8, pixels: impl Into<Bytes>) -> Result<Self> {
        let pixels = pixels.into();
        if !matches!(channels, 1 | 3 | 4) {
            return Err(VisionError::InvalidImage {
                message: format!("unsupported channel count {}", channels),
            });
        }
        if width == 0 || height == 0 {
            return Err(VisionError::InvalidImage {
                message: format!("empty image {}x{}", width, height),
            });
        }
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected {
            return Err(VisionError::InvalidImage {
                message: format!(
                    "{}x{}x{} image needs {} bytes, got {}",
                    width,
                    height,
                    channels,
                    expected,
                    pixels.len()
                ),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            pixels,
        })
    }

    /// Fill an image of the given shape with uniformly random bytes.
    pub fn random<R: Rng>(rng: &mut R, width: u32, height: u32, channels: u8) -> Result<Self> {
        let mut pixels = vec![0u8; width as usize * height as usize * channels as usize];
        rng.fill(&mut pixels[..]);
        Self::new(width, height, channels, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub(crate) fn pixel_bytes(&self) -> Bytes {
        self.pixels.clone()
    }
}

/// Image to analyze.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Path to an encoded image file (PNG, JPEG, ...).
    Path(PathBuf),
    /// Encoded image bytes.
    Encoded(Bytes),
    /// Uncompressed pixels.
    Raw(RawImage),
}

impl ImageInput {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        ImageInput::Path(path.as_ref().to_path_buf())
    }

    /// Resolve file inputs into encoded bytes.
    pub(crate) async fn load(self) -> Result<LoadedImage> {
        match self {
            ImageInput::Path(path) => {
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| VisionError::io_with_path(e, &path))?;
                Ok(LoadedImage::Encoded(Bytes::from(data)))
            }
            ImageInput::Encoded(bytes) => Ok(LoadedImage::Encoded(bytes)),
            ImageInput::Raw(raw) => Ok(LoadedImage::Raw(raw)),
        }
    }
}

impl From<RawImage> for ImageInput {
    fn from(raw: RawImage) -> Self {
        ImageInput::Raw(raw)
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        ImageInput::Encoded(Bytes::from(bytes))
    }
}

impl From<Bytes> for ImageInput {
    fn from(bytes: Bytes) -> Self {
        ImageInput::Encoded(bytes)
    }
}

impl From<&[u8]> for ImageInput {
    fn from(bytes: &[u8]) -> Self {
        ImageInput::Encoded(Bytes::copy_from_slice(bytes))
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        ImageInput::Path(path)
    }
}

impl From<&Path> for ImageInput {
    fn from(path: &Path) -> Self {
        ImageInput::Path(path.to_path_buf())
    }
}

/// Image after file loading, ready for the transport.
#[derive(Debug, Clone)]
pub(crate) enum LoadedImage {
    Encoded(Bytes),
    Raw(RawImage),
}
