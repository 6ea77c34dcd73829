//! Per-call analysis result with lazy image decoding.

use crate::context::Context;
use crate::error::{Result, VisionError};
use crate::input::RawImage;
use crate::transport::{ContextMap, RawResponse};
use bytes::Bytes;
use serde_json::Value;

/// Decodes encoded image bytes (PNG, JPEG, ...) into pixels.
pub trait ImageCodec {
    fn decode(&self, bytes: &[u8]) -> Result<RawImage>;
}

/// Codec backed by the `image` crate. Produces RGB, RGBA or grayscale pixels
/// depending on the source image.
#[cfg(feature = "codec")]
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

#[cfg(feature = "codec")]
impl ImageCodec for StandardCodec {
    fn decode(&self, bytes: &[u8]) -> Result<RawImage> {
        let decoded = ::image::load_from_memory(bytes).map_err(|e| VisionError::InvalidImage {
            message: format!("cannot decode image: {}", e),
        })?;
        let (width, height) = (decoded.width(), decoded.height());
        let color = decoded.color();

        if color.has_alpha() {
            RawImage::new(width, height, 4, decoded.into_rgba8().into_raw())
        } else if color.channel_count() == 1 {
            RawImage::new(width, height, 1, decoded.into_luma8().into_raw())
        } else {
            RawImage::new(width, height, 3, decoded.into_rgb8().into_raw())
        }
    }
}

/// Result of one successful `analyze` call.
///
/// Holds the context mapping and, for image-bearing response types, the
/// encoded image exactly as the server sent it. Decoding never touches the
/// stored bytes, so it can be repeated.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    context: ContextMap,
    image_bytes: Option<Bytes>,
}

impl AnalysisResult {
    pub fn new(context: ContextMap, image_bytes: Option<Bytes>) -> Self {
        Self {
            context,
            image_bytes,
        }
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    /// Look up one context key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Encoded image bytes, if the server returned an image.
    pub fn image_bytes(&self) -> Option<&[u8]> {
        self.image_bytes.as_deref()
    }

    pub fn has_image(&self) -> bool {
        self.image_bytes.is_some()
    }

    /// Deserialize the context into the typed model.
    pub fn typed_context(&self) -> Result<Context> {
        Context::from_map(&self.context)
    }

    /// Decode the image with a caller-provided codec.
    pub fn decode_image_with(&self, codec: &dyn ImageCodec) -> Result<RawImage> {
        let bytes = self.image_bytes.as_deref().ok_or_else(|| VisionError::InvalidImage {
            message: "result carries no image; request an image response type".to_string(),
        })?;
        codec.decode(bytes)
    }

    /// Decode the image with [`StandardCodec`].
    #[cfg(feature = "codec")]
    pub fn get_decoded_image(&self) -> Result<RawImage> {
        self.decode_image_with(&StandardCodec)
    }

    pub fn into_parts(self) -> (ContextMap, Option<Bytes>) {
        (self.context, self.image_bytes)
    }
}

impl From<RawResponse> for AnalysisResult {
    fn from(response: RawResponse) -> Self {
        Self::new(response.context, response.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ContextMap {
        match json!({"processing": false, "error": false}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    struct FixedCodec;

    impl ImageCodec for FixedCodec {
        fn decode(&self, bytes: &[u8]) -> Result<RawImage> {
            RawImage::new(bytes.len() as u32, 1, 1, bytes.to_vec())
        }
    }

    #[test]
    fn test_context_only_result() {
        let result = AnalysisResult::new(context(), None);
        assert!(!result.has_image());
        assert_eq!(result.get("processing"), Some(&json!(false)));
        assert!(matches!(
            result.decode_image_with(&FixedCodec),
            Err(VisionError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_decoding_is_repeatable() {
        let result = AnalysisResult::new(context(), Some(Bytes::from_static(b"abc")));
        let first = result.decode_image_with(&FixedCodec).unwrap();
        let second = result.decode_image_with(&FixedCodec).unwrap();
        assert_eq!(first, second);
        assert_eq!(result.image_bytes(), Some(&b"abc"[..]));
    }

    #[cfg(feature = "codec")]
    #[test]
    fn test_standard_codec_decodes_png() {
        use std::io::Cursor;

        let mut source = ::image::RgbImage::new(3, 2);
        source.put_pixel(2, 1, ::image::Rgb([10, 20, 30]));
        let mut png = Vec::new();
        ::image::DynamicImage::ImageRgb8(source)
            .write_to(&mut Cursor::new(&mut png), ::image::ImageFormat::Png)
            .unwrap();

        let result = AnalysisResult::new(context(), Some(Bytes::from(png)));
        let decoded = result.get_decoded_image().unwrap();
        assert_eq!((decoded.width(), decoded.height(), decoded.channels()), (3, 2, 3));
        assert_eq!(&decoded.pixels()[15..18], &[10, 20, 30]);
    }

    #[cfg(feature = "codec")]
    #[test]
    fn test_standard_codec_rejects_garbage() {
        let result = AnalysisResult::new(context(), Some(Bytes::from_static(b"not an image")));
        assert!(matches!(
            result.get_decoded_image(),
            Err(VisionError::InvalidImage { .. })
        ));
    }
}
