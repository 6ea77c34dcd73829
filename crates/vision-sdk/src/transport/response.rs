//! Demultiplexing analyze responses into context JSON and image bytes.
//!
//! The server frames image-bearing responses in one of three ways, checked in
//! this order:
//!
//! 1. `multipart/*` body: one JSON part plus one binary image part
//! 2. `ImageLen` header: body is the image followed by the context JSON
//! 3. `ContextBase64utf` header: body is the image, context is base64 JSON
//!
//! Anything else is a plain JSON context without an image.

use super::request::ResponseType;
use crate::error::{Result, VisionError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde_json::{Map, Value};

pub const IMAGE_LEN_HEADER: &str = "ImageLen";
pub const CONTEXT_BASE64_HEADER: &str = "ContextBase64utf";

/// Context mapping returned by the server.
pub type ContextMap = Map<String, Value>;

/// A successful response split into its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub context: ContextMap,
    pub image: Option<Bytes>,
}

/// Split a 2xx response body according to the requested response type.
pub fn parse_response(
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
    response_type: ResponseType,
) -> Result<RawResponse> {
    if !response_type.has_image() {
        return Ok(RawResponse {
            context: parse_context(url, &body, &body)?,
            image: None,
        });
    }

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(boundary) = header(CONTENT_TYPE.as_str()).and_then(multipart_boundary) {
        return parse_multipart(url, &body, &boundary);
    }

    if let Some(len) = header(IMAGE_LEN_HEADER) {
        let image_len: usize = len.trim().parse().map_err(|_| {
            VisionError::invalid_response(url, format!("bad {} header {:?}", IMAGE_LEN_HEADER, len), &body)
        })?;
        if image_len > body.len() {
            return Err(VisionError::invalid_response(
                url,
                format!("{} {} exceeds body length", IMAGE_LEN_HEADER, image_len),
                &body,
            ));
        }
        return Ok(RawResponse {
            context: parse_context(url, &body[image_len..], &body)?,
            image: Some(body.slice(..image_len)),
        });
    }

    if let Some(encoded) = header(CONTEXT_BASE64_HEADER) {
        let decoded = STANDARD.decode(encoded.trim()).map_err(|e| {
            VisionError::invalid_response(url, format!("bad {} header: {}", CONTEXT_BASE64_HEADER, e), &body)
        })?;
        return Ok(RawResponse {
            context: parse_context(url, &decoded, &body)?,
            image: Some(body),
        });
    }

    // The server answers with bare context when it produced no image.
    Ok(RawResponse {
        context: parse_context(url, &body, &body)?,
        image: None,
    })
}

fn parse_context(url: &str, json: &[u8], body: &[u8]) -> Result<ContextMap> {
    match serde_json::from_slice::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(VisionError::invalid_response(
            url,
            format!("context is a JSON {}, expected an object", json_kind(&other)),
            body,
        )),
        Err(e) => Err(VisionError::invalid_response(
            url,
            format!("context is not valid JSON: {}", e),
            body,
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Extract the boundary parameter of a `multipart/*` content type.
fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// One body part: its content type and the byte range of its content.
struct Part {
    content_type: Option<String>,
    start: usize,
    end: usize,
}

fn split_parts(body: &[u8], boundary: &str) -> Option<Vec<Part>> {
    let dash = format!("--{}", boundary);
    let delimiter = format!("\r\n--{}", boundary);

    let mut pos = find(body, dash.as_bytes(), 0)? + dash.len();
    let mut parts = Vec::new();

    loop {
        if body[pos..].starts_with(b"--") {
            return Some(parts);
        }
        let region_start = find(body, b"\r\n", pos)? + 2;
        let region_end = find(body, delimiter.as_bytes(), region_start)?;
        let region = &body[region_start..region_end];

        let (head, content_offset) = if region.starts_with(b"\r\n") {
            (&region[..0], 2)
        } else {
            let split = find(region, b"\r\n\r\n", 0)?;
            (&region[..split], split + 4)
        };

        let content_type = String::from_utf8_lossy(head).lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-type")
                .then(|| value.trim().to_ascii_lowercase())
        });

        parts.push(Part {
            content_type,
            start: region_start + content_offset,
            end: region_end,
        });
        pos = region_end + delimiter.len();
    }
}

fn parse_multipart(url: &str, body: &Bytes, boundary: &str) -> Result<RawResponse> {
    let parts = split_parts(body, boundary).ok_or_else(|| {
        VisionError::invalid_response(url, format!("malformed multipart body (boundary {:?})", boundary), body)
    })?;

    let is_json = |p: &Part| p.content_type.as_deref().is_some_and(|ct| ct.contains("json"));

    let context_part = parts
        .iter()
        .find(|p| is_json(p))
        .ok_or_else(|| VisionError::invalid_response(url, "multipart body has no JSON part", body))?;
    let context = parse_context(url, &body[context_part.start..context_part.end], body)?;

    let image = parts
        .iter()
        .find(|p| !is_json(p))
        .map(|p| body.slice(p.start..p.end));

    Ok(RawResponse { context, image })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    const URL: &str = "http://127.0.0.1:8000/analyze_image";

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_context_only() {
        let body = Bytes::from_static(br#"{"result": true, "score": 0.5}"#);
        let parsed = parse_response(URL, &HeaderMap::new(), body, ResponseType::Context).unwrap();
        assert!(parsed.image.is_none());
        assert_eq!(parsed.context["result"], Value::Bool(true));
    }

    #[test]
    fn test_context_must_be_object() {
        let err = parse_response(URL, &HeaderMap::new(), Bytes::from_static(b"[1,2]"), ResponseType::Context)
            .unwrap_err();
        assert!(matches!(err, VisionError::InvalidResponse { body_len: 5, .. }));

        let err = parse_response(URL, &HeaderMap::new(), Bytes::from_static(b"<html>"), ResponseType::Context)
            .unwrap_err();
        assert!(matches!(err, VisionError::InvalidResponse { ref snippet, .. } if snippet == "<html>"));
    }

    #[test]
    fn test_image_len_framing() {
        let mut body = b"\x89PNG-image".to_vec();
        body.extend_from_slice(br#"{"result": false}"#);
        let parsed = parse_response(
            URL,
            &headers(&[("ImageLen", "10")]),
            Bytes::from(body),
            ResponseType::AnnotatedImage,
        )
        .unwrap();
        assert_eq!(parsed.image.as_deref(), Some(&b"\x89PNG-image"[..]));
        assert_eq!(parsed.context["result"], Value::Bool(false));
    }

    #[test]
    fn test_image_len_too_large() {
        let err = parse_response(
            URL,
            &headers(&[("ImageLen", "999")]),
            Bytes::from_static(b"short"),
            ResponseType::Image,
        )
        .unwrap_err();
        assert!(matches!(err, VisionError::InvalidResponse { .. }));
    }

    #[test]
    fn test_base64_header_framing() {
        let encoded = STANDARD.encode(br#"{"score": 3}"#);
        let parsed = parse_response(
            URL,
            &headers(&[("ContextBase64utf", encoded.as_str())]),
            Bytes::from_static(b"image-bytes"),
            ResponseType::Heatmap,
        )
        .unwrap();
        assert_eq!(parsed.image.as_deref(), Some(&b"image-bytes"[..]));
        assert_eq!(parsed.context["score"], Value::from(3));
    }

    #[test]
    fn test_bad_base64_header() {
        let err = parse_response(
            URL,
            &headers(&[("ContextBase64utf", "%%%")]),
            Bytes::from_static(b"image-bytes"),
            ResponseType::Image,
        )
        .unwrap_err();
        assert!(matches!(err, VisionError::InvalidResponse { .. }));
    }

    #[test]
    fn test_image_type_without_image_falls_back_to_json() {
        let parsed = parse_response(
            URL,
            &HeaderMap::new(),
            Bytes::from_static(br#"{"processing": false}"#),
            ResponseType::Image,
        )
        .unwrap();
        assert!(parsed.image.is_none());
    }

    #[test]
    fn test_multipart_framing() {
        let body = b"--XyZ\r\n\
Content-Type: application/json\r\n\r\n\
{\"result\": true}\r\n\
--XyZ\r\n\
Content-Type: image/png\r\n\r\n\
\x89PNG\r\n\x1a\n\x00\x01\r\n\
--XyZ--\r\n";
        let parsed = parse_response(
            URL,
            &headers(&[("content-type", "multipart/mixed; boundary=\"XyZ\"")]),
            Bytes::from_static(body),
            ResponseType::Image,
        )
        .unwrap();
        assert_eq!(parsed.context["result"], Value::Bool(true));
        assert_eq!(parsed.image.as_deref(), Some(&b"\x89PNG\r\n\x1a\n\x00\x01"[..]));
    }

    #[test]
    fn test_multipart_without_json_part() {
        let body = b"--b\r\nContent-Type: image/png\r\n\r\nimg\r\n--b--";
        let err = parse_response(
            URL,
            &headers(&[("content-type", "multipart/mixed; boundary=b")]),
            Bytes::from_static(body),
            ResponseType::Image,
        )
        .unwrap_err();
        assert!(matches!(err, VisionError::InvalidResponse { .. }));
    }

    #[test]
    fn test_truncated_multipart() {
        let body = b"--b\r\nContent-Type: application/json\r\n\r\n{}";
        let err = parse_response(
            URL,
            &headers(&[("content-type", "multipart/mixed; boundary=b")]),
            Bytes::from_static(body),
            ResponseType::Heatmap,
        )
        .unwrap_err();
        assert!(matches!(err, VisionError::InvalidResponse { .. }));
    }

    #[test]
    fn test_multipart_boundary_parsing() {
        assert_eq!(
            multipart_boundary("multipart/mixed; boundary=abc").as_deref(),
            Some("abc")
        );
        assert_eq!(
            multipart_boundary("Multipart/Mixed; charset=utf-8; Boundary=\"q r\"").as_deref(),
            Some("q r")
        );
        assert_eq!(multipart_boundary("application/json"), None);
    }
}
