//! Typed view of the context mapping returned by the server.
//!
//! The raw mapping is always available on [`AnalysisResult`](crate::AnalysisResult);
//! these models are an opt-in, stricter reading of it.

use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Position of a detected object, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: u32,
    pub width: u32,
}

/// Context returned when processing is turned off in the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BareContext {
    pub error: bool,
    pub image_shape: ImageShape,
    pub processing: bool,
    pub processing_time: f64,
    pub save: bool,
}

/// Kind of module that produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleType {
    Unsupervised,
    Supervised,
    Classifier,
    Detector,
    Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassName {
    pub id: i64,
    pub confidence: i64,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_bgr: Option<Vec<u8>>,
}

/// Module that produced a detected rectangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RectangleSource {
    pub model_id: i64,
    pub module_id: i64,
    #[serde(rename = "type")]
    pub module_type: ModuleType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedRectangle {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    pub class_names: Vec<ClassName>,
    pub confidence: f64,
    pub id: i64,
    pub source: RectangleSource,
}

impl DetectedRectangle {
    pub fn position(&self) -> Position {
        Position {
            x: self.x,
            y: self.y,
        }
    }
}

/// Line measured by the Measure tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedLine {
    pub start: Position,
    pub end: Position,
    pub angle: f64,
    pub width: f64,
    pub length: f64,
    pub id: i64,
    pub label: String,
    pub method: String,
    pub percent: bool,
}

/// Context returned when processing is turned on in the project.
///
/// Keys not modelled here are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullContext {
    pub error: bool,
    pub image_shape: ImageShape,
    pub processing: bool,
    pub processing_time: f64,
    pub save: bool,

    #[serde(default)]
    pub data: String,

    #[serde(default)]
    pub complete_time: f64,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub global_data: Map<String, Value>,
    #[serde(default)]
    pub operator_input: Map<String, Value>,
    #[serde(rename = "production_mode", default)]
    pub production_mode: bool,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub surface_classes: Vec<ClassName>,

    #[serde(default)]
    pub angle: Option<f64>,
    #[serde(default)]
    pub detected_rectangles: Vec<DetectedRectangle>,
    #[serde(default)]
    pub lines: Vec<DetectedLine>,

    pub result: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Context of one analysis, chosen by its `processing` flag.
#[derive(Debug, Clone, PartialEq)]
pub enum Context {
    Bare(BareContext),
    Full(Box<FullContext>),
}

impl Context {
    /// Read a raw context mapping into the matching model.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let processing = match map.get("processing") {
            Some(Value::Bool(flag)) => *flag,
            Some(other) => {
                return Err(VisionError::Json {
                    message: format!("context key \"processing\" is {}, expected a boolean", other),
                    source: None,
                })
            }
            None => {
                return Err(VisionError::Json {
                    message: "context has no \"processing\" key".to_string(),
                    source: None,
                })
            }
        };

        let value = Value::Object(map.clone());
        if processing {
            Ok(Context::Full(Box::new(serde_json::from_value(value)?)))
        } else {
            Ok(Context::Bare(serde_json::from_value(value)?))
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, Context::Full(_))
    }

    pub fn image_shape(&self) -> ImageShape {
        match self {
            Context::Bare(ctx) => ctx.image_shape,
            Context::Full(ctx) => ctx.image_shape,
        }
    }

    /// Evaluation result, if processing ran.
    pub fn result(&self) -> Option<bool> {
        match self {
            Context::Bare(_) => None,
            Context::Full(ctx) => Some(ctx.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_bare_context() {
        let map = as_map(json!({
            "error": false,
            "imageShape": {"height": 480, "width": 640},
            "processing": false,
            "processingTime": 0.01,
            "save": false
        }));
        let ctx = Context::from_map(&map).unwrap();
        assert!(!ctx.is_processed());
        assert_eq!(ctx.image_shape(), ImageShape { height: 480, width: 640 });
        assert_eq!(ctx.result(), None);
    }

    #[test]
    fn test_bare_context_rejects_unknown_keys() {
        let map = as_map(json!({
            "error": false,
            "imageShape": {"height": 1, "width": 1},
            "processing": false,
            "processingTime": 0.01,
            "save": false,
            "score": 3
        }));
        assert!(matches!(Context::from_map(&map), Err(VisionError::Json { .. })));
    }

    #[test]
    fn test_full_context() {
        let map = as_map(json!({
            "error": false,
            "imageShape": {"height": 100, "width": 200},
            "processing": true,
            "processingTime": 0.2,
            "save": true,
            "data": "lot-7",
            "completeTime": 0.25,
            "errors": [],
            "stderr": "",
            "stdout": "",
            "globalData": {},
            "operatorInput": {},
            "production_mode": true,
            "score": 1.5,
            "threshold": 0.5,
            "surfaceClasses": [],
            "angle": null,
            "detectedRectangles": [{
                "x": 10, "y": 20.5, "width": 30, "height": 40, "rotate": 0.0,
                "classNames": [{"id": 1, "confidence": 98, "label": "scratch", "color": "#ff0000"}],
                "confidence": 0.98,
                "id": 7,
                "source": {"modelId": 2, "moduleId": 3, "type": "DETECTOR"}
            }],
            "lines": [],
            "result": false,
            "customKey": 42
        }));

        let ctx = match Context::from_map(&map).unwrap() {
            Context::Full(ctx) => ctx,
            other => panic!("expected full context, got {other:?}"),
        };
        assert!(ctx.production_mode);
        assert_eq!(ctx.data, "lot-7");
        assert_eq!(ctx.detected_rectangles.len(), 1);
        let rect = &ctx.detected_rectangles[0];
        assert_eq!(rect.position(), Position { x: 10.0, y: 20.5 });
        assert_eq!(rect.class_names[0].label, "scratch");
        assert_eq!(rect.source.module_type, ModuleType::Detector);
        assert_eq!(ctx.extra.get("customKey"), Some(&json!(42)));
    }

    #[test]
    fn test_missing_processing_flag() {
        let map = as_map(json!({"result": true}));
        assert!(Context::from_map(&map).is_err());
    }
}
