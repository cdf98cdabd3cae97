use serde::{Deserialize, Serialize};
use video_ingest::SessionId;

/// Axis-aligned box in session-resolution pixels, serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One recognised object as reported by the detection service.
///
/// Values are taken as the service produced them: confidence is expected in
/// `[0, 1]` and `x1 <= x2`, `y1 <= y2`, neither is re-checked here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<i64>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
            class_id: None,
        }
    }

    /// Confidence as a whole percentage, rounded to nearest.
    pub fn confidence_percent(&self) -> i64 {
        (self.confidence * 100.0).round() as i64
    }

    /// Overlay caption, e.g. `BOTTLE 93%`.
    pub fn caption(&self) -> String {
        format!("{} {}%", self.label.to_uppercase(), self.confidence_percent())
    }
}

/// Detections for one sampled frame, tagged with the frame's session and
/// sequence number so stale responses can be recognised.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResult {
    #[serde(serialize_with = "serialize_session")]
    pub session: SessionId,
    pub sequence: u64,
    pub detections: Vec<Detection>,
}

fn serialize_session<S: serde::Serializer>(id: &SessionId, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(id.get())
}
