//! Detection geometry and the event types that flow between pipeline stages.

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::classes::DefectClass;

/// Axis-aligned box in pixel corner coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection-over-union with `other`. Degenerate boxes yield 0.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    pub fn corners(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// Unfiltered model output for one candidate box.
#[derive(Debug, Clone, Copy)]
pub struct RawDetection {
    pub class_id: i64,
    pub confidence: f32,
    pub bbox: BBox,
}

/// A defect observation that survived aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub class: DefectClass,
    pub confidence: f32,
    pub bbox: BBox,
    pub timestamp_ms: i64,
}

/// Admitted event queued for persistence.
#[derive(Debug, Clone)]
pub struct DefectLogEntry {
    pub class: DefectClass,
    pub confidence: f32,
    pub bbox: BBox,
    pub timestamp_ms: i64,
    pub frame_number: u64,
}

impl DefectLogEntry {
    pub fn from_event(event: &DetectionEvent, frame_number: u64) -> Self {
        Self {
            class: event.class,
            confidence: event.confidence,
            bbox: event.bbox,
            timestamp_ms: event.timestamp_ms,
            frame_number,
        }
    }

    /// Document shape written to the defect store.
    pub fn document(&self) -> DefectDocument {
        let timestamp = Utc
            .timestamp_millis_opt(self.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        DefectDocument {
            defect_type: self.class.slug().to_string(),
            defect_type_display: self.class.display_name().to_string(),
            confidence: self.confidence,
            bbox: self.bbox.corners(),
            timestamp,
        }
    }
}

/// Serialized form of a defect event in the document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefectDocument {
    pub defect_type: String,
    pub defect_type_display: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
    pub timestamp: String,
}
