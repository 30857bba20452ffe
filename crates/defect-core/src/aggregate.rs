//! Collapses raw model output into an ordered set of defect events.

use std::cmp::Ordering;

use thiserror::Error;

use crate::classes::ClassTable;
use crate::detection::{DetectionEvent, RawDetection};

/// Thresholds applied when aggregating one frame's detections.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_per_frame: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            max_per_frame: 5,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("model produced unmapped class id {class_id}")]
    UnknownClass { class_id: i64 },
}

/// Filter, suppress, map, and rank one frame's raw detections.
///
/// In order: drop candidates below the confidence threshold; greedy NMS that
/// suppresses a box whose IoU with an already-kept box of the same class
/// exceeds the threshold; map surviving model ids through the class table
/// (an unmapped id fails the whole call); truncate to the per-frame cap.
///
/// Output is ordered by descending confidence. The sort is stable, so equal
/// confidences keep their input order, which also makes the truncation
/// tie-break deterministic.
pub fn aggregate(
    raw: &[RawDetection],
    table: &ClassTable,
    settings: &AggregatorSettings,
    timestamp_ms: i64,
) -> Result<Vec<DetectionEvent>, AggregateError> {
    let mut candidates: Vec<&RawDetection> = raw
        .iter()
        .filter(|det| det.confidence >= settings.confidence_threshold)
        .collect();

    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<&RawDetection> = Vec::new();
    for det in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == det.class_id && k.bbox.iou(&det.bbox) > settings.iou_threshold
        });
        if !suppressed {
            kept.push(det);
        }
    }

    let mut events = Vec::with_capacity(kept.len().min(settings.max_per_frame));
    for det in kept {
        let class = table
            .lookup(det.class_id)
            .ok_or(AggregateError::UnknownClass {
                class_id: det.class_id,
            })?;
        events.push(DetectionEvent {
            class,
            confidence: det.confidence,
            bbox: det.bbox,
            timestamp_ms,
        });
    }
    events.truncate(settings.max_per_frame);

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::DefectClass;
    use crate::detection::BBox;

    fn det(class_id: i64, confidence: f32, bbox: BBox) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            bbox,
        }
    }

    fn square(origin: f32) -> BBox {
        BBox::new(origin, origin, origin + 10.0, origin + 10.0)
    }

    fn settings() -> AggregatorSettings {
        AggregatorSettings::default()
    }

    fn id_of(class: DefectClass) -> i64 {
        DefectClass::ALL.iter().position(|&c| c == class).unwrap() as i64
    }

    #[test]
    fn below_threshold_detections_are_dropped() {
        let raw = [
            det(0, 0.49, square(0.0)),
            det(1, 0.5, square(100.0)),
            det(2, 0.9, square(200.0)),
        ];
        let events = aggregate(&raw, &ClassTable::builtin(), &settings(), 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].class, DefectClass::Label);
        assert_eq!(events[1].class, DefectClass::Crumbled);
    }

    #[test]
    fn overlapping_same_class_boxes_collapse_to_strongest() {
        let raw = [
            det(0, 0.6, BBox::new(0.0, 0.0, 10.0, 10.0)),
            det(0, 0.9, BBox::new(1.0, 1.0, 11.0, 11.0)),
            det(0, 0.7, BBox::new(0.5, 0.5, 10.5, 10.5)),
        ];
        let events = aggregate(&raw, &ClassTable::builtin(), &settings(), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert!((events[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn overlapping_boxes_of_different_classes_both_survive() {
        let raw = [
            det(0, 0.9, BBox::new(0.0, 0.0, 10.0, 10.0)),
            det(3, 0.8, BBox::new(1.0, 1.0, 11.0, 11.0)),
        ];
        let events = aggregate(&raw, &ClassTable::builtin(), &settings(), 0).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn iou_exactly_at_threshold_is_kept() {
        // Two 10x10 boxes overlapping 6x10: IoU = 60/140 ≈ 0.4286.
        let raw = [
            det(0, 0.9, BBox::new(0.0, 0.0, 10.0, 10.0)),
            det(0, 0.8, BBox::new(4.0, 0.0, 14.0, 10.0)),
        ];
        let mut tuned = settings();
        tuned.iou_threshold = 60.0 / 140.0;
        let events = aggregate(&raw, &ClassTable::builtin(), &tuned, 0).unwrap();
        // Suppression requires IoU strictly above the threshold.
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn seven_survivors_truncate_to_top_five() {
        let raw: Vec<RawDetection> = (0..7)
            .map(|i| {
                det(
                    i64::from(i % 5),
                    0.95 - 0.05 * i as f32,
                    square(i as f32 * 100.0),
                )
            })
            .collect();
        let events = aggregate(&raw, &ClassTable::builtin(), &settings(), 0).unwrap();
        assert_eq!(events.len(), 5);
        for pair in events.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
        assert!((events[4].confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn equal_confidence_keeps_input_order() {
        let raw = [
            det(0, 0.8, square(0.0)),
            det(1, 0.8, square(100.0)),
            det(2, 0.8, square(200.0)),
        ];
        let mut tuned = settings();
        tuned.max_per_frame = 2;
        let events = aggregate(&raw, &ClassTable::builtin(), &tuned, 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].class, DefectClass::Cap);
        assert_eq!(events[1].class, DefectClass::Crumbled);
    }

    #[test]
    fn unknown_class_id_fails_the_frame() {
        let raw = [det(9, 0.9, square(0.0))];
        let err = aggregate(&raw, &ClassTable::builtin(), &settings(), 0).unwrap_err();
        assert_eq!(err, AggregateError::UnknownClass { class_id: 9 });
    }

    #[test]
    fn empty_input_is_empty_output() {
        let events = aggregate(&[], &ClassTable::builtin(), &settings(), 0).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn aggregation_is_idempotent() {
        let raw = [
            det(0, 0.95, BBox::new(0.0, 0.0, 20.0, 20.0)),
            det(0, 0.85, BBox::new(5.0, 5.0, 25.0, 25.0)),
            det(1, 0.75, BBox::new(100.0, 100.0, 130.0, 130.0)),
            det(2, 0.65, BBox::new(200.0, 0.0, 230.0, 40.0)),
        ];
        let table = ClassTable::builtin();
        let first = aggregate(&raw, &table, &settings(), 7).unwrap();

        let as_raw: Vec<RawDetection> = first
            .iter()
            .map(|e| det(id_of(e.class), e.confidence, e.bbox))
            .collect();
        let second = aggregate(&as_raw, &table, &settings(), 7).unwrap();

        assert_eq!(first, second);
    }
}
