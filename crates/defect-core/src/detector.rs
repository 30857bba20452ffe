//! Inference engine seam, plus a scripted engine for camera-free runs.

use anyhow::Result;
use camera_ingest::Frame;

use crate::detection::{BBox, RawDetection};

/// One frame in, raw candidate boxes out.
///
/// Engines are owned by a single worker. `&mut self` keeps non-reentrant
/// runtimes safe without internal locking; workers that want parallelism
/// each load their own engine.
pub trait ObjectDetector: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

/// Factory invoked once per inference worker, on the worker's own thread.
pub type DetectorFactory = dyn Fn() -> Result<Box<dyn ObjectDetector>> + Send + Sync;

/// Replays a fixed script of detections, one entry per frame, wrapping
/// around at the end. Backs the synthetic demo mode and the pipeline tests.
pub struct ScriptedDetector {
    script: Vec<Vec<RawDetection>>,
    cursor: usize,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<RawDetection>>) -> Self {
        Self { script, cursor: 0 }
    }

    /// Script that walks through every defect class with plausible boxes
    /// sized for a `width` x `height` frame.
    pub fn demo(width: i32, height: i32) -> Self {
        let w = width as f32;
        let h = height as f32;
        let boxed = |class_id: i64, cx: f32, cy: f32, confidence: f32| RawDetection {
            class_id,
            confidence,
            bbox: BBox::new(cx - w * 0.08, cy - h * 0.12, cx + w * 0.08, cy + h * 0.12),
        };

        Self::new(vec![
            vec![boxed(0, w * 0.30, h * 0.50, 0.91)],
            vec![
                boxed(3, w * 0.55, h * 0.45, 0.84),
                boxed(1, w * 0.75, h * 0.60, 0.66),
            ],
            vec![],
            vec![boxed(2, w * 0.40, h * 0.55, 0.72)],
            vec![],
            vec![boxed(4, w * 0.62, h * 0.50, 0.58)],
        ])
    }
}

impl ObjectDetector for ScriptedDetector {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let out = self.script[self.cursor % self.script.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use camera_ingest::FrameFormat;

    use super::*;

    fn frame() -> Frame {
        Frame {
            data: vec![0; 4 * 4 * 3],
            width: 4,
            height: 4,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn script_wraps_around() {
        let mut det = ScriptedDetector::new(vec![
            vec![RawDetection {
                class_id: 0,
                confidence: 0.9,
                bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            }],
            vec![],
        ]);
        let f = frame();
        assert_eq!(det.infer(&f).unwrap().len(), 1);
        assert_eq!(det.infer(&f).unwrap().len(), 0);
        assert_eq!(det.infer(&f).unwrap().len(), 1);
    }

    #[test]
    fn empty_script_yields_nothing() {
        let mut det = ScriptedDetector::new(Vec::new());
        assert!(det.infer(&frame()).unwrap().is_empty());
    }

    #[test]
    fn demo_script_covers_every_class_id() {
        let mut det = ScriptedDetector::demo(1280, 720);
        let f = frame();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            for d in det.infer(&f).unwrap() {
                seen.insert(d.class_id);
            }
        }
        assert_eq!(seen.len(), 5);
    }
}
