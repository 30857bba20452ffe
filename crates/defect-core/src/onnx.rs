//! ONNX Runtime YOLO engine.

use anyhow::{Context, Result, bail};
use camera_ingest::{Frame, FrameFormat};
use ort::session::{Session, builder::GraphOptimizationLevel};
use tracing::info;

use crate::detection::{BBox, RawDetection};
use crate::detector::ObjectDetector;

const INPUT_NAME: &str = "images";
const LETTERBOX_FILL: u8 = 114;
const MAX_RAW_DETECTIONS: usize = 512;

/// YOLOv8 ONNX session wrapped as an [`ObjectDetector`].
///
/// Decodes the `[1, 4 + classes, anchors]` output layout: center-format
/// boxes plus one score channel per class. Candidates below the confidence
/// floor are dropped here; suppression and ranking stay downstream.
pub struct OrtDetector {
    session: Session,
    input_size: usize,
    confidence_floor: f32,
}

impl OrtDetector {
    /// Load the model and prepare a CPU session.
    pub fn load(model_path: &str, input_size: usize, confidence_floor: f32) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load detection model {model_path}"))?;

        info!("loaded detection model {model_path}");
        Ok(Self {
            session,
            input_size,
            confidence_floor,
        })
    }

    /// Letterbox into the square model input and normalize HWC bytes into a
    /// CHW float tensor. Returns the tensor data plus the scale and padding
    /// needed to map boxes back to source-frame pixels.
    fn preprocess(&self, frame: &Frame) -> (Vec<f32>, f32, f32, f32) {
        let src_w = frame.width as usize;
        let src_h = frame.height as usize;
        let target = self.input_size;

        let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
        let scaled_w = ((src_w as f32 * scale) as usize).clamp(1, target);
        let scaled_h = ((src_h as f32 * scale) as usize).clamp(1, target);
        let pad_x = (target - scaled_w) as f32 / 2.0;
        let pad_y = (target - scaled_h) as f32 / 2.0;

        let resized = resize_bilinear(&frame.data, src_w, src_h, scaled_w, scaled_h);

        let mut canvas = vec![LETTERBOX_FILL; target * target * 3];
        for y in 0..scaled_h {
            let src_row = y * scaled_w * 3;
            let dst_px = (y + pad_y as usize) * target + pad_x as usize;
            canvas[dst_px * 3..dst_px * 3 + scaled_w * 3]
                .copy_from_slice(&resized[src_row..src_row + scaled_w * 3]);
        }

        // The model expects RGB planes; captured frames are usually BGR.
        let plane_order: [usize; 3] = match frame.format {
            FrameFormat::Bgr8 => [2, 1, 0],
            FrameFormat::Rgb8 => [0, 1, 2],
        };

        let plane_len = target * target;
        let mut input = vec![0.0f32; 3 * plane_len];
        for (plane, &channel) in plane_order.iter().enumerate() {
            for px in 0..plane_len {
                input[plane * plane_len + px] = f32::from(canvas[px * 3 + channel]) / 255.0;
            }
        }

        (input, scale, pad_x, pad_y)
    }

    fn decode(
        &self,
        data: &[f32],
        channels: usize,
        anchors: usize,
        scale: f32,
        pad_x: f32,
        pad_y: f32,
    ) -> Vec<RawDetection> {
        let classes = channels.saturating_sub(4);
        let mut out = Vec::new();

        for i in 0..anchors {
            let cx = data[i];
            let cy = data[anchors + i];
            let w = data[anchors * 2 + i];
            let h = data[anchors * 3 + i];

            let mut best_class = 0usize;
            let mut best_score = 0.0f32;
            for c in 0..classes {
                let score = data[anchors * (4 + c) + i];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }

            if best_score < self.confidence_floor {
                continue;
            }

            let x1 = ((cx - w / 2.0) - pad_x) / scale;
            let y1 = ((cy - h / 2.0) - pad_y) / scale;
            let x2 = ((cx + w / 2.0) - pad_x) / scale;
            let y2 = ((cy + h / 2.0) - pad_y) / scale;

            out.push(RawDetection {
                class_id: best_class as i64,
                confidence: best_score,
                bbox: BBox::new(x1, y1, x2, y2),
            });
            if out.len() >= MAX_RAW_DETECTIONS {
                break;
            }
        }

        out
    }
}

impl ObjectDetector for OrtDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let (input, scale, pad_x, pad_y) = self.preprocess(frame);

        let target = self.input_size as i64;
        let shape = [1i64, 3, target, target];
        let value = ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs![INPUT_NAME => value])?;
        let (out_shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        if out_shape.len() != 3 || out_shape[0] != 1 {
            bail!("unexpected detector output shape {out_shape:?}");
        }
        let channels = out_shape[1] as usize;
        let anchors = out_shape[2] as usize;
        if channels < 5 {
            bail!("detector output needs box channels plus at least one class, got {channels}");
        }

        Ok(self.decode(data, channels, anchors, scale, pad_x, pad_y))
    }
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = f32::from(src[(sy0 * src_w + sx0) * 3 + c]);
                let p10 = f32::from(src[(sy0 * src_w + sx1) * 3 + c]);
                let p01 = f32::from(src[(sy1 * src_w + sx0) * 3 + c]);
                let p11 = f32::from(src[(sy1 * src_w + sx1) * 3 + c]);

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }

    dst
}
