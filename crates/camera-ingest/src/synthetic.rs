//! Camera-free frame source that synthesizes test imagery.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::types::{CameraConfig, CaptureError, Frame, FrameFormat, FrameSource};

/// Generates BGR frames with a moving band, paced at the configured fps.
///
/// Stands in for a camera in demos and tests so every downstream stage still
/// sees a realistic frame cadence.
pub struct SyntheticSource {
    width: i32,
    height: i32,
    interval: Duration,
    next_due: Instant,
    tick: u64,
}

impl SyntheticSource {
    pub fn new(config: &CameraConfig) -> Self {
        let fps = config.fps.max(1);
        Self {
            width: config.width.max(1),
            height: config.height.max(1),
            interval: Duration::from_secs_f64(1.0 / f64::from(fps)),
            next_due: Instant::now(),
            tick: 0,
        }
    }

    fn render(&self, tick: u64) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let band = ((tick * 4) % w as u64) as usize;
        let mut data = vec![0u8; w * h * 3];
        for y in 0..h {
            let row = y * w * 3;
            for x in 0..w {
                let px = row + x * 3;
                data[px] = (x * 255 / w) as u8;
                data[px + 1] = (y * 255 / h) as u8;
                data[px + 2] = if x.abs_diff(band) < 12 { 230 } else { 40 };
            }
        }
        data
    }
}

impl FrameSource for SyntheticSource {
    fn uri(&self) -> &str {
        "synthetic"
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
        let now = Instant::now();
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }
        self.next_due = Instant::now() + self.interval;

        let tick = self.tick;
        self.tick = self.tick.wrapping_add(1);

        Ok(Frame {
            data: self.render(tick),
            width: self.width,
            height: self.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }
}
