//! OpenCV-backed camera capture.

use std::time::{Duration, Instant};

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::types::{CameraConfig, CaptureError, Frame, FrameFormat, FrameSource};

/// Live `VideoCapture` device wrapped as a [`FrameSource`].
///
/// The device is released when the source is dropped, including on error
/// paths, so a reopen never races a half-closed handle.
pub struct OpenCvSource {
    cap: VideoCapture,
    uri: String,
    width: i32,
    height: i32,
    frame: Mat,
    scratch: Mat,
}

impl OpenCvSource {
    /// Open device `config.index` and apply the capture settings.
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        let uri = format!("/dev/video{}", config.index);
        let mut cap = open_video_capture(config.index as i32, &uri)?;
        configure_camera(&mut cap, (config.width, config.height), f64::from(config.fps));
        debug!("opened capture device {uri} at {}x{}", config.width, config.height);
        Ok(Self {
            cap,
            uri,
            width: config.width,
            height: config.height,
            frame: Mat::default(),
            scratch: Mat::default(),
        })
    }

    fn read_failed(&self, timeout: Duration) -> CaptureError {
        CaptureError::ReadFailed {
            uri: self.uri.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

impl FrameSource for OpenCvSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let deadline = Instant::now() + timeout;

        loop {
            let got = self
                .cap
                .read(&mut self.frame)
                .map_err(|e| CaptureError::Other(e.into()))?;

            let size = self
                .frame
                .size()
                .map_err(|e| CaptureError::Other(e.into()))?;

            if !got || size.width <= 0 {
                if Instant::now() >= deadline {
                    return Err(self.read_failed(timeout));
                }
                continue;
            }

            let working = if size.width != self.width || size.height != self.height {
                opencv::imgproc::resize(
                    &self.frame,
                    &mut self.scratch,
                    core::Size {
                        width: self.width,
                        height: self.height,
                    },
                    0.0,
                    0.0,
                    opencv::imgproc::INTER_LINEAR,
                )
                .map_err(|e| CaptureError::Other(e.into()))?;
                &self.scratch
            } else {
                &self.frame
            };

            let data = working
                .data_bytes()
                .map_err(|e| CaptureError::Other(e.into()))?
                .to_vec();

            return Ok(Frame {
                data,
                width: self.width,
                height: self.height,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            });
        }
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        match self.cap.release() {
            Ok(()) => debug!("released capture device {}", self.uri),
            Err(err) => warn!("failed to release capture device {}: {err}", self.uri),
        }
    }
}

/// Attempt to open a camera by index, preferring the V4L backend.
fn open_video_capture(index: i32, uri: &str) -> Result<VideoCapture, CaptureError> {
    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::new(index, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                debug!("failed to open device #{index} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::DeviceUnavailable {
        uri: uri.to_string(),
    })
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
