use std::time::Duration;

use thiserror::Error;

/// Raw packed-pixel frame captured from a video source.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Bytes per row for the packed 3-channel formats.
    pub fn stride(&self) -> usize {
        self.width as usize * 3
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
    Rgb8,
}

/// Capture settings applied when a device is opened.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub index: u32,
    pub width: i32,
    pub height: i32,
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 1,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// Which capture backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Device,
    Synthetic,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("video device {uri:?} is unavailable")]
    DeviceUnavailable { uri: String },
    #[error("no frame from {uri:?} within {timeout_ms}ms")]
    ReadFailed { uri: String, timeout_ms: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A live frame producer. Dropping a source releases the underlying device.
pub trait FrameSource: Send {
    /// Identifier used in logs and errors (`/dev/video1`, `synthetic`).
    fn uri(&self) -> &str;

    /// Block until the next frame arrives or `timeout` elapses.
    ///
    /// A timeout or an empty read is [`CaptureError::ReadFailed`]; callers
    /// treat it as a cue to reopen the device, not as a fatal condition.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;
}
