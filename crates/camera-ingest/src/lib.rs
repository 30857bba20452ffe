//! Frame acquisition for the defect-detection pipeline.
//!
//! Provides the [`FrameSource`] seam plus two backends: a live OpenCV camera
//! (behind the `with-opencv` feature) and an always-available synthetic
//! source that paces generated frames like a real device.

pub mod capture;
pub mod synthetic;
pub mod types;

#[cfg(feature = "with-opencv")]
pub mod camera;

pub use capture::spawn_capture_worker;
pub use synthetic::SyntheticSource;
pub use types::{CameraConfig, CaptureError, Frame, FrameFormat, FrameSource, SourceKind};

/// Open the configured capture backend.
pub fn open_source(
    kind: SourceKind,
    config: &CameraConfig,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    match kind {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new(config))),
        #[cfg(feature = "with-opencv")]
        SourceKind::Device => Ok(Box::new(camera::OpenCvSource::open(config)?)),
        #[cfg(not(feature = "with-opencv"))]
        SourceKind::Device => Err(CaptureError::Other(anyhow::anyhow!(
            "device capture requires the `with-opencv` feature; use the synthetic source"
        ))),
    }
}
