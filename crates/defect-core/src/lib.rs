//! Domain logic for bottle-defect detection: the defect class table,
//! detection aggregation (confidence filter + NMS + ranking), the cooldown
//! de-duplication window, and the inference engine seam.

pub mod aggregate;
pub mod classes;
pub mod cooldown;
pub mod detection;
pub mod detector;

#[cfg(feature = "with-ort")]
pub mod onnx;

pub use aggregate::{AggregateError, AggregatorSettings, aggregate};
pub use classes::{ClassTable, ClassTableError, DefectClass};
pub use cooldown::{Admission, CooldownTracker};
pub use detection::{BBox, DefectDocument, DefectLogEntry, DetectionEvent, RawDetection};
pub use detector::{DetectorFactory, ObjectDetector, ScriptedDetector};

#[cfg(feature = "with-ort")]
pub use onnx::OrtDetector;
