//! linewatch: real-time bottle-defect detection for a production line.
//!
//! Frames come off a camera (or the synthetic source), pass through a YOLO
//! detector, and the consolidated detections are gated by a per-class
//! cooldown before being logged and persisted. In parallel every frame is
//! annotated and re-encoded for the MJPEG preview stream served over HTTP.
//!
//! The [`pipeline`] module holds the whole machine; [`cli`] is the thin
//! command-line layer the binary puts in front of it.

pub mod cli;
pub mod pipeline;
