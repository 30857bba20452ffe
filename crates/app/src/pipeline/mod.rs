//! End-to-end defect-detection pipeline: captures frames, runs inference,
//! logs and persists admitted defects, and serves the annotated stream.
//!
//! The module is split into focused submodules:
//! - `config`: TOML configuration with validation.
//! - `controller`: Supervises the capture → process → encode run.
//! - `processing`: Detector workers, aggregation, and the cooldown gate.
//! - `encoding`: Overlay drawing and rate-capped JPEG encoding.
//! - `sink`: Bounded persistence queue in front of the defect store.
//! - `store`: Defect store trait and the JSONL backend.
//! - `server`: Actix Web stream and status endpoints.
//! - `watchdog`: Health monitoring for pipeline stages.
//! - `telemetry`: Log layers and the metrics recorder.
//! - `data`: Shared structs passed between stages.

pub use config::{DEFAULT_CONFIG_PATH, PipelineConfig, SourceMode};
pub use controller::{PipelineDeps, PipelineMonitor, run};
pub use data::{DefectCounters, DefectCounts, PipelineState, StateCell};
pub use store::{DefectStore, JsonlStore, StoreError};
pub use telemetry::init_telemetry;

mod annotate;
pub mod config;
mod controller;
mod data;
mod encoding;
mod processing;
mod server;
mod sink;
mod store;
pub(crate) mod telemetry;
mod watchdog;
