use std::collections::BTreeMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU8, AtomicU64, Ordering},
};

use defect_core::{DefectClass, DetectionEvent};
use serde::Serialize;

const CLASS_COUNT: usize = DefectClass::ALL.len();

/// Encoded frame plus the detection snapshot it was drawn from.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

/// One detection as exposed on the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) class: &'static str,
    pub(crate) display: &'static str,
    pub(crate) confidence: f32,
    pub(crate) bbox: [f32; 4],
}

impl DetectionSummary {
    pub(crate) fn from_event(event: &DetectionEvent) -> Self {
        Self {
            class: event.class.slug(),
            display: event.class.display_name(),
            confidence: event.confidence,
            bbox: event.bbox.corners(),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct DetectionsResponse<'a> {
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
    pub(crate) detections: &'a [DetectionSummary],
}

/// Latest encoded frame, replaced wholesale by the encode worker.
pub(crate) type SharedFrame = Arc<Mutex<Option<FramePacket>>>;

/// First unrecoverable error raised by any worker. The supervisor inspects
/// this before deciding between a restart and a terminal fault.
pub(crate) type FaultCell = Arc<Mutex<Option<anyhow::Error>>>;

/// Pipeline lifecycle, observable over HTTP while the service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
            PipelineState::Faulted => "faulted",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Stopping,
            4 => PipelineState::Stopped,
            5 => PipelineState::Faulted,
            _ => PipelineState::Idle,
        }
    }
}

/// Lock-free cell holding the current [`PipelineState`].
#[derive(Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(PipelineState::Idle as u8))
    }

    pub fn set(&self, state: PipelineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::SeqCst))
    }
}

/// Running totals shared by the workers and the HTTP surface.
pub struct DefectCounters {
    admitted: [AtomicU64; CLASS_COUNT],
    suppressed: [AtomicU64; CLASS_COUNT],
    frames: AtomicU64,
    frames_dropped: AtomicU64,
    store_dropped: AtomicU64,
}

impl DefectCounters {
    pub fn new() -> Self {
        Self {
            admitted: std::array::from_fn(|_| AtomicU64::new(0)),
            suppressed: std::array::from_fn(|_| AtomicU64::new(0)),
            frames: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            store_dropped: AtomicU64::new(0),
        }
    }

    pub fn record_admitted(&self, class: DefectClass) {
        self.admitted[class as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self, class: DefectClass) {
        self.suppressed[class as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_drop(&self) {
        self.store_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admitted(&self, class: DefectClass) -> u64 {
        self.admitted[class as usize].load(Ordering::Relaxed)
    }

    pub fn suppressed(&self, class: DefectClass) -> u64 {
        self.suppressed[class as usize].load(Ordering::Relaxed)
    }

    pub fn total_admitted(&self) -> u64 {
        self.admitted.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn total_suppressed(&self) -> u64 {
        self.suppressed
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn store_dropped(&self) -> u64 {
        self.store_dropped.load(Ordering::Relaxed)
    }

    /// Per-class admitted counts for the defects endpoint.
    pub fn counts(&self) -> DefectCounts {
        let mut counts = BTreeMap::new();
        for class in DefectClass::ALL {
            counts.insert(class.slug(), self.admitted(class));
        }
        DefectCounts {
            total: self.total_admitted(),
            counts,
        }
    }
}

impl Default for DefectCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct DefectCounts {
    pub total: u64,
    pub counts: BTreeMap<&'static str, u64>,
}
