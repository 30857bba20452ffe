//! End-to-end pipeline exercises on the synthetic source with a scripted
//! detector and an in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use defect_core::{
    BBox, DefectDocument, DetectorFactory, ObjectDetector, RawDetection, ScriptedDetector,
};
use linewatch::pipeline::{
    DefectStore, PipelineConfig, PipelineDeps, PipelineMonitor, PipelineState, StoreError,
};

/// In-memory store whose availability can be toggled mid-run.
struct FlakyStore {
    docs: Mutex<Vec<DefectDocument>>,
    down: AtomicBool,
}

impl FlakyStore {
    fn new(down: bool) -> Self {
        Self {
            docs: Mutex::new(Vec::new()),
            down: AtomicBool::new(down),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn persisted(&self) -> usize {
        self.docs.lock().unwrap().len()
    }
}

impl DefectStore for FlakyStore {
    fn insert(&self, _collection: &str, document: &DefectDocument) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "injected outage".to_string(),
            });
        }
        self.docs.lock().unwrap().push(document.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "flaky-mem".to_string()
    }
}

/// Detector that reports the same high-confidence defect on every frame.
fn hit_every_frame() -> Arc<DetectorFactory> {
    Arc::new(|| {
        Ok(Box::new(ScriptedDetector::new(vec![vec![RawDetection {
            class_id: 0,
            confidence: 0.9,
            bbox: BBox::new(10.0, 10.0, 40.0, 40.0),
        }]])) as Box<dyn ObjectDetector>)
    })
}

fn test_config(cooldown_secs: f64) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.camera.width = 96;
    config.camera.height = 64;
    config.camera.fps = 60;
    config.cooldown.seconds = cooldown_secs;
    config.server.bind = "127.0.0.1:0".to_string();
    config.storage.queue_capacity = 8;
    config.storage.retry_max_attempts = 2;
    config.storage.shutdown_grace_ms = 1000;
    config.stream.fps_cap = 30;
    config
}

fn wait_for(monitor: &PipelineMonitor, state: PipelineState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while monitor.state.get() != state {
        assert!(
            Instant::now() < deadline,
            "pipeline never reached {state:?} (currently {:?})",
            monitor.state.get()
        );
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn detects_persists_and_stops_cleanly() {
    let config = test_config(0.4);
    let store = Arc::new(FlakyStore::new(false));
    let deps = PipelineDeps {
        detector_factory: hit_every_frame(),
        store: store.clone(),
    };
    let monitor = PipelineMonitor::new();
    let shutdown = Arc::new(AtomicBool::new(false));

    let run_monitor = monitor.clone();
    let run_shutdown = shutdown.clone();
    let runner =
        thread::spawn(move || linewatch::pipeline::run(&config, &deps, &run_monitor, run_shutdown));

    wait_for(&monitor, PipelineState::Running, Duration::from_secs(10));
    let started = Instant::now();
    thread::sleep(Duration::from_millis(1200));

    shutdown.store(true, Ordering::SeqCst);
    runner.join().unwrap().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(monitor.state.get(), PipelineState::Stopped);
    assert!(
        monitor.counters.frames() > 30,
        "only {} frames captured",
        monitor.counters.frames()
    );

    let admitted = monitor.counters.total_admitted();
    let suppressed = monitor.counters.total_suppressed();
    assert!(admitted >= 1);
    assert!(
        suppressed > admitted,
        "cooldown should suppress most repeats (admitted {admitted}, suppressed {suppressed})"
    );
    // One admission per 0.4s window, plus slack for the window boundaries.
    let ceiling = elapsed.as_millis() as u64 / 400 + 3;
    assert!(admitted <= ceiling, "admitted {admitted} > ceiling {ceiling}");

    assert_eq!(store.persisted() as u64, admitted);
    assert_eq!(monitor.counters.store_dropped(), 0);
}

#[test]
fn storage_outage_never_stalls_the_frame_path() {
    let config = test_config(0.1);
    let store = Arc::new(FlakyStore::new(true));
    let deps = PipelineDeps {
        detector_factory: hit_every_frame(),
        store: store.clone(),
    };
    let monitor = PipelineMonitor::new();
    let shutdown = Arc::new(AtomicBool::new(false));

    let run_monitor = monitor.clone();
    let run_shutdown = shutdown.clone();
    let runner =
        thread::spawn(move || linewatch::pipeline::run(&config, &deps, &run_monitor, run_shutdown));

    wait_for(&monitor, PipelineState::Running, Duration::from_secs(10));
    thread::sleep(Duration::from_millis(1000));

    let frames_during_outage = monitor.counters.frames();
    assert!(
        frames_during_outage > 30,
        "frame path stalled during the outage ({frames_during_outage} frames)"
    );
    assert!(
        monitor.counters.total_admitted() > 4,
        "admissions should not block on storage"
    );

    store.set_down(false);
    thread::sleep(Duration::from_millis(700));

    shutdown.store(true, Ordering::SeqCst);
    runner.join().unwrap().unwrap();

    assert_eq!(monitor.state.get(), PipelineState::Stopped);
    assert!(
        monitor.counters.frames() > frames_during_outage,
        "pipeline should keep capturing after the store recovers"
    );
    assert!(
        monitor.counters.store_dropped() > 0,
        "the outage should have cost queued entries"
    );
    assert!(
        store.persisted() >= 1,
        "entries admitted after recovery should persist"
    );
}
