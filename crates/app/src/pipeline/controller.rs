//! Pipeline controller: wires capture, inference, encoding, persistence, and
//! the HTTP server into one run, and supervises restarts when stages stall.
//!
//! A run owns its stages end to end. The controller is the only place that
//! decides between restarting and faulting, and it drives the lifecycle
//! visible on `/api/status`.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use camera_ingest::spawn_capture_worker;
use crossbeam_channel::{RecvTimeoutError, TrySendError};
use defect_core::{CooldownTracker, DetectorFactory};
use tracing::{debug, error, info, warn};

use crate::pipeline::{
    config::PipelineConfig,
    data::{DefectCounters, FaultCell, PipelineState, SharedFrame, StateCell},
    encoding::{EncodeTask, spawn_encode_worker},
    processing::{FrameTask, ProcessingContext, spawn_processing_worker},
    server::spawn_api_server,
    sink::PersistenceSink,
    store::{DefectStore, JsonlStore},
    telemetry,
    watchdog::{HealthComponent, PipelineHealth, WatchdogState, spawn_watchdog},
};

/// Pause between restart attempts.
const RESTART_PAUSE: Duration = Duration::from_secs(1);
/// A run surviving this long earns a fresh restart budget.
const HEALTHY_RUN_THRESHOLD: Duration = Duration::from_secs(60);
/// How long the dispatch loop waits for a frame before rechecking flags.
const DISPATCH_RECV_PATIENCE: Duration = Duration::from_millis(500);

/// Externally supplied collaborators, injectable for tests.
pub struct PipelineDeps {
    pub detector_factory: Arc<DetectorFactory>,
    pub store: Arc<dyn DefectStore>,
}

impl PipelineDeps {
    /// Production wiring: the ONNX detector when the `with-ort` feature is
    /// enabled (a scripted stand-in otherwise) plus the JSONL store.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            detector_factory: default_detector_factory(config),
            store: Arc::new(JsonlStore::open(
                config.storage.root.clone(),
                &config.storage.database,
            )),
        }
    }
}

#[cfg(feature = "with-ort")]
fn default_detector_factory(config: &PipelineConfig) -> Arc<DetectorFactory> {
    use defect_core::{ObjectDetector, OrtDetector};

    let model = config.detector.model.to_string_lossy().into_owned();
    let input_size = config.detector.input_size as usize;
    let floor = config.detector.confidence_threshold;
    Arc::new(move || {
        let detector = OrtDetector::load(&model, input_size, floor)?;
        Ok(Box::new(detector) as Box<dyn ObjectDetector>)
    })
}

#[cfg(not(feature = "with-ort"))]
fn default_detector_factory(config: &PipelineConfig) -> Arc<DetectorFactory> {
    use defect_core::{ObjectDetector, ScriptedDetector};

    let (width, height) = (config.camera.width, config.camera.height);
    Arc::new(move || {
        Ok(Box::new(ScriptedDetector::demo(width, height)) as Box<dyn ObjectDetector>)
    })
}

/// Observable pipeline state shared with the HTTP server and the caller.
#[derive(Clone)]
pub struct PipelineMonitor {
    pub state: Arc<StateCell>,
    pub counters: Arc<DefectCounters>,
}

impl PipelineMonitor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StateCell::new()),
            counters: Arc::new(DefectCounters::new()),
        }
    }
}

impl Default for PipelineMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a single pipeline run attempt.
enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

/// Run the pipeline until shutdown, restarting after recoverable stalls.
///
/// Restarts are budgeted: more than `restart_attempts` consecutive short
/// runs fault the pipeline, while a run that stays healthy long enough
/// resets the budget. Unrecoverable errors fault immediately.
pub fn run(
    config: &PipelineConfig,
    deps: &PipelineDeps,
    monitor: &PipelineMonitor,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let started = Instant::now();
        match run_once(config, deps, monitor, shutdown.clone()) {
            Ok(PipelineOutcome::Graceful) => break,
            Ok(PipelineOutcome::Restart(reason)) => {
                if started.elapsed() >= HEALTHY_RUN_THRESHOLD {
                    attempt = 0;
                }
                attempt = attempt.saturating_add(1);
                if attempt > config.pipeline.restart_attempts {
                    monitor.state.set(PipelineState::Faulted);
                    bail!(
                        "pipeline kept stalling after {} restarts (last reason: {reason})",
                        config.pipeline.restart_attempts
                    );
                }
                warn!("Pipeline restart requested (reason: {reason}), attempt #{attempt}");
                thread::sleep(RESTART_PAUSE);
            }
            Err(err) => {
                monitor.state.set(PipelineState::Faulted);
                return Err(err);
            }
        }
    }

    monitor.state.set(PipelineState::Stopped);
    Ok(())
}

/// Execute one pipeline run, returning whether to exit or restart.
fn run_once(
    config: &PipelineConfig,
    deps: &PipelineDeps,
    monitor: &PipelineMonitor,
    shutdown: Arc<AtomicBool>,
) -> Result<PipelineOutcome> {
    if shutdown.load(Ordering::SeqCst) {
        return Ok(PipelineOutcome::Graceful);
    }

    monitor.state.set(PipelineState::Starting);
    let _ = telemetry::init_metrics_recorder();

    let bind = config.server.bind_addr()?;
    let class_table = Arc::new(config.detector.class_table()?);
    let workers = config.pipeline.workers.max(1);

    let pipeline_span = tracing::info_span!(
        "pipeline",
        source = ?config.camera.source,
        width = config.camera.width,
        height = config.camera.height,
        workers
    );
    let _pipeline_guard = pipeline_span.enter();

    let capture_stop = Arc::new(AtomicBool::new(false));
    let (capture_rx, capture_handle) = spawn_capture_worker(
        config.camera.source.kind(),
        config.camera.camera_config(),
        config.camera.read_timeout(),
        capture_stop.clone(),
    )
    .context("failed to start capture")?;

    let shared: SharedFrame = Arc::new(Mutex::new(None));
    let fault: FaultCell = Arc::new(Mutex::new(None));
    let health = Arc::new(PipelineHealth::new());
    let pipeline_running = Arc::new(AtomicBool::new(true));
    let watchdog_state = Arc::new(WatchdogState::new());

    let work_queue = std::cmp::max(3, workers * 2);
    let (work_tx, work_rx) = crossbeam_channel::bounded::<FrameTask>(work_queue);
    // One job in flight plus one waiting; processing replaces the waiting one.
    let (encode_tx, encode_rx) = crossbeam_channel::bounded::<EncodeTask>(2);
    let (init_tx, init_rx) =
        crossbeam_channel::bounded::<std::result::Result<String, String>>(workers);

    let watchdog_handle = spawn_watchdog(
        health.clone(),
        pipeline_running.clone(),
        shutdown.clone(),
        watchdog_state.clone(),
    );

    let sink = PersistenceSink::spawn(
        deps.store.clone(),
        config.storage.collection.clone(),
        config.storage.queue_capacity,
        config.storage.retry_max_attempts,
        monitor.counters.clone(),
    );

    let encode_handle = spawn_encode_worker(
        shared.clone(),
        encode_rx.clone(),
        config.stream.fps_cap,
        config.stream.jpeg_quality,
        health.clone(),
        pipeline_running.clone(),
    );

    let ctx = ProcessingContext {
        settings: config.detector.aggregator_settings(),
        class_table,
        cooldown: Arc::new(Mutex::new(CooldownTracker::new(config.cooldown.window()))),
        sink: sink.handle(),
        counters: monitor.counters.clone(),
    };
    let mut processing_handles = Vec::with_capacity(workers);
    for worker_index in 0..workers {
        processing_handles.push(spawn_processing_worker(
            deps.detector_factory.clone(),
            ctx.clone(),
            work_rx.clone(),
            init_tx.clone(),
            encode_tx.clone(),
            encode_rx.clone(),
            health.clone(),
            pipeline_running.clone(),
            shutdown.clone(),
            fault.clone(),
            worker_index,
        ));
    }
    drop(init_tx);
    drop(work_rx);
    drop(encode_rx);

    // Refuse to enter Running until every detector is loaded.
    let mut init_failure: Option<String> = None;
    for _ in 0..workers {
        match init_rx.recv() {
            Ok(Ok(message)) => debug!("{message}"),
            Ok(Err(message)) => {
                init_failure = Some(message);
                break;
            }
            Err(_) => {
                init_failure =
                    Some("processing worker exited before reporting readiness".to_string());
                break;
            }
        }
    }
    if let Some(message) = init_failure {
        pipeline_running.store(false, Ordering::SeqCst);
        capture_stop.store(true, Ordering::SeqCst);
        drop(capture_rx);
        let _ = capture_handle.join();
        drop(work_tx);
        for handle in processing_handles {
            let _ = handle.join();
        }
        drop(encode_tx);
        let _ = encode_handle.join();
        let _ = watchdog_handle.join();
        drop(ctx);
        sink.close(config.storage.shutdown_grace());
        bail!("detector initialisation failed: {message}");
    }

    let server = spawn_api_server(
        bind,
        shared.clone(),
        monitor.state.clone(),
        monitor.counters.clone(),
        config.stream.fps_cap,
    )
    .context("failed to start API server")?;

    monitor.state.set(PipelineState::Running);
    info!("Pipeline running; stream at http://{bind}/stream.mjpg");

    let mut frame_number: u64 = 0;
    let mut smoothed_fps: f32 = 0.0;
    let mut last_instant = Instant::now();
    let mut restart_reason: Option<&'static str> = None;
    let mut capture_fault: Option<anyhow::Error> = None;

    while pipeline_running.load(Ordering::Relaxed) {
        if shutdown.load(Ordering::Relaxed) {
            pipeline_running.store(false, Ordering::SeqCst);
            break;
        }

        let frame = match capture_rx.recv_timeout(DISPATCH_RECV_PATIENCE) {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                // The capture worker reports an error only once its reopen
                // budget is spent; a restart cannot bring the device back.
                error!("Capture failed: {err}");
                capture_fault =
                    Some(anyhow::Error::new(err).context("camera source unavailable"));
                pipeline_running.store(false, Ordering::SeqCst);
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                error!("Capture worker exited unexpectedly");
                restart_reason = Some("capture channel closed");
                pipeline_running.store(false, Ordering::SeqCst);
                break;
            }
        };

        health.beat(HealthComponent::Capture);
        frame_number = frame_number.wrapping_add(1);
        monitor.counters.record_frame();
        metrics::counter!("linewatch_frames_total").increment(1);

        let now = Instant::now();
        let elapsed = now.duration_since(last_instant).as_secs_f32();
        last_instant = now;
        if elapsed > 0.0 {
            let instant = 1.0 / elapsed;
            smoothed_fps = if smoothed_fps == 0.0 {
                instant
            } else {
                0.9 * smoothed_fps + 0.1 * instant
            };
            metrics::histogram!("linewatch_capture_frame_interval_seconds")
                .record(f64::from(elapsed));
        }
        metrics::gauge!("linewatch_pipeline_fps").set(f64::from(smoothed_fps));

        if frame_number % 30 == 0 {
            debug!(
                "Capture heartbeat: frame #{frame_number}, {smoothed_fps:.1} fps, ts={}",
                frame.timestamp_ms
            );
        }

        let task = FrameTask {
            frame,
            frame_number,
            fps: smoothed_fps,
        };
        match work_tx.try_send(task) {
            Ok(()) => {
                metrics::gauge!("linewatch_queue_depth", "queue" => "processing")
                    .set(work_tx.len() as f64);
            }
            Err(TrySendError::Full(_)) => {
                monitor.counters.record_dropped_frame();
                metrics::counter!("linewatch_capture_dropped_frames_total").increment(1);
                metrics::gauge!("linewatch_queue_depth", "queue" => "processing")
                    .set(work_tx.len() as f64);
                debug!("Dropping frame #{frame_number} (processing backlog)");
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Processing workers terminated unexpectedly");
                restart_reason = Some("processing channel disconnected");
                pipeline_running.store(false, Ordering::SeqCst);
                break;
            }
        }
    }

    monitor.state.set(PipelineState::Stopping);
    info!("Stopping pipeline");

    pipeline_running.store(false, Ordering::SeqCst);
    capture_stop.store(true, Ordering::SeqCst);
    drop(capture_rx);
    let _ = capture_handle.join();
    drop(work_tx);
    for handle in processing_handles {
        let _ = handle.join();
    }
    drop(encode_tx);
    let _ = encode_handle.join();
    let _ = watchdog_handle.join();
    // Workers are gone; release the last queue handle so the sink can drain.
    drop(ctx);
    sink.close(config.storage.shutdown_grace());
    server.stop();

    if let Some(err) = capture_fault {
        return Err(err);
    }
    if let Some(err) = take_fault(&fault) {
        return Err(err);
    }
    if watchdog_state.is_triggered() {
        let reason = watchdog_state
            .reason()
            .map(|component| component.label())
            .unwrap_or("watchdog");
        return Ok(PipelineOutcome::Restart(reason));
    }
    if let Some(reason) = restart_reason {
        return Ok(PipelineOutcome::Restart(reason));
    }
    if !shutdown.load(Ordering::SeqCst) {
        // The loop stopped without a shutdown request: a worker cleared the
        // running flag on its way out.
        return Ok(PipelineOutcome::Restart("worker stopped"));
    }
    Ok(PipelineOutcome::Graceful)
}

/// Take the first fatal worker error out of the shared cell.
fn take_fault(fault: &FaultCell) -> Option<anyhow::Error> {
    fault.lock().ok().and_then(|mut guard| guard.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::StoreError;
    use defect_core::DefectDocument;

    struct NullStore;

    impl DefectStore for NullStore {
        fn insert(
            &self,
            _collection: &str,
            _document: &DefectDocument,
        ) -> std::result::Result<(), StoreError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "null".to_string()
        }
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.camera.width = 96;
        config.camera.height = 64;
        config.camera.fps = 120;
        config.server.bind = "127.0.0.1:0".to_string();
        config.storage.shutdown_grace_ms = 500;
        config
    }

    #[test]
    fn preset_shutdown_exits_gracefully() {
        let config = test_config();
        let deps = PipelineDeps::from_config(&config);
        let monitor = PipelineMonitor::new();
        let shutdown = Arc::new(AtomicBool::new(true));

        run(&config, &deps, &monitor, shutdown).unwrap();
        assert_eq!(monitor.state.get(), PipelineState::Stopped);
    }

    #[test]
    fn detector_load_failure_faults_the_pipeline() {
        let config = test_config();
        let deps = PipelineDeps {
            detector_factory: Arc::new(|| Err(anyhow::anyhow!("weights missing"))),
            store: Arc::new(NullStore),
        };
        let monitor = PipelineMonitor::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let err = run(&config, &deps, &monitor, shutdown).unwrap_err();
        assert!(
            err.to_string().contains("detector initialisation failed"),
            "got: {err}"
        );
        assert_eq!(monitor.state.get(), PipelineState::Faulted);
    }
}
