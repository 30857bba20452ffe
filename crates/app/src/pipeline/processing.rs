//! Inference workers: run the detector on captured frames, consolidate the
//! raw output, gate admitted defects through the cooldown, and hand the frame
//! to the encoder.
//!
//! Every aggregated event is forwarded for display; the cooldown only decides
//! which events reach the detections log and the store.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::anyhow;
use camera_ingest::Frame;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use defect_core::{
    Admission, AggregatorSettings, ClassTable, CooldownTracker, DefectLogEntry, DetectorFactory,
    ObjectDetector, aggregate,
};
use tracing::{debug, error};

use crate::pipeline::{
    data::{DefectCounters, DetectionSummary, FaultCell},
    encoding::EncodeTask,
    sink::SinkHandle,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Unit of work consumed by processing threads.
pub(crate) struct FrameTask {
    pub(crate) frame: Frame,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

/// State shared by every processing worker.
#[derive(Clone)]
pub(crate) struct ProcessingContext {
    pub(crate) settings: AggregatorSettings,
    pub(crate) class_table: Arc<ClassTable>,
    pub(crate) cooldown: Arc<Mutex<CooldownTracker>>,
    pub(crate) sink: SinkHandle,
    pub(crate) counters: Arc<DefectCounters>,
}

#[derive(Debug)]
enum ProcessError {
    /// Configuration-level problem; the supervisor must fault, not restart.
    Fatal(anyhow::Error),
    /// Inference failed; worth a pipeline restart.
    Transient(anyhow::Error),
}

/// Spawn a processing worker that owns one detector instance.
///
/// The worker reports detector readiness through `init_tx` before consuming
/// frames, so the controller can refuse to enter the running state when the
/// model fails to load.
pub(crate) fn spawn_processing_worker(
    factory: Arc<DetectorFactory>,
    ctx: ProcessingContext,
    work_rx: Receiver<FrameTask>,
    init_tx: Sender<std::result::Result<String, String>>,
    encode_tx: Sender<EncodeTask>,
    encode_evict: Receiver<EncodeTask>,
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    fault: FaultCell,
    worker_index: usize,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread(format!("linewatch-proc-{worker_index}"), move || {
        let mut detector = match factory() {
            Ok(detector) => {
                let message = format!("worker #{worker_index}: detector ready");
                if init_tx.send(Ok(message)).is_err() {
                    return;
                }
                detector
            }
            Err(err) => {
                let _ = init_tx.send(Err(format!(
                    "worker #{worker_index}: failed to load detector: {err:#}"
                )));
                return;
            }
        };
        drop(init_tx);

        loop {
            if shutdown.load(Ordering::Relaxed) || !running.load(Ordering::Relaxed) {
                break;
            }

            let task = match work_rx.recv() {
                Ok(task) => task,
                Err(_) => break,
            };
            health.beat(HealthComponent::Processing);

            let stage_start = Instant::now();
            match process_frame(detector.as_mut(), &ctx, &task) {
                Ok(summaries) => {
                    metrics::histogram!("linewatch_stage_latency_seconds", "stage" => "inference")
                        .record(stage_start.elapsed().as_secs_f64());
                    let encode = EncodeTask {
                        frame: task.frame,
                        summaries,
                        frame_number: task.frame_number,
                        fps: task.fps,
                    };
                    // Latest-frame-wins on the encode queue: a busy encoder
                    // loses the waiting job, never gains a backlog.
                    match encode_tx.try_send(encode) {
                        Ok(()) => {}
                        Err(TrySendError::Full(job)) => {
                            let _ = encode_evict.try_recv();
                            metrics::counter!("linewatch_encode_jobs_replaced_total").increment(1);
                            if encode_tx.try_send(job).is_err() {
                                debug!("Encode queue still full; dropping frame {}", task.frame_number);
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            error!("Encode channel closed, stopping processing worker");
                            running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                Err(ProcessError::Fatal(err)) => {
                    error!("Unrecoverable processing error: {err:#}");
                    if let Ok(mut guard) = fault.lock() {
                        guard.get_or_insert(err);
                    }
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                Err(ProcessError::Transient(err)) => {
                    error!("Frame processing error: {err:#}");
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    })
    .expect("failed to spawn processing worker")
}

fn process_frame(
    detector: &mut dyn ObjectDetector,
    ctx: &ProcessingContext,
    task: &FrameTask,
) -> std::result::Result<Vec<DetectionSummary>, ProcessError> {
    let raw = detector
        .infer(&task.frame)
        .map_err(ProcessError::Transient)?;

    // An unknown class id means the model and the class table disagree;
    // restarting cannot fix that.
    let events = aggregate(
        &raw,
        &ctx.class_table,
        &ctx.settings,
        task.frame.timestamp_ms,
    )
    .map_err(|err| ProcessError::Fatal(err.into()))?;
    metrics::histogram!("linewatch_detections_per_frame").record(events.len() as f64);

    let mut summaries = Vec::with_capacity(events.len());
    for event in &events {
        summaries.push(DetectionSummary::from_event(event));

        let admission = {
            let mut cooldown = ctx
                .cooldown
                .lock()
                .map_err(|_| ProcessError::Fatal(anyhow!("cooldown tracker poisoned")))?;
            cooldown.admit(event.class, event.timestamp_ms)
        };

        match admission {
            Admission::Admitted => {
                ctx.counters.record_admitted(event.class);
                metrics::counter!("linewatch_defects_admitted_total", "class" => event.class.slug())
                    .increment(1);
                let entry = DefectLogEntry::from_event(event, task.frame_number);
                telemetry::log_detection(&entry);
                ctx.sink.record(entry);
            }
            Admission::Suppressed => {
                ctx.counters.record_suppressed(event.class);
                metrics::counter!("linewatch_defects_suppressed_total", "class" => event.class.slug())
                    .increment(1);
                debug!(
                    "Cooldown suppressed {} at frame {}",
                    event.class.slug(),
                    task.frame_number
                );
            }
        }
    }

    Ok(summaries)
}
