//! Encode worker: draws overlays and JPEG-encodes frames for the live stream.
//!
//! Output is capped at the configured stream rate regardless of how fast the
//! camera captures. Frames arriving inside the minimum interval are skipped,
//! never queued, so the preview always shows the newest frame.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use camera_ingest::Frame;
use crossbeam_channel::Receiver;
use tracing::error;

use crate::pipeline::{
    annotate::annotate_frame,
    data::{DetectionSummary, SharedFrame},
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Work unit handed over by the processing stage.
pub(crate) struct EncodeTask {
    pub(crate) frame: Frame,
    pub(crate) summaries: Vec<DetectionSummary>,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

fn due(last_encode: Option<Instant>, min_interval: Duration, now: Instant) -> bool {
    match last_encode {
        None => true,
        Some(prev) => now.duration_since(prev) >= min_interval,
    }
}

pub(crate) fn spawn_encode_worker(
    shared: SharedFrame,
    encode_rx: Receiver<EncodeTask>,
    stream_fps_cap: u32,
    jpeg_quality: u8,
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("linewatch-encoding", move || {
        let min_interval = Duration::from_secs(1) / stream_fps_cap.max(1);
        let mut last_encode: Option<Instant> = None;
        let depth_probe = encode_rx.clone();

        for task in encode_rx {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            health.beat(HealthComponent::Encoding);
            metrics::gauge!("linewatch_queue_depth", "queue" => "encoding")
                .set(depth_probe.len() as f64);

            let now = Instant::now();
            if !due(last_encode, min_interval, now) {
                metrics::counter!("linewatch_stream_skipped_total").increment(1);
                continue;
            }

            let encode_start = Instant::now();
            match annotate_frame(
                &task.frame,
                task.frame_number,
                task.fps,
                task.summaries,
                jpeg_quality,
            ) {
                Ok(packet) => {
                    last_encode = Some(now);
                    if let Ok(mut guard) = shared.lock() {
                        *guard = Some(packet);
                    }
                    metrics::counter!("linewatch_frames_streamed_total").increment(1);
                    metrics::histogram!("linewatch_stage_latency_seconds", "stage" => "encoding")
                        .record(encode_start.elapsed().as_secs_f64());
                }
                Err(err) => {
                    error!("Encode stage error: {err}");
                    metrics::counter!("linewatch_encoding_errors_total").increment(1);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    })
    .expect("failed to spawn encoding worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_ingest::FrameFormat;
    use crate::pipeline::data::FramePacket;
    use std::sync::Mutex;

    fn task(frame_number: u64) -> EncodeTask {
        EncodeTask {
            frame: Frame {
                data: vec![64; 64 * 48 * 3],
                width: 64,
                height: 48,
                timestamp_ms: 1_700_000_000_000 + frame_number as i64,
                format: FrameFormat::Bgr8,
            },
            summaries: Vec::new(),
            frame_number,
            fps: 30.0,
        }
    }

    #[test]
    fn first_frame_is_always_due() {
        let now = Instant::now();
        assert!(due(None, Duration::from_millis(66), now));
    }

    #[test]
    fn frames_inside_the_interval_are_not_due() {
        let prev = Instant::now();
        let interval = Duration::from_millis(66);
        assert!(!due(Some(prev), interval, prev + Duration::from_millis(30)));
        assert!(due(Some(prev), interval, prev + Duration::from_millis(66)));
        assert!(due(Some(prev), interval, prev + Duration::from_millis(200)));
    }

    #[test]
    fn worker_publishes_the_newest_packet() {
        let shared: SharedFrame = Arc::new(Mutex::new(None));
        let health = Arc::new(PipelineHealth::new());
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = crossbeam_channel::bounded::<EncodeTask>(4);

        // Interval of 1 microsecond so nothing is skipped.
        let worker = spawn_encode_worker(
            shared.clone(),
            rx,
            1_000_000,
            80,
            health.clone(),
            running.clone(),
        );

        tx.send(task(1)).unwrap();
        tx.send(task(2)).unwrap();
        drop(tx);
        worker.join().unwrap();

        let packet: Option<FramePacket> = shared.lock().unwrap().clone();
        let packet = packet.expect("no packet published");
        assert_eq!(packet.frame_number, 2);
        assert!(packet.jpeg.starts_with(&[0xFF, 0xD8]));
    }

    #[test]
    fn rate_cap_skips_frames_sent_back_to_back() {
        let shared: SharedFrame = Arc::new(Mutex::new(None));
        let health = Arc::new(PipelineHealth::new());
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = crossbeam_channel::bounded::<EncodeTask>(4);

        // 1 fps cap: only the first of a burst is encoded.
        let worker =
            spawn_encode_worker(shared.clone(), rx, 1, 80, health.clone(), running.clone());

        tx.send(task(1)).unwrap();
        tx.send(task(2)).unwrap();
        tx.send(task(3)).unwrap();
        drop(tx);
        worker.join().unwrap();

        let packet = shared.lock().unwrap().clone().expect("no packet published");
        assert_eq!(packet.frame_number, 1);
    }
}
