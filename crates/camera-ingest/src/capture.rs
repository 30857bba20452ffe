//! Background capture worker with automatic device reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use tracing::{info, warn};

use crate::open_source;
use crate::types::{CameraConfig, CaptureError, Frame, FrameSource, SourceKind};

/// Delay before the first reopen attempt; doubles per attempt.
pub const RECONNECT_BASE_DELAY_MS: u64 = 100;
/// Ceiling on the per-attempt reopen delay.
pub const RECONNECT_MAX_DELAY_MS: u64 = 5_000;
/// Open attempts before the worker gives up on the device.
pub const RECONNECT_ATTEMPTS: u32 = 5;

/// Slice for interruptible sleeps so a stop request cuts a backoff short.
const SLEEP_SLICE: Duration = Duration::from_millis(100);
/// How long a send may block before the stop flag is rechecked.
const SEND_PATIENCE: Duration = Duration::from_millis(500);

/// Spawns a background thread that reads frames from the configured source
/// and forwards them over the returned [`Receiver`].
///
/// The buffer is intentionally small to backpressure the capture loop when
/// downstream consumers fall behind. A failed read closes and reopens the
/// device with exponential backoff; once [`RECONNECT_ATTEMPTS`] consecutive
/// opens fail the worker sends the final error and exits, which callers
/// treat as fatal.
pub fn spawn_capture_worker(
    kind: SourceKind,
    config: CameraConfig,
    read_timeout: Duration,
    stop: Arc<AtomicBool>,
) -> Result<(Receiver<Result<Frame, CaptureError>>, JoinHandle<()>), CaptureError> {
    let (tx, rx) = bounded(2);
    let uri = source_uri(kind, &config);
    let handle = thread::Builder::new()
        .name("linewatch-capture".into())
        .spawn(move || {
            let open = || open_source(kind, &config);
            capture_loop(open, &uri, read_timeout, &stop, &tx);
        })
        .map_err(|e| CaptureError::Other(e.into()))?;
    Ok((rx, handle))
}

/// Main capture loop executed on the background thread.
///
/// `open` produces a fresh source; it is called at startup and after every
/// failed read.
fn capture_loop<F>(
    open: F,
    uri: &str,
    read_timeout: Duration,
    stop: &AtomicBool,
    tx: &Sender<Result<Frame, CaptureError>>,
) where
    F: Fn() -> Result<Box<dyn FrameSource>, CaptureError>,
{
    let mut source = match acquire_source(&open, uri, stop) {
        Ok(source) => source,
        Err(err) => {
            if !stop.load(Ordering::Relaxed) {
                let _ = tx.send(Err(err));
            }
            return;
        }
    };
    info!("Capture started on {}", source.uri());

    while !stop.load(Ordering::Relaxed) {
        match source.next_frame(read_timeout) {
            Ok(frame) => {
                if !forward(frame, stop, tx) {
                    return;
                }
            }
            Err(err) => {
                warn!("Frame read failed on {}: {err}", source.uri());
                // Release the device fully before asking for it again.
                drop(source);
                source = match acquire_source(&open, uri, stop) {
                    Ok(source) => source,
                    Err(err) => {
                        if !stop.load(Ordering::Relaxed) {
                            let _ = tx.send(Err(err));
                        }
                        return;
                    }
                };
                info!("Capture resumed on {}", source.uri());
            }
        }
    }
}

/// Open the source, retrying with exponential backoff between attempts.
///
/// Returns the last open error once the attempt budget is spent or the stop
/// flag interrupts the backoff.
fn acquire_source<F>(
    open: &F,
    uri: &str,
    stop: &AtomicBool,
) -> Result<Box<dyn FrameSource>, CaptureError>
where
    F: Fn() -> Result<Box<dyn FrameSource>, CaptureError>,
{
    let mut delay = Duration::from_millis(RECONNECT_BASE_DELAY_MS);
    let mut last_err = None;

    for attempt in 1..=RECONNECT_ATTEMPTS {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match open() {
            Ok(source) => return Ok(source),
            Err(err) => {
                warn!(
                    "Failed to open capture source {uri} (attempt {attempt}/{RECONNECT_ATTEMPTS}): {err}"
                );
                last_err = Some(err);
            }
        }
        if attempt < RECONNECT_ATTEMPTS {
            sleep_interruptible(delay, stop);
            delay = (delay * 2).min(Duration::from_millis(RECONNECT_MAX_DELAY_MS));
        }
    }

    Err(last_err.unwrap_or_else(|| CaptureError::DeviceUnavailable {
        uri: uri.to_string(),
    }))
}

/// Identifier used in logs before a source has been opened.
fn source_uri(kind: SourceKind, config: &CameraConfig) -> String {
    match kind {
        SourceKind::Device => format!("/dev/video{}", config.index),
        SourceKind::Synthetic => "synthetic".to_string(),
    }
}

/// Hand a frame downstream, blocking in short slices.
///
/// Returns `false` when the receiver is gone or a stop request arrives while
/// the channel is full.
fn forward(frame: Frame, stop: &AtomicBool, tx: &Sender<Result<Frame, CaptureError>>) -> bool {
    let mut pending = Ok(frame);
    loop {
        match tx.send_timeout(pending, SEND_PATIENCE) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if stop.load(Ordering::Relaxed) {
                    return false;
                }
                pending = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Sleep in short slices so the stop flag is honored promptly.
fn sleep_interruptible(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while remaining > Duration::ZERO && !stop.load(Ordering::Relaxed) {
        let slice = remaining.min(SLEEP_SLICE);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::types::FrameFormat;

    fn test_config() -> CameraConfig {
        CameraConfig {
            index: 0,
            width: 32,
            height: 24,
            fps: 500,
        }
    }

    /// Source whose `fail_at`-th read reports a timeout.
    struct FlakySource {
        reads: usize,
        fail_at: Option<usize>,
    }

    impl FrameSource for FlakySource {
        fn uri(&self) -> &str {
            "flaky"
        }

        fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
            self.reads += 1;
            if self.fail_at == Some(self.reads) {
                return Err(CaptureError::ReadFailed {
                    uri: "flaky".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Ok(Frame {
                data: vec![0; 8 * 4 * 3],
                width: 8,
                height: 4,
                timestamp_ms: self.reads as i64,
                format: FrameFormat::Bgr8,
            })
        }
    }

    #[test]
    fn synthetic_worker_streams_frames() {
        let stop = Arc::new(AtomicBool::new(false));
        let (rx, handle) = spawn_capture_worker(
            SourceKind::Synthetic,
            test_config(),
            Duration::from_secs(1),
            stop.clone(),
        )
        .unwrap();

        for _ in 0..3 {
            let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
            assert_eq!(frame.width, 32);
            assert_eq!(frame.height, 24);
            assert_eq!(frame.data.len(), 32 * 24 * 3);
        }

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn stop_flag_ends_the_worker_even_when_nobody_drains() {
        let stop = Arc::new(AtomicBool::new(false));
        let (rx, handle) = spawn_capture_worker(
            SourceKind::Synthetic,
            test_config(),
            Duration::from_secs(1),
            stop.clone(),
        )
        .unwrap();

        // Let the bounded channel fill up while we ignore it.
        std::thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        drop(rx);
    }

    #[test]
    fn worker_exits_when_the_receiver_is_dropped() {
        let stop = Arc::new(AtomicBool::new(false));
        let (rx, handle) = spawn_capture_worker(
            SourceKind::Synthetic,
            test_config(),
            Duration::from_secs(1),
            stop,
        )
        .unwrap();

        let _ = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        drop(rx);
        handle.join().unwrap();
    }

    #[test]
    fn single_read_failure_reopens_and_keeps_streaming() {
        let opens = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(2);

        let handle = {
            let opens = opens.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let open = move || {
                    // The first source dies on its second read; replacements
                    // are healthy.
                    let fail_at = match opens.fetch_add(1, Ordering::SeqCst) {
                        0 => Some(2),
                        _ => None,
                    };
                    Ok(Box::new(FlakySource { reads: 0, fail_at }) as Box<dyn FrameSource>)
                };
                capture_loop(open, "flaky", Duration::from_millis(50), &stop, &tx);
            })
        };

        for _ in 0..5 {
            let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
            assert_eq!(frame.data.len(), 8 * 4 * 3);
        }
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        stop.store(true, Ordering::SeqCst);
        drop(rx);
        handle.join().unwrap();
    }

    #[cfg(not(feature = "with-opencv"))]
    #[test]
    fn unopenable_device_surfaces_a_fatal_error() {
        let stop = Arc::new(AtomicBool::new(false));
        let (rx, handle) = spawn_capture_worker(
            SourceKind::Device,
            test_config(),
            Duration::from_secs(1),
            stop,
        )
        .unwrap();

        // Five open attempts with backoff take a little over a second.
        let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(outcome.is_err());
        handle.join().unwrap();
    }
}
