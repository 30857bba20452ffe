//! Persistence sink: a bounded queue between the frame path and the defect
//! store, drained by a dedicated worker.
//!
//! The frame path never blocks on storage. When the queue is full the oldest
//! entry is evicted; when the store rejects a write the worker retries with
//! exponential backoff before giving the entry up.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use defect_core::DefectLogEntry;
use tracing::{debug, warn};

use crate::pipeline::{
    data::DefectCounters,
    store::{DefectStore, StoreError},
    telemetry,
};

const RETRY_BASE_DELAY_MS: u64 = 100;
const RETRY_MAX_DELAY_MS: u64 = 5_000;
// Sleep slice while backing off, so a shutdown deadline is honoured promptly.
const RETRY_SLEEP_SLICE_MS: u64 = 50;

/// Where a recorded entry ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordOutcome {
    Queued,
    /// Queue was full; the oldest queued entry was dropped to make room.
    DroppedOldest,
    /// Queue stayed full or the worker is gone; this entry was dropped.
    DroppedNewest,
}

/// Handle owned by the pipeline. Cloneable across processing workers.
#[derive(Clone)]
pub(crate) struct SinkHandle {
    tx: Sender<DefectLogEntry>,
    evict_rx: Receiver<DefectLogEntry>,
    counters: Arc<DefectCounters>,
}

impl SinkHandle {
    /// Queue one admitted defect for persistence. Never blocks.
    pub(crate) fn record(&self, entry: DefectLogEntry) -> RecordOutcome {
        let outcome = match self.tx.try_send(entry) {
            Ok(()) => RecordOutcome::Queued,
            Err(TrySendError::Full(entry)) => {
                if let Ok(evicted) = self.evict_rx.try_recv() {
                    warn!(
                        "Persistence queue full; dropping oldest entry ({} @ frame {})",
                        evicted.class.slug(),
                        evicted.frame_number
                    );
                }
                match self.tx.try_send(entry) {
                    Ok(()) => RecordOutcome::DroppedOldest,
                    Err(_) => RecordOutcome::DroppedNewest,
                }
            }
            Err(TrySendError::Disconnected(_)) => RecordOutcome::DroppedNewest,
        };

        match outcome {
            RecordOutcome::Queued => {}
            RecordOutcome::DroppedOldest | RecordOutcome::DroppedNewest => {
                self.counters.record_store_drop();
                metrics::counter!("linewatch_store_dropped_total").increment(1);
            }
        }
        metrics::gauge!("linewatch_store_queue_depth").set(self.tx.len() as f64);
        outcome
    }
}

/// Owner side of the sink: holds the worker thread and the close deadline.
pub(crate) struct PersistenceSink {
    handle: SinkHandle,
    deadline: Arc<Mutex<Option<Instant>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PersistenceSink {
    pub(crate) fn spawn(
        store: Arc<dyn DefectStore>,
        collection: String,
        queue_capacity: usize,
        retry_max_attempts: u32,
        counters: Arc<DefectCounters>,
    ) -> Self {
        let (tx, rx) = bounded::<DefectLogEntry>(queue_capacity.max(1));
        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        debug!(
            "Persistence sink started ({}, collection {collection})",
            store.describe()
        );
        let worker = {
            let rx = rx.clone();
            let deadline = deadline.clone();
            let counters = counters.clone();
            telemetry::spawn_thread("linewatch-store", move || {
                run_worker(store, &collection, rx, deadline, retry_max_attempts, counters);
            })
            .expect("failed to spawn persistence worker")
        };

        Self {
            handle: SinkHandle {
                tx,
                evict_rx: rx,
                counters,
            },
            deadline,
            worker: Some(worker),
        }
    }

    pub(crate) fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Stop accepting entries and drain the queue, giving the worker at most
    /// `grace` to finish in-flight writes.
    pub(crate) fn close(mut self, grace: Duration) {
        if let Ok(mut guard) = self.deadline.lock() {
            *guard = Some(Instant::now() + grace);
        }
        drop(self.handle);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    store: Arc<dyn DefectStore>,
    collection: &str,
    rx: Receiver<DefectLogEntry>,
    deadline: Arc<Mutex<Option<Instant>>>,
    retry_max_attempts: u32,
    counters: Arc<DefectCounters>,
) {
    loop {
        match rx.recv_timeout(Duration::from_millis(RETRY_SLEEP_SLICE_MS)) {
            Ok(entry) => {
                metrics::gauge!("linewatch_store_queue_depth").set(rx.len() as f64);
                deliver(
                    store.as_ref(),
                    collection,
                    entry,
                    &deadline,
                    retry_max_attempts,
                    &counters,
                );
            }
            // Every handle is gone; nothing more can arrive.
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        // A SinkHandle clone may outlive close(). Once the deadline is armed
        // the worker exits when the queue is empty or the grace runs out,
        // instead of waiting for the channel to disconnect.
        if let Some(limit) = close_deadline(&deadline) {
            if rx.is_empty() || Instant::now() >= limit {
                break;
            }
        }
    }
    debug!("Persistence sink drained");
}

fn close_deadline(deadline: &Arc<Mutex<Option<Instant>>>) -> Option<Instant> {
    deadline.lock().ok().and_then(|guard| *guard)
}

fn deliver(
    store: &dyn DefectStore,
    collection: &str,
    entry: DefectLogEntry,
    deadline: &Arc<Mutex<Option<Instant>>>,
    retry_max_attempts: u32,
    counters: &DefectCounters,
) {
    let attempts = retry_max_attempts.max(1);
    let document = entry.document();

    for attempt in 0..attempts {
        if let Some(limit) = close_deadline(deadline) {
            if Instant::now() >= limit {
                warn!(
                    "Shutdown grace expired; dropping {} defect from frame {}",
                    entry.class.slug(),
                    entry.frame_number
                );
                counters.record_store_drop();
                metrics::counter!("linewatch_store_dropped_total").increment(1);
                return;
            }
        }

        match store.insert(collection, &document) {
            Ok(()) => {
                metrics::counter!("linewatch_defects_persisted_total", "class" => entry.class.slug())
                    .increment(1);
                return;
            }
            Err(StoreError::Unavailable { reason }) => {
                let last = attempt + 1 == attempts;
                if last {
                    warn!(
                        "Dropping {} defect from frame {} after {} attempts: {reason}",
                        entry.class.slug(),
                        entry.frame_number,
                        attempts
                    );
                    counters.record_store_drop();
                    metrics::counter!("linewatch_store_dropped_total").increment(1);
                    return;
                }
                metrics::counter!("linewatch_store_retries_total").increment(1);
                warn!(
                    "Store write failed (attempt {}/{}): {reason}",
                    attempt + 1,
                    attempts
                );
                backoff_sleep(attempt, deadline);
            }
        }
    }
}

/// Exponential backoff, sliced so a pending close deadline cuts it short.
fn backoff_sleep(attempt: u32, deadline: &Arc<Mutex<Option<Instant>>>) {
    let shift = attempt.min(16);
    let delay = (RETRY_BASE_DELAY_MS << shift).min(RETRY_MAX_DELAY_MS);
    let until = Instant::now() + Duration::from_millis(delay);
    loop {
        let now = Instant::now();
        if now >= until {
            return;
        }
        if let Some(limit) = close_deadline(deadline) {
            if now >= limit {
                return;
            }
        }
        let remaining = until - now;
        thread::sleep(remaining.min(Duration::from_millis(RETRY_SLEEP_SLICE_MS)));
    }
}
