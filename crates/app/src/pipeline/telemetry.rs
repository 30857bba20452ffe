//! Tracing and Prometheus setup: console output, rolling log files, and the
//! dedicated detections log.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use defect_core::DefectLogEntry;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use super::config::LoggingSection;

/// Target carrying the per-defect audit lines. Routed to its own file and
/// kept out of the general streams.
pub(crate) const DETECTIONS_TARGET: &str = "linewatch::detections";

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub(crate) fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            tracing::warn!("metrics recorder already installed: {err}");
        }

        let upkeep_handle = handle.clone();
        PROM_UPKEEP_THREAD.get_or_init(|| {
            spawn_thread("prometheus-upkeep", move || {
                loop {
                    thread::sleep(Duration::from_secs(5));
                    upkeep_handle.run_upkeep();
                }
            })
            .expect("failed to spawn prometheus upkeep thread")
        });

        handle
    })
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the global tracing subscriber: console plus three files under the
/// configured log directory.
///
/// * `linewatch.log` gets everything at `debug` and above.
/// * `errors.log` gets `error` events only.
/// * `detections.log` gets the [`DETECTIONS_TARGET`] audit lines and nothing
///   else; those lines are excluded from the other streams.
///
/// An unwritable log file costs its layer, not the process: the failure is
/// reported on stderr and the remaining layers are installed.
pub fn init_telemetry(logging: &LoggingSection) -> Result<()> {
    let dir_ok = match fs::create_dir_all(&logging.dir) {
        Ok(()) => true,
        Err(err) => {
            eprintln!(
                "linewatch: cannot create log directory {}: {err}; file logging disabled",
                logging.dir.display()
            );
            false
        }
    };

    let general = dir_ok
        .then(|| try_log_file(&logging.dir, "linewatch.log"))
        .flatten();
    let errors = dir_ok
        .then(|| try_log_file(&logging.dir, "errors.log"))
        .flatten();
    let detections = dir_ok
        .then(|| try_log_file(&logging.dir, "detections.log"))
        .flatten();

    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.console_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let not_detections = filter_fn(|metadata| metadata.target() != DETECTIONS_TARGET);
    let only_detections = filter_fn(|metadata| metadata.target() == DETECTIONS_TARGET);

    let console_layer = fmt::layer()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_filter(console_filter)
        .with_filter(not_detections.clone());

    let general_layer = general.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(file)
            .with_filter(LevelFilter::DEBUG)
            .with_filter(not_detections)
    });

    let error_layer = errors.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(file)
            .with_filter(LevelFilter::ERROR)
    });

    let detections_layer = detections.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_level(false)
            .with_writer(file)
            .with_filter(only_detections)
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(general_layer)
        .with(error_layer)
        .with(detections_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

fn try_log_file(dir: &Path, name: &str) -> Option<Arc<File>> {
    let path = dir.join(name);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(Arc::new(file)),
        Err(err) => {
            eprintln!(
                "linewatch: failed to open log file {}: {err}; continuing without it",
                path.display()
            );
            None
        }
    }
}

/// Append one admitted defect to the detections log.
pub(crate) fn log_detection(entry: &DefectLogEntry) {
    let [x1, y1, x2, y2] = entry.bbox.corners();
    tracing::info!(
        target: DETECTIONS_TARGET,
        "Defect: {} | Confidence: {:.3} | BBox: [{:.1}, {:.1}, {:.1}, {:.1}]",
        entry.class.slug(),
        entry.confidence,
        x1,
        y1,
        x2,
        y2,
    );
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
