use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use linewatch::cli::Args;
use linewatch::pipeline::{self, PipelineConfig, PipelineDeps, PipelineMonitor};
use tracing::{info, warn};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = PipelineConfig::load_or_default(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    pipeline::init_telemetry(&config.logging)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(err) = ctrlc::set_handler({
        let shutdown = shutdown.clone();
        move || {
            shutdown.store(true, Ordering::SeqCst);
        }
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }

    let deps = PipelineDeps::from_config(&config);
    let monitor = PipelineMonitor::new();
    info!("Starting linewatch (store: {})", deps.store.describe());

    pipeline::run(&config, &deps, &monitor, shutdown)
}
