//! Command-line interface: a small set of overrides on top of the TOML
//! configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::pipeline::{PipelineConfig, SourceMode};

#[derive(Debug, Parser)]
#[command(name = "linewatch")]
#[command(about = "Real-time bottle-defect detection over a camera feed", version)]
pub struct Args {
    /// Configuration file (TOML); defaults to ./linewatch.toml when present.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Capture backend: a real camera device or the synthetic test source.
    #[arg(long, value_enum)]
    pub source: Option<SourceMode>,

    /// Camera device index (used with --source device).
    #[arg(long)]
    pub camera_index: Option<u32>,

    /// Address for the HTTP server, e.g. 0.0.0.0:5000.
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory for the log files.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log debug detail to the console.
    #[arg(long, short)]
    pub verbose: bool,
}

impl Args {
    /// Fold the command-line overrides into a loaded configuration.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(source) = self.source {
            config.camera.source = source;
        }
        if let Some(index) = self.camera_index {
            config.camera.index = index;
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.logging.dir = dir.clone();
        }
        if self.verbose {
            config.logging.console_level = "debug".to_string();
        }
    }
}
