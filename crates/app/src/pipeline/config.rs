use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use camera_ingest::{CameraConfig, SourceKind};
use defect_core::{AggregatorSettings, ClassTable, DefectClass};
use serde::Deserialize;

/// Default config file probed when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "linewatch.toml";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub camera: CameraSection,
    pub detector: DetectorSection,
    pub cooldown: CooldownSection,
    pub storage: StorageSection,
    pub stream: StreamSection,
    pub server: ServerSection,
    pub pipeline: PipelineSection,
    pub logging: LoggingSection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Device,
    Synthetic,
}

impl SourceMode {
    pub fn kind(self) -> SourceKind {
        match self {
            SourceMode::Device => SourceKind::Device,
            SourceMode::Synthetic => SourceKind::Synthetic,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraSection {
    pub source: SourceMode,
    pub index: u32,
    pub width: i32,
    pub height: i32,
    pub fps: u32,
    /// Per-frame read timeout before the source is reopened.
    pub read_timeout_ms: u64,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            source: SourceMode::Synthetic,
            index: 1,
            width: 1280,
            height: 720,
            fps: 30,
            read_timeout_ms: 2000,
        }
    }
}

impl CameraSection {
    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            index: self.index,
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorSection {
    pub model: PathBuf,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_per_frame: usize,
    /// Class id remapping. Empty means the built-in bottle table.
    pub classes: Vec<ClassEntry>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassEntry {
    pub id: i64,
    pub class: String,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            model: PathBuf::from("models/bottle-defects.onnx"),
            input_size: 640,
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            max_per_frame: 5,
            classes: Vec::new(),
        }
    }
}

impl DetectorSection {
    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            max_per_frame: self.max_per_frame,
        }
    }

    /// Builds the id-to-class table, rejecting partial or ambiguous maps.
    pub fn class_table(&self) -> Result<ClassTable> {
        if self.classes.is_empty() {
            return Ok(ClassTable::builtin());
        }
        let mut entries = Vec::with_capacity(self.classes.len());
        for entry in &self.classes {
            let class = DefectClass::from_slug(&entry.class)
                .with_context(|| format!("unknown defect class `{}`", entry.class))?;
            entries.push((entry.id, class));
        }
        ClassTable::new(entries).context("invalid [detector] class table")
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CooldownSection {
    pub seconds: f64,
}

impl Default for CooldownSection {
    fn default() -> Self {
        Self { seconds: 2.0 }
    }
}

impl CooldownSection {
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.seconds.max(0.0))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    /// Directory the document store lives under.
    pub root: PathBuf,
    pub database: String,
    pub collection: String,
    pub queue_capacity: usize,
    pub retry_max_attempts: u32,
    pub shutdown_grace_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            database: "bottle_defect_detection".to_string(),
            collection: "defects".to_string(),
            queue_capacity: 256,
            retry_max_attempts: 5,
            shutdown_grace_ms: 3000,
        }
    }
}

impl StorageSection {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSection {
    pub fps_cap: u32,
    pub jpeg_quality: u8,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            fps_cap: 15,
            jpeg_quality: 85,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
        }
    }
}

impl ServerSection {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid [server] bind address `{}`", self.bind))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub workers: usize,
    pub restart_attempts: u32,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: 1,
            restart_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub dir: PathBuf,
    /// Console verbosity; `RUST_LOG` takes precedence when set.
    pub console_level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            console_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise probes [`DEFAULT_CONFIG_PATH`] and
    /// falls back to the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load(default)
                } else {
                    let config = Self::default();
                    config.validate()?;
                    Ok(config)
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width <= 0 || self.camera.height <= 0 {
            bail!("[camera] width and height must be positive");
        }
        if self.camera.fps == 0 {
            bail!("[camera] fps must be at least 1");
        }
        if self.camera.read_timeout_ms == 0 {
            bail!("[camera] read_timeout_ms must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            bail!("[detector] confidence_threshold must be within 0.0..=1.0");
        }
        if !(0.0..=1.0).contains(&self.detector.iou_threshold) {
            bail!("[detector] iou_threshold must be within 0.0..=1.0");
        }
        if self.detector.max_per_frame == 0 {
            bail!("[detector] max_per_frame must be at least 1");
        }
        if self.detector.input_size == 0 {
            bail!("[detector] input_size must be at least 1");
        }
        self.detector.class_table().map(|_| ())?;
        if self.cooldown.seconds < 0.0 {
            bail!("[cooldown] seconds must not be negative");
        }
        if self.storage.queue_capacity == 0 {
            bail!("[storage] queue_capacity must be at least 1");
        }
        if self.storage.database.is_empty() {
            bail!("[storage] database must not be empty");
        }
        if self.storage.collection.is_empty() {
            bail!("[storage] collection must not be empty");
        }
        if self.stream.fps_cap == 0 {
            bail!("[stream] fps_cap must be at least 1");
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            bail!("[stream] jpeg_quality must be within 1..=100");
        }
        if self.pipeline.workers == 0 {
            bail!("[pipeline] workers must be at least 1");
        }
        self.server.bind_addr().map(|_| ())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_pass_validation() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.source, SourceMode::Synthetic);
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.detector.confidence_threshold, 0.5);
        assert_eq!(config.detector.iou_threshold, 0.45);
        assert_eq!(config.detector.max_per_frame, 5);
        assert_eq!(config.cooldown.seconds, 2.0);
        assert_eq!(config.storage.database, "bottle_defect_detection");
        assert_eq!(config.storage.collection, "defects");
        assert_eq!(config.stream.fps_cap, 15);
        assert_eq!(config.server.bind, "0.0.0.0:5000");
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[camera]\nsource = \"device\"\nindex = 0\n\n[stream]\nfps_cap = 10\n\n[storage]\ncollection = \"defects_v2\"\n"
        )
        .unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.camera.source, SourceMode::Device);
        assert_eq!(config.camera.index, 0);
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.stream.fps_cap, 10);
        assert_eq!(config.stream.jpeg_quality, 85);
        assert_eq!(config.storage.collection, "defects_v2");
        assert_eq!(config.storage.database, "bottle_defect_detection");
        assert_eq!(config.detector.max_per_frame, 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<PipelineConfig>("[camera]\nsoruce = \"device\"\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("soruce"), "unexpected error: {err}");
    }

    #[test]
    fn out_of_range_thresholds_fail_validation() {
        let mut config = PipelineConfig::default();
        config.detector.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.stream.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.server.bind = "not-an-addr".to_string();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.storage.collection = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_class_table_is_built_and_checked() {
        let raw = r#"
[[detector.classes]]
id = 7
class = "cap"

[[detector.classes]]
id = 8
class = "crumbled"

[[detector.classes]]
id = 9
class = "label"

[[detector.classes]]
id = 10
class = "no-cap"

[[detector.classes]]
id = 11
class = "not-crumbled"
"#;
        let config: PipelineConfig = toml::from_str(raw).unwrap();
        let table = config.detector.class_table().unwrap();
        assert_eq!(table.lookup(7), Some(DefectClass::Cap));
        assert_eq!(table.lookup(11), Some(DefectClass::NotCrumbled));
        assert_eq!(table.lookup(0), None);
    }

    #[test]
    fn partial_class_table_fails_validation() {
        let raw = "[[detector.classes]]\nid = 0\nclass = \"cap\"\n";
        let config: PipelineConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn window_is_derived_from_seconds() {
        let section = CooldownSection { seconds: 2.0 };
        assert_eq!(section.window(), Duration::from_secs(2));
        let section = CooldownSection { seconds: -1.0 };
        assert_eq!(section.window(), Duration::ZERO);
    }
}
