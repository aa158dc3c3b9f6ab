use anyhow::{bail, Context, Result};
use roster_core::{EngineConfig, ReportFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file read when `--config` is not given, if present.
pub const DEFAULT_CONFIG_FILE: &str = "roster.toml";

/// Application configuration: TOML file, then `ROSTER_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite attendance database.
    pub database_path: PathBuf,
    /// Directory of reference images named after each student.
    pub gallery_dir: PathBuf,
    /// Gallery embedding cache (default: `<gallery_dir>/.gallery-cache.json`).
    pub cache_path: Option<PathBuf>,
    /// Directory receiving session reports.
    pub report_dir: PathBuf,
    /// Maximum embedding distance accepted as a match.
    pub threshold: f32,
    /// Embedding extraction model ("hog" or "cnn").
    pub model: String,
    pub report_format: ReportFormat,
    /// Camera index; only meaningful to capture front-ends.
    pub camera_index: u32,
    /// Match every N-th frame.
    pub frame_stride: usize,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Days of attendance history kept by `cleanup`.
    pub retention_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/attendance.db"),
            gallery_dir: PathBuf::from("data/student_images"),
            cache_path: None,
            report_dir: PathBuf::from("reports"),
            threshold: 0.5,
            model: "hog".to_string(),
            report_format: ReportFormat::Csv,
            camera_index: 0,
            frame_stride: 2,
            log_level: "info".to_string(),
            retention_days: 90,
        }
    }
}

impl Config {
    /// Load from `path` (which must exist), or from `roster.toml` if present,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `ROSTER_*` overrides. Unparseable values leave the field unchanged.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROSTER_DB_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROSTER_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROSTER_CACHE_PATH") {
            self.cache_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("ROSTER_REPORT_DIR") {
            self.report_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROSTER_MODEL") {
            self.model = v;
        }
        if let Some(v) = var("ROSTER_LOG_LEVEL") {
            self.log_level = v;
        }
        parse_into(&var, "ROSTER_THRESHOLD", &mut self.threshold);
        parse_into(&var, "ROSTER_REPORT_FORMAT", &mut self.report_format);
        parse_into(&var, "ROSTER_CAMERA_INDEX", &mut self.camera_index);
        parse_into(&var, "ROSTER_FRAME_STRIDE", &mut self.frame_stride);
        parse_into(&var, "ROSTER_RETENTION_DAYS", &mut self.retention_days);
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            bail!("threshold must be a non-negative number, got {}", self.threshold);
        }
        if self.frame_stride == 0 {
            bail!("frame_stride must be at least 1");
        }
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| self.gallery_dir.join(".gallery-cache.json"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            threshold: self.threshold,
            report_format: self.report_format,
            model: self.model.clone(),
        }
    }
}

fn parse_into<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = var(key).and_then(|v| v.parse().ok()) {
        *slot = v;
    }
}
