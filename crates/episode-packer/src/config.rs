//! Conversion configuration loaded from TOML and overridden from the CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use serde::Deserialize;

/// Full configuration for one conversion run.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvertConfig {
    /// Root directory holding the dated session folders.
    pub data_path: PathBuf,
    /// Directory receiving the packed dataset.
    pub output_dir: PathBuf,

    #[serde(default = "defaults::dataset_name")]
    pub dataset_name: String,

    /// Instruction attached to every step of every episode.
    #[serde(default = "defaults::language_instruction")]
    pub language_instruction: String,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub dates: DateRange,

    /// Drop steps whose commanded cartesian velocity is exactly zero.
    #[serde(default = "defaults::filter_no_ops")]
    pub filter_no_ops: bool,

    /// Number of parallel conversion workers.
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Paths converted and held in memory before they are flushed to disk.
    #[serde(default = "defaults::max_paths_in_memory")]
    pub max_paths_in_memory: usize,

    /// Maximum step rows per `.npy` shard (omit for a single `steps.npy`).
    #[serde(default)]
    pub rows_per_shard: Option<usize>,

    #[serde(default)]
    pub overwrite: bool,

    #[serde(default)]
    pub on_unparsed_name: UnparsedNamePolicy,

    #[serde(default)]
    pub layout: Layout,
}

/// Output image geometry and encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    #[serde(default = "defaults::image_height")]
    pub height: u32,
    #[serde(default = "defaults::image_width")]
    pub width: u32,
    #[serde(default = "defaults::jpeg_quality")]
    pub jpeg_quality: u8,
}

impl ImageConfig {
    pub fn resolution(&self) -> ImageResolution {
        ImageResolution {
            height: self.height,
            width: self.width,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            height: defaults::image_height(),
            width: defaults::image_width(),
            jpeg_quality: defaults::jpeg_quality(),
        }
    }
}

/// Target image size, stored (height, width) like the tensors it describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageResolution {
    pub height: u32,
    pub width: u32,
}

/// Inclusive session date window; either bound may be left open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DateRange {
    #[serde(default)]
    pub initial: Option<NaiveDateTime>,
    #[serde(default, rename = "final")]
    pub final_: Option<NaiveDateTime>,
}

impl DateRange {
    pub fn is_bounded(&self) -> bool {
        self.initial.is_some() || self.final_.is_some()
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.initial.is_none_or(|start| ts >= start) && self.final_.is_none_or(|end| ts <= end)
    }
}

/// What to do with a session directory whose name is not a timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UnparsedNamePolicy {
    /// Abort the run before any conversion starts.
    #[default]
    Fail,
    /// Log a warning and leave the directory out.
    Skip,
}

/// File names expected inside each session directory.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Layout {
    #[serde(default = "defaults::log_file")]
    pub log_file: String,
    #[serde(default = "defaults::recordings_dir")]
    pub recordings_dir: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            log_file: defaults::log_file(),
            recordings_dir: defaults::recordings_dir(),
        }
    }
}

impl ConvertConfig {
    /// Configuration with every optional field at its default.
    pub fn new(data_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            output_dir: output_dir.into(),
            dataset_name: defaults::dataset_name(),
            language_instruction: defaults::language_instruction(),
            image: ImageConfig::default(),
            dates: DateRange::default(),
            filter_no_ops: defaults::filter_no_ops(),
            workers: defaults::workers(),
            max_paths_in_memory: defaults::max_paths_in_memory(),
            rows_per_shard: None,
            overwrite: false,
            on_unparsed_name: UnparsedNamePolicy::default(),
            layout: Layout::default(),
        }
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Reject configurations that would make the run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be > 0");
        }
        if self.max_paths_in_memory == 0 {
            bail!("max_paths_in_memory must be > 0");
        }
        if self.rows_per_shard == Some(0) {
            bail!("rows_per_shard must be > 0 when specified");
        }
        if self.image.height == 0 || self.image.width == 0 {
            bail!(
                "image resolution must be non-zero, got {}x{}",
                self.image.height,
                self.image.width
            );
        }
        if !(1..=100).contains(&self.image.jpeg_quality) {
            bail!("jpeg_quality must be in 1..=100");
        }
        if let (Some(start), Some(end)) = (self.dates.initial, self.dates.final_) {
            if start > end {
                bail!("dates.initial ({start}) is after dates.final ({end})");
            }
        }
        if self.layout.log_file.is_empty() {
            bail!("layout.log_file must not be empty");
        }
        Ok(())
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn dataset_name() -> String { "liris_fold_fabric_triangle".to_string() }
    pub fn language_instruction() -> String { "Fold the fabric into a triangle".to_string() }
    pub fn image_height() -> u32 { 360 }
    pub fn image_width() -> u32 { 640 }
    pub fn jpeg_quality() -> u8 { 95 }
    pub fn filter_no_ops() -> bool { true }
    pub fn workers() -> usize { 4 }
    pub fn max_paths_in_memory() -> usize { 20 }
    pub fn log_file() -> String { "trajectory.h5".to_string() }
    pub fn recordings_dir() -> PathBuf { PathBuf::from("recordings").join("MP4") }
}
