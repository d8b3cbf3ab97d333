#![allow(unexpected_cfgs, non_local_definitions)]

pub mod catalog;
pub mod config;
pub mod dataset;
pub mod discovery;
pub mod driver;
pub mod episode;
pub mod schema;
pub mod sink;
pub mod stats;
pub mod trajectory;
pub mod writer;

use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

pub use config::ConvertConfig;
pub use dataset::DatasetReader;
pub use discovery::{EpisodePath, discover_episodes};
pub use driver::{DriverOptions, DriverStats, run_conversion};
pub use episode::{AssemblyError, AssemblyOptions, Episode, EpisodeAssembler, Step};
pub use sink::{DatasetSink, ShardedDatasetSink, SinkOptions};
pub use trajectory::{ExportLoader, TrajectoryLoader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionSummary {
    pub discovered: usize,
    pub written: usize,
    pub skipped: usize,
    pub steps: usize,
    pub shards: usize,
}

/// Discover the sessions under `cfg.data_path`, convert them in parallel and
/// write the dataset to `cfg.output_dir`.
pub fn convert_dataset<L>(cfg: &ConvertConfig, loader: &L) -> Result<ConversionSummary>
where
    L: TrajectoryLoader + ?Sized,
{
    cfg.validate()?;
    let paths = discover_episodes(
        &cfg.data_path,
        &cfg.layout,
        &cfg.dates,
        cfg.on_unparsed_name,
    )
    .with_context(|| format!("failed to discover episodes in {}", cfg.data_path.display()))?;
    info!("Found {} episodes!", paths.len());
    if paths.is_empty() {
        bail!("no episodes to convert under {}", cfg.data_path.display());
    }

    let mut sink = ShardedDatasetSink::create(&SinkOptions {
        output_dir: cfg.output_dir.clone(),
        dataset_name: cfg.dataset_name.clone(),
        resolution: cfg.image.resolution(),
        jpeg_quality: cfg.image.jpeg_quality,
        rows_per_shard: cfg.rows_per_shard,
        overwrite: cfg.overwrite,
    })?;
    let assembler = EpisodeAssembler::new(
        loader,
        AssemblyOptions {
            resolution: cfg.image.resolution(),
            filter_no_ops: cfg.filter_no_ops,
            language_instruction: cfg.language_instruction.clone(),
        },
    );
    let stats = run_conversion(
        &paths,
        &assembler,
        &mut sink,
        &DriverOptions {
            workers: cfg.workers,
            max_paths_in_memory: cfg.max_paths_in_memory,
        },
    )?;
    let written = sink.finish()?;

    let summary = ConversionSummary {
        discovered: paths.len(),
        written: stats.written,
        skipped: stats.skipped,
        steps: written.steps,
        shards: written.shards,
    };
    info!(
        "Converted {} of {} episodes ({} skipped, {} steps, {} shards)",
        summary.written, summary.discovered, summary.skipped, summary.steps, summary.shards
    );
    Ok(summary)
}

pub(crate) fn default_progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta})",
        )
        .unwrap()
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb
}
