use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::NaiveDateTime;
use clap::Parser;
use env_logger::Env;
use episode_packer::config::UnparsedNamePolicy;
use episode_packer::{ConvertConfig, ExportLoader, convert_dataset};
use log::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Convert dated teleoperation sessions into steps.npy shards + metadata.db"
)]
struct Cli {
    /// TOML configuration; flags below override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Root directory holding the dated session folders
    #[arg(long, value_name = "DIR")]
    data_path: Option<PathBuf>,

    /// Output directory for the converted dataset
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    #[arg(long, value_name = "NAME")]
    dataset_name: Option<String>,

    /// Instruction attached to every step
    #[arg(long, value_name = "TEXT")]
    language_instruction: Option<String>,

    #[arg(long, value_name = "PX")]
    image_height: Option<u32>,

    #[arg(long, value_name = "PX")]
    image_width: Option<u32>,

    /// JPEG quality of stored frames (1-100)
    #[arg(long, value_name = "Q")]
    jpeg_quality: Option<u8>,

    /// Earliest session timestamp to convert, e.g. 2025-03-18T09:55:00
    #[arg(long, value_name = "DATETIME")]
    initial_date: Option<NaiveDateTime>,

    /// Latest session timestamp to convert (inclusive)
    #[arg(long, value_name = "DATETIME")]
    final_date: Option<NaiveDateTime>,

    /// Drop steps with an all-zero commanded cartesian velocity
    #[arg(long, value_name = "BOOL", action = clap::ArgAction::Set)]
    filter_no_ops: Option<bool>,

    /// Number of conversion worker threads
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Paths (written or skipped) held in memory before they are flushed to disk
    #[arg(long, value_name = "N")]
    max_paths_in_memory: Option<usize>,

    /// Maximum rows per shard (0 => single steps.npy)
    #[arg(long, value_name = "N")]
    shard_rows: Option<usize>,

    /// What to do with session folders whose name is not a timestamp
    #[arg(long, value_enum)]
    on_unparsed_name: Option<UnparsedNamePolicy>,

    /// Overwrite existing outputs if present
    #[arg(long)]
    overwrite: bool,
}

impl Cli {
    fn into_config(self) -> Result<ConvertConfig> {
        let mut cfg = match &self.config {
            Some(path) => ConvertConfig::from_toml(path)?,
            None => match (&self.data_path, &self.output_dir) {
                (Some(data), Some(out)) => ConvertConfig::new(data, out),
                _ => bail!("--data-path and --output-dir are required without --config"),
            },
        };
        if let Some(v) = self.data_path {
            cfg.data_path = v;
        }
        if let Some(v) = self.output_dir {
            cfg.output_dir = v;
        }
        if let Some(v) = self.dataset_name {
            cfg.dataset_name = v;
        }
        if let Some(v) = self.language_instruction {
            cfg.language_instruction = v;
        }
        if let Some(v) = self.image_height {
            cfg.image.height = v;
        }
        if let Some(v) = self.image_width {
            cfg.image.width = v;
        }
        if let Some(v) = self.jpeg_quality {
            cfg.image.jpeg_quality = v;
        }
        if self.initial_date.is_some() {
            cfg.dates.initial = self.initial_date;
        }
        if self.final_date.is_some() {
            cfg.dates.final_ = self.final_date;
        }
        if let Some(v) = self.filter_no_ops {
            cfg.filter_no_ops = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
        if let Some(v) = self.max_paths_in_memory {
            cfg.max_paths_in_memory = v;
        }
        if let Some(n) = self.shard_rows {
            cfg.rows_per_shard = (n > 0).then_some(n);
        }
        if let Some(v) = self.on_unparsed_name {
            cfg.on_unparsed_name = v;
        }
        cfg.overwrite |= self.overwrite;
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cfg = cli.into_config()?;
    let summary = convert_dataset(&cfg, &ExportLoader)?;
    info!(
        "Completed conversion: {} episodes written, {} skipped, {} steps, {} shard(s)",
        summary.written, summary.skipped, summary.steps, summary.shards
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn memory_bound_help_counts_skipped_paths() {
        let cmd = Cli::command();
        let arg = cmd
            .get_arguments()
            .find(|arg| arg.get_id() == "max_paths_in_memory")
            .unwrap();
        let help = arg.get_help().unwrap().to_string();
        assert!(help.starts_with("Paths (written or skipped)"), "{help}");
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "episode-packer",
            "--data-path",
            "/data",
            "--output-dir",
            "/out",
            "--max-paths-in-memory",
            "3",
            "--shard-rows",
            "0",
            "--on-unparsed-name",
            "skip",
            "--initial-date",
            "2025-03-18T09:55:00",
        ])
        .unwrap();
        let cfg = cli.into_config().unwrap();
        assert_eq!(cfg.max_paths_in_memory, 3);
        assert_eq!(cfg.rows_per_shard, None);
        assert_eq!(cfg.on_unparsed_name, UnparsedNamePolicy::Skip);
        assert!(cfg.dates.initial.is_some());
        assert!(Cli::try_parse_from(["episode-packer"]).unwrap().into_config().is_err());
    }
}
