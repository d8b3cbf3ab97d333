use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use env_logger::Env;
use episode_packer::DatasetReader;
use episode_packer::episode::{EXTERIOR_IMAGE_KEY, WRIST_IMAGE_KEY};
use episode_packer::stats::{dataset_stats, image_strip, strip_steps};
use log::{info, warn};

/// Render image strips and action statistics for a converted dataset.
#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect a converted episode dataset", long_about = None)]
struct Cli {
    /// Dataset directory containing steps*.npy and metadata.db
    #[arg(long, value_name = "DIR")]
    dataset: PathBuf,

    /// Directory receiving the PNG strips and stats.json
    #[arg(long, value_name = "DIR")]
    out: PathBuf,

    /// Number of episodes to render as image strips
    #[arg(long, default_value_t = 10, value_name = "N")]
    episodes: usize,

    /// Number of episodes included in the statistics
    #[arg(long, default_value_t = 500, value_name = "N")]
    stats_episodes: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let reader = DatasetReader::open(&cli.dataset)?;
    fs::create_dir_all(&cli.out)
        .with_context(|| format!("failed to create {}", cli.out.display()))?;
    let instructions = reader.instructions()?;
    let steps = reader.steps_by_episode()?;
    if steps.is_empty() {
        bail!("{} contains no steps", cli.dataset.display());
    }

    for (&episode_id, rows) in steps.iter().take(cli.episodes) {
        let mut exterior = Vec::new();
        let mut wrist = Vec::new();
        for idx in strip_steps(rows.len()) {
            let step = rows[idx].step_index;
            exterior.push(reader.frame(episode_id, step, EXTERIOR_IMAGE_KEY)?);
            wrist.push(reader.frame(episode_id, step, WRIST_IMAGE_KEY)?);
        }
        let strip = image_strip(&exterior, &wrist)?;
        let path = cli.out.join(format!("episode_{episode_id:05}.png"));
        strip
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        let caption = rows
            .first()
            .and_then(|row| instructions.get(row.language_instruction as usize));
        match caption {
            Some(text) => info!("episode {episode_id}: \"{text}\" -> {}", path.display()),
            None => warn!("episode {episode_id} has no language instruction"),
        }
    }

    let stats = dataset_stats(&steps, cli.stats_episodes)
        .context("no rows available for statistics")?;
    let path = cli.out.join("stats.json");
    fs::write(&path, serde_json::to_string_pretty(&stats)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(
        "Wrote statistics over {} episodes ({} steps) to {}",
        stats.episodes,
        stats.steps,
        path.display()
    );
    Ok(())
}
