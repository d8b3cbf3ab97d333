//! Persist assembled episodes as a sharded dataset.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use log::info;
use rayon::prelude::*;

use crate::catalog::{EncodedFrame, EpisodeCatalog, EpisodeRecord};
use crate::config::ImageResolution;
use crate::episode::{EXTERIOR_IMAGE_KEY, EpisodeSample, WRIST_IMAGE_KEY};
use crate::schema::{StepRow, episode_features};
use crate::writer::{STEPS_PREFIX, ShardedRowWriter};

pub const FEATURES_FILE: &str = "features.json";
pub const INSTRUCTIONS_FILE: &str = "language_instructions.json";

/// Dataset version recorded in the catalog.
pub const DATASET_VERSION: &str = "1.0.0";

/// Receives batches of assembled episodes.
pub trait DatasetSink {
    /// Persist every sample of `batch`; returns the number of steps written.
    fn write_batch(&mut self, batch: Vec<EpisodeSample>) -> Result<usize>;
}

#[derive(Clone, Debug)]
pub struct SinkOptions {
    pub output_dir: PathBuf,
    pub dataset_name: String,
    pub resolution: ImageResolution,
    pub jpeg_quality: u8,
    pub rows_per_shard: Option<usize>,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkSummary {
    pub episodes: usize,
    pub steps: usize,
    pub shards: usize,
}

/// Writes `steps*.npy` shards, `metadata.db`, `features.json` and
/// `language_instructions.json` into one output directory.
pub struct ShardedDatasetSink {
    output_dir: PathBuf,
    jpeg_quality: u8,
    rows: ShardedRowWriter<StepRow>,
    catalog: EpisodeCatalog,
    instructions: InstructionEncoder,
    episodes: usize,
}

impl ShardedDatasetSink {
    /// Create the output directory and declare the schema.
    pub fn create(opts: &SinkOptions) -> Result<Self> {
        fs::create_dir_all(&opts.output_dir).with_context(|| {
            format!("failed to create output dir {}", opts.output_dir.display())
        })?;
        for name in [FEATURES_FILE, INSTRUCTIONS_FILE] {
            let path = opts.output_dir.join(name);
            if path.exists() && !opts.overwrite {
                bail!("{name} already exists (use overwrite option)");
            }
        }
        let rows = ShardedRowWriter::create(
            &opts.output_dir,
            STEPS_PREFIX,
            opts.rows_per_shard,
            opts.overwrite,
        )?;
        let mut catalog = EpisodeCatalog::create(&opts.output_dir, opts.overwrite)?;
        catalog.set_meta("dataset_name", &opts.dataset_name)?;
        catalog.set_meta("version", DATASET_VERSION)?;
        catalog.set_meta("split", "train")?;
        catalog.set_meta("image_height", opts.resolution.height.to_string())?;
        catalog.set_meta("image_width", opts.resolution.width.to_string())?;

        write_json(
            &opts.output_dir.join(FEATURES_FILE),
            &episode_features(opts.resolution),
        )?;

        Ok(Self {
            output_dir: opts.output_dir.clone(),
            jpeg_quality: opts.jpeg_quality,
            rows,
            catalog,
            instructions: InstructionEncoder::default(),
            episodes: 0,
        })
    }

    /// Close the last shard and write the instruction table.
    pub fn finish(mut self) -> Result<SinkSummary> {
        let steps = self.rows.rows_written();
        let shards = self.rows.finish()?;
        self.catalog
            .set_meta("episodes", self.episodes.to_string())?;
        self.catalog.set_meta("steps", steps.to_string())?;
        let path = self.output_dir.join(INSTRUCTIONS_FILE);
        let names = self.instructions.as_vec();
        let mapping: HashMap<&str, u8> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx as u8))
            .collect();
        write_json(&path, &mapping)?;
        info!(
            "Wrote {} episodes ({steps} steps) to {shards} shard(s) in {}",
            self.episodes,
            self.output_dir.display()
        );
        Ok(SinkSummary {
            episodes: self.episodes,
            steps,
            shards,
        })
    }
}

impl DatasetSink for ShardedDatasetSink {
    fn write_batch(&mut self, batch: Vec<EpisodeSample>) -> Result<usize> {
        let quality = self.jpeg_quality;
        let instructions = &self.instructions;
        let encoded = batch
            .into_par_iter()
            .map(|sample| encode_sample(sample, quality, instructions))
            .collect::<Result<Vec<_>>>()?;

        let mut steps = 0;
        for (record, frames, rows) in encoded {
            self.catalog.insert_episode(&record, &frames)?;
            self.rows.write(&rows)?;
            self.episodes += 1;
            steps += rows.len();
        }
        Ok(steps)
    }
}

fn encode_sample(
    sample: EpisodeSample,
    quality: u8,
    instructions: &InstructionEncoder,
) -> Result<(EpisodeRecord, Vec<EncodedFrame>, Vec<StepRow>)> {
    let EpisodeSample {
        episode_id,
        key,
        episode,
    } = sample;
    let mut frames = Vec::with_capacity(episode.steps.len() * 2);
    let mut rows = Vec::with_capacity(episode.steps.len());
    for (idx, step) in episode.steps.iter().enumerate() {
        let step_index = idx as u32;
        let obs = &step.observation;
        for (camera, image) in [
            (EXTERIOR_IMAGE_KEY, &obs.exterior_image_1_left),
            (WRIST_IMAGE_KEY, &obs.wrist_image_left),
        ] {
            frames.push(EncodedFrame {
                step_index,
                camera,
                jpeg: encode_jpeg(image, quality)
                    .with_context(|| format!("failed to encode {camera} of {key} step {idx}"))?,
            });
        }
        let instruction = instructions.encode(&step.language_instruction)?;
        rows.push(StepRow::from_step(episode_id, step_index, step, instruction));
    }
    let record = EpisodeRecord {
        id: episode_id,
        key,
        file_path: episode.metadata.file_path,
        recording_folderpath: episode.metadata.recording_folderpath,
        steps: rows.len() as u32,
    };
    Ok((record, frames, rows))
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(buf)
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Interns language instructions into the `u8` ids stored in step rows.
#[derive(Default)]
struct InstructionEncoder {
    inner: parking_lot::Mutex<InstructionTable>,
}

#[derive(Default)]
struct InstructionTable {
    ids: HashMap<String, u8>,
    names: Vec<String>,
}

impl InstructionEncoder {
    fn encode(&self, instruction: &str) -> Result<u8> {
        let mut table = self.inner.lock();
        if let Some(&id) = table.ids.get(instruction) {
            return Ok(id);
        }
        let id = u8::try_from(table.names.len())
            .context("more than 256 distinct language instructions")?;
        table.names.push(instruction.to_string());
        table.ids.insert(instruction.to_string(), id);
        Ok(id)
    }

    fn as_vec(&self) -> Vec<String> {
        self.inner.lock().names.clone()
    }
}
