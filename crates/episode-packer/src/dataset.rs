//! Read-only access to a converted dataset directory.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use image::RgbImage;
use npyz::NpyFile;

use crate::catalog::{EpisodeCatalog, EpisodeRecord};
use crate::schema::StepRow;
use crate::sink::{FEATURES_FILE, INSTRUCTIONS_FILE};
use crate::writer::{STEPS_PREFIX, existing_shards};

pub struct DatasetReader {
    dir: PathBuf,
    catalog: EpisodeCatalog,
}

impl DatasetReader {
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.join(FEATURES_FILE).is_file() {
            bail!("{} is not a converted dataset (no {FEATURES_FILE})", dir.display());
        }
        let catalog = EpisodeCatalog::open(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            catalog,
        })
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        self.catalog.get_meta(key)
    }

    /// Episodes ordered by id.
    pub fn episodes(&self) -> Result<Vec<EpisodeRecord>> {
        self.catalog.episodes()
    }

    /// Every step row across all shards, in write order.
    pub fn steps(&self) -> Result<Vec<StepRow>> {
        let mut rows = Vec::new();
        for shard in existing_shards(&self.dir, STEPS_PREFIX)? {
            let file =
                File::open(&shard).with_context(|| format!("failed to open {}", shard.display()))?;
            let npy = NpyFile::new(BufReader::new(file))
                .with_context(|| format!("failed to read header of {}", shard.display()))?;
            rows.extend(
                npy.into_vec::<StepRow>()
                    .with_context(|| format!("failed to read rows of {}", shard.display()))?,
            );
        }
        Ok(rows)
    }

    /// Step rows grouped by episode, each group ordered by step index.
    pub fn steps_by_episode(&self) -> Result<BTreeMap<u32, Vec<StepRow>>> {
        let mut grouped: BTreeMap<u32, Vec<StepRow>> = BTreeMap::new();
        for row in self.steps()? {
            grouped.entry(row.episode_id).or_default().push(row);
        }
        for rows in grouped.values_mut() {
            rows.sort_by_key(|row| row.step_index);
        }
        Ok(grouped)
    }

    /// Decoded RGB image of one camera at one step.
    pub fn frame(&self, episode_id: u32, step_index: u32, camera: &str) -> Result<RgbImage> {
        let jpeg = self
            .catalog
            .frame(episode_id, step_index, camera)?
            .ok_or_else(|| {
                anyhow!("no {camera} frame for episode {episode_id} step {step_index}")
            })?;
        Ok(image::load_from_memory(&jpeg)
            .with_context(|| format!("failed to decode {camera} of episode {episode_id}"))?
            .to_rgb8())
    }

    /// Instruction strings indexed by the id stored in step rows.
    pub fn instructions(&self) -> Result<Vec<String>> {
        let path = self.dir.join(INSTRUCTIONS_FILE);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let mapping: HashMap<String, u8> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let mut names = vec![String::new(); mapping.len()];
        for (name, id) in mapping {
            let slot = names
                .get_mut(id as usize)
                .ok_or_else(|| anyhow!("instruction id {id} out of range in {}", path.display()))?;
            *slot = name;
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::test_support::{options, raw_step};
    use crate::episode::{
        EXTERIOR_IMAGE_KEY, Episode, EpisodeMetadata, EpisodeSample, WRIST_IMAGE_KEY,
        assemble_steps,
    };
    use crate::sink::{DatasetSink, ShardedDatasetSink, SinkOptions};
    use tempfile::tempdir;

    fn write_dataset(dir: &Path) {
        let mut sink = ShardedDatasetSink::create(&SinkOptions {
            output_dir: dir.to_path_buf(),
            dataset_name: "reader_test".to_string(),
            resolution: options(true).resolution,
            jpeg_quality: 100,
            rows_per_shard: Some(3),
            overwrite: false,
        })
        .unwrap();
        let batch = [(1u32, 4usize), (0, 2)]
            .into_iter()
            .map(|(episode_id, len)| {
                let raw = (0..len)
                    .map(|_| raw_step([0.3; 6], [0, 0, 200], [200, 0, 0]))
                    .collect();
                EpisodeSample {
                    episode_id,
                    key: format!("session_{episode_id}"),
                    episode: Episode {
                        steps: assemble_steps(raw, &options(true)).unwrap(),
                        metadata: EpisodeMetadata {
                            file_path: format!("session_{episode_id}/trajectory.h5"),
                            recording_folderpath: format!("session_{episode_id}/recordings/MP4"),
                        },
                    },
                }
            })
            .collect();
        sink.write_batch(batch).unwrap();
        sink.finish().unwrap();
    }

    #[test]
    fn reads_back_rows_frames_and_instructions() {
        let td = tempdir().unwrap();
        write_dataset(td.path());
        let reader = DatasetReader::open(td.path()).unwrap();

        assert_eq!(reader.meta("dataset_name").unwrap().as_deref(), Some("reader_test"));
        let ids: Vec<u32> = reader.episodes().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, [0, 1]);
        assert_eq!(reader.steps().unwrap().len(), 6);

        let grouped = reader.steps_by_episode().unwrap();
        let first = &grouped[&1];
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].is_first, 1);
        assert_eq!(first[3].is_last, 1);
        assert_eq!(first[3].reward, 1.0);
        assert_eq!(grouped[&0].len(), 2);

        // Stored BGR [0, 0, 200] is red once converted to RGB.
        let wrist = reader.frame(1, 2, WRIST_IMAGE_KEY).unwrap();
        assert_eq!(wrist.dimensions(), (6, 4));
        let px = wrist.get_pixel(2, 2).0;
        assert!(px[0] > 150 && px[2] < 60, "{px:?}");
        let exterior = reader.frame(0, 1, EXTERIOR_IMAGE_KEY).unwrap();
        assert!(exterior.get_pixel(0, 0).0[2] > 150);
        assert!(reader.frame(0, 9, WRIST_IMAGE_KEY).is_err());

        assert_eq!(reader.instructions().unwrap(), ["Fold the fabric into a triangle"]);
    }

    #[test]
    fn open_rejects_non_dataset_dirs() {
        let td = tempdir().unwrap();
        assert!(DatasetReader::open(td.path()).is_err());
    }
}
