//! Raw per-step trajectory records and the loaders that produce them.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use flate2::read::GzDecoder;
use image::RgbImage;
use npyz::NpyFile;
use serde::Deserialize;

/// A decoded camera frame. Channels are in the order the recording pipeline
/// delivers them (BGR for the ZED MP4 exports).
pub type Frame = RgbImage;

/// One timestep as delivered by a [`TrajectoryLoader`].
#[derive(Debug, Clone, Default)]
pub struct RawStep {
    pub observation: RawObservation,
    pub action: RawAction,
}

#[derive(Debug, Clone, Default)]
pub struct RawObservation {
    /// Frames keyed by `<camera id>_<left|right>`.
    pub image: BTreeMap<String, Frame>,
    /// Camera id to type code; 0 marks a wrist camera.
    pub camera_type: BTreeMap<String, i64>,
    pub robot_state: RobotState,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RobotState {
    pub cartesian_position: Vec<f64>,
    pub joint_positions: Vec<f64>,
    pub gripper_position: f64,
}

/// Commanded action for one timestep.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawAction {
    pub cartesian_position: Vec<f64>,
    pub cartesian_velocity: Vec<f64>,
    pub joint_position: Vec<f64>,
    pub joint_velocity: Vec<f64>,
    pub gripper_position: f64,
    pub gripper_velocity: f64,
}

/// Turns a trajectory log plus its recordings folder into aligned steps.
///
/// Implementations are shared across conversion workers, so they must not
/// rely on per-call mutable state.
pub trait TrajectoryLoader: Send + Sync {
    fn load(&self, log_path: &Path, video_folder: &Path) -> Result<Vec<RawStep>>;
}

/// Loader for the decoded export written next to each raw recording:
///
/// - `<log stem>.jsonl.gz`: one JSON step record per line (observation
///   `camera_type` and `robot_state`, plus the commanded `action`);
/// - `<video folder>/<image key>.npy`: `u8` frame stack of shape
///   `[steps, height, width, 3]` per camera view.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportLoader;

#[derive(Debug, Deserialize)]
struct StepRecord {
    observation: ObservationRecord,
    action: RawAction,
}

#[derive(Debug, Deserialize)]
struct ObservationRecord {
    #[serde(default)]
    camera_type: BTreeMap<String, i64>,
    robot_state: RobotState,
}

impl TrajectoryLoader for ExportLoader {
    fn load(&self, log_path: &Path, video_folder: &Path) -> Result<Vec<RawStep>> {
        let steps_path = export_steps_path(log_path);
        let records = read_step_records(&steps_path)?;
        let stacks = read_frame_stacks(video_folder)?;

        let mut streams = Vec::with_capacity(stacks.len());
        for (key, frames) in stacks {
            if frames.len() != records.len() {
                bail!(
                    "{} has {} frames for '{key}' but {} has {} steps",
                    video_folder.display(),
                    frames.len(),
                    steps_path.display(),
                    records.len()
                );
            }
            streams.push((key, frames.into_iter()));
        }

        let mut steps = Vec::with_capacity(records.len());
        for (idx, record) in records.into_iter().enumerate() {
            let mut image = BTreeMap::new();
            for (key, frames) in streams.iter_mut() {
                let frame = frames
                    .next()
                    .ok_or_else(|| anyhow!("frame stream '{key}' ended at step {idx}"))?;
                image.insert(key.clone(), frame);
            }
            steps.push(RawStep {
                observation: RawObservation {
                    image,
                    camera_type: record.observation.camera_type,
                    robot_state: record.observation.robot_state,
                },
                action: record.action,
            });
        }
        Ok(steps)
    }
}

/// `trajectory.h5` -> `trajectory.jsonl.gz`.
pub fn export_steps_path(log_path: &Path) -> PathBuf {
    log_path.with_extension("jsonl.gz")
}

fn read_step_records(path: &Path) -> Result<Vec<StepRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(GzDecoder::new(file));
    let mut records = Vec::new();
    for (line_idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} of {}", line_idx + 1, path.display())
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: StepRecord = serde_json::from_str(&line).with_context(|| {
            format!(
                "failed to parse step JSON in {} at line {}",
                path.display(),
                line_idx + 1
            )
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Load every `*.npy` frame stack in `dir`, keyed by file stem.
fn read_frame_stacks(dir: &Path) -> Result<BTreeMap<String, Vec<Frame>>> {
    let mut stacks = BTreeMap::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("npy") {
            continue;
        }
        let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        stacks.insert(key.to_string(), read_frame_stack(&path)?);
    }
    Ok(stacks)
}

fn read_frame_stack(path: &Path) -> Result<Vec<Frame>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let npy =
        NpyFile::new(&mut reader).with_context(|| format!("failed to read {}", path.display()))?;
    let &[steps, height, width, channels] = npy.shape() else {
        bail!(
            "{}: expected a [steps, height, width, 3] frame stack, got shape {:?}",
            path.display(),
            npy.shape()
        );
    };
    if channels != 3 {
        bail!("{}: expected 3 channels, got {channels}", path.display());
    }
    let (width, height) = (u32::try_from(width)?, u32::try_from(height)?);
    let frame_len = width as usize * height as usize * 3;
    let data: Vec<u8> = npy
        .into_vec()
        .map_err(|err| anyhow!("{}: {err}", path.display()))?;
    if data.len() != frame_len * steps as usize {
        bail!("{}: truncated frame data", path.display());
    }
    if frame_len == 0 {
        bail!("{}: empty frames", path.display());
    }
    data.chunks_exact(frame_len)
        .map(|chunk| {
            RgbImage::from_raw(width, height, chunk.to_vec())
                .ok_or_else(|| anyhow!("{}: frame buffer size mismatch", path.display()))
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn export_loader_aligns_frames_with_steps() {
        let td = tempdir().unwrap();
        let log_path = td.path().join("trajectory.h5");
        let video = td.path().join("recordings").join("MP4");
        fs::create_dir_all(&video).unwrap();
        write_step_log(
            &export_steps_path(&log_path),
            &[
                step_record([0.1, 0.0, 0.0, 0.0, 0.0, 0.0], 0.0),
                step_record([0.0; 6], 0.5),
            ],
        );
        write_frame_stack(&video.join("23007103_left.npy"), 4, 6, &[[1, 2, 3], [4, 5, 6]]);
        write_frame_stack(&video.join("24259877_left.npy"), 2, 3, &[[7, 8, 9], [10, 11, 12]]);
        fs::write(video.join("notes.txt"), b"ignored").unwrap();

        let steps = ExportLoader.load(&log_path, &video).unwrap();
        assert_eq!(steps.len(), 2);

        let wrist = &steps[1].observation.image["23007103_left"];
        assert_eq!(wrist.dimensions(), (6, 4));
        assert_eq!(wrist.get_pixel(0, 0).0, [4, 5, 6]);
        let exterior = &steps[0].observation.image["24259877_left"];
        assert_eq!(exterior.dimensions(), (3, 2));
        assert_eq!(exterior.get_pixel(2, 1).0, [7, 8, 9]);

        assert_eq!(steps[0].observation.camera_type["23007103"], 0);
        assert_eq!(steps[1].observation.robot_state.gripper_position, 0.5);
        assert_eq!(steps[0].action.cartesian_velocity[0], 0.1);
        assert_eq!(steps[1].action.joint_position.len(), 7);
    }

    #[test]
    fn frame_count_mismatch_is_a_load_error() {
        let td = tempdir().unwrap();
        let log_path = td.path().join("trajectory.h5");
        let video = td.path().join("MP4");
        fs::create_dir_all(&video).unwrap();
        write_step_log(
            &export_steps_path(&log_path),
            &[step_record([0.1; 6], 0.0), step_record([0.1; 6], 0.0)],
        );
        write_frame_stack(&video.join("23007103_left.npy"), 2, 2, &[[1, 2, 3]]);

        let err = ExportLoader.load(&log_path, &video).unwrap_err();
        assert!(err.to_string().contains("1 frames"));
    }

    #[test]
    fn missing_export_is_a_load_error() {
        let td = tempdir().unwrap();
        let err = ExportLoader
            .load(&td.path().join("trajectory.h5"), td.path())
            .unwrap_err();
        assert!(err.to_string().contains("trajectory.jsonl.gz"));
    }
}
