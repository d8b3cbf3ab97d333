//! Assemble raw trajectories into RLDS-style episodes.
//!
//! One session directory becomes at most one [`Episode`]: images are resized
//! to the configured resolution, no-op steps are optionally dropped, the first
//! wrist and exterior cameras are selected, and the boundary flags plus the
//! terminal reward are placed on the first and last retained steps. Any
//! failure skips the whole episode; nothing partial is emitted.

use std::collections::BTreeSet;

use image::RgbImage;
use image::imageops::{self, FilterType};
use log::warn;

use crate::config::ImageResolution;
use crate::discovery::EpisodePath;
use crate::trajectory::{Frame, RawAction, RawStep, TrajectoryLoader};

/// Type code reported for wrist-mounted cameras; every other code is exterior.
pub const WRIST_CAMERA_TYPE: i64 = 0;

pub const EXTERIOR_IMAGE_KEY: &str = "exterior_image_1_left";
pub const WRIST_IMAGE_KEY: &str = "wrist_image_left";

/// Why an episode was skipped.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("data couldn't be loaded: {0}")]
    LoadFailed(String),
    #[error("step {step} has different observation keys than step 0")]
    SchemaMismatch { step: usize },
    #[error("no steps left after filtering")]
    EmptyAfterFiltering,
    #[error("step {step}: {message}")]
    FieldError { step: usize, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepObservation {
    pub exterior_image_1_left: RgbImage,
    pub wrist_image_left: RgbImage,
    pub cartesian_position: [f64; 6],
    pub joint_position: [f64; 7],
    pub gripper_position: [f64; 1],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionDict {
    pub cartesian_position: [f64; 6],
    pub cartesian_velocity: [f64; 6],
    pub gripper_position: [f64; 1],
    pub gripper_velocity: [f64; 1],
    pub joint_position: [f64; 7],
    pub joint_velocity: [f64; 7],
}

impl ActionDict {
    /// Commanded cartesian position followed by the commanded gripper position.
    pub fn action_vector(&self) -> [f64; 7] {
        let mut action = [0.0; 7];
        action[..6].copy_from_slice(&self.cartesian_position);
        action[6] = self.gripper_position[0];
        action
    }
}

/// One timestep in the output schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub observation: StepObservation,
    pub action_dict: ActionDict,
    pub action: [f64; 7],
    pub discount: f32,
    pub reward: f32,
    pub is_first: bool,
    pub is_last: bool,
    pub is_terminal: bool,
    pub language_instruction: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeMetadata {
    pub file_path: String,
    pub recording_folderpath: String,
}

/// A complete demonstration. `steps` is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub steps: Vec<Step>,
    pub metadata: EpisodeMetadata,
}

/// An assembled episode together with the identifiers the sink needs.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSample {
    pub episode_id: u32,
    pub key: String,
    pub episode: Episode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyOptions {
    pub resolution: ImageResolution,
    pub filter_no_ops: bool,
    pub language_instruction: String,
}

/// Converts session directories into episodes using a shared loader.
pub struct EpisodeAssembler<'a, L: TrajectoryLoader + ?Sized> {
    loader: &'a L,
    options: AssemblyOptions,
}

impl<'a, L: TrajectoryLoader + ?Sized> EpisodeAssembler<'a, L> {
    pub fn new(loader: &'a L, options: AssemblyOptions) -> Self {
        Self { loader, options }
    }

    /// Load and assemble one episode.
    pub fn assemble(&self, path: &EpisodePath) -> Result<Episode, AssemblyError> {
        let raw = self
            .loader
            .load(&path.log_path, &path.recordings_path)
            .map_err(|err| AssemblyError::LoadFailed(format!("{err:#}")))?;
        let steps = assemble_steps(raw, &self.options)?;
        Ok(Episode {
            steps,
            metadata: EpisodeMetadata {
                file_path: path.log_path.display().to_string(),
                recording_folderpath: path.recordings_path.display().to_string(),
            },
        })
    }

    /// [`assemble`](Self::assemble), logging a diagnostic line on failure.
    pub fn convert(&self, path: &EpisodePath) -> Result<EpisodeSample, AssemblyError> {
        match self.assemble(path) {
            Ok(episode) => Ok(EpisodeSample {
                episode_id: path.episode_id,
                key: path.key(),
                episode,
            }),
            Err(err) => {
                log_skip(path, &err);
                Err(err)
            }
        }
    }
}

fn log_skip(path: &EpisodePath, err: &AssemblyError) {
    match err {
        AssemblyError::LoadFailed(reason) => warn!(
            "Skipping trajectory because data couldn't be loaded for {}: {reason}",
            path.dir.display()
        ),
        other => warn!(
            "Skipping trajectory because there was an error in data processing for {}: {other}",
            path.dir.display()
        ),
    }
}

/// Turn the loader's raw steps into output steps with boundary flags set.
pub fn assemble_steps(
    mut raw: Vec<RawStep>,
    options: &AssemblyOptions,
) -> Result<Vec<Step>, AssemblyError> {
    check_observation_keys(&raw)?;

    for step in raw.iter_mut() {
        for frame in step.observation.image.values_mut() {
            *frame = resize_frame(frame, options.resolution);
        }
    }

    let mut steps = raw
        .into_iter()
        .enumerate()
        .filter(|(_, step)| !(options.filter_no_ops && is_no_op(&step.action)))
        .map(|(idx, step)| convert_step(idx, step, &options.language_instruction))
        .collect::<Result<Vec<_>, _>>()?;

    mark_boundaries(&mut steps)?;
    Ok(steps)
}

/// Every step must expose the same camera ids and image keys as the first.
fn check_observation_keys(raw: &[RawStep]) -> Result<(), AssemblyError> {
    let Some(first) = raw.first() else {
        return Ok(());
    };
    let keys = |step: &RawStep| -> (BTreeSet<String>, BTreeSet<String>) {
        (
            step.observation.image.keys().cloned().collect(),
            step.observation.camera_type.keys().cloned().collect(),
        )
    };
    let expected = keys(first);
    match raw.iter().position(|step| keys(step) != expected) {
        Some(step) => Err(AssemblyError::SchemaMismatch { step }),
        None => Ok(()),
    }
}

/// Bicubic resize to `(height, width)`; the resize call itself takes
/// `(width, height)`.
pub fn resize_frame(frame: &Frame, resolution: ImageResolution) -> Frame {
    imageops::resize(
        frame,
        resolution.width,
        resolution.height,
        FilterType::CatmullRom,
    )
}

/// A step whose commanded cartesian velocity is exactly zero in every
/// component carries no command.
pub fn is_no_op(action: &RawAction) -> bool {
    action.cartesian_velocity.iter().all(|&v| v == 0.0)
}

/// BGR <-> RGB.
fn reverse_channels(mut image: RgbImage) -> RgbImage {
    for pixel in image.pixels_mut() {
        pixel.0.reverse();
    }
    image
}

/// First wrist camera and first exterior camera, in camera-id order.
fn select_cameras(step: &RawStep) -> Option<(String, String)> {
    let camera_type = &step.observation.camera_type;
    let wrist = camera_type
        .iter()
        .find(|&(_, &kind)| kind == WRIST_CAMERA_TYPE)?;
    let exterior = camera_type
        .iter()
        .find(|&(_, &kind)| kind != WRIST_CAMERA_TYPE)?;
    Some((exterior.0.clone(), wrist.0.clone()))
}

fn fixed<const N: usize>(values: &[f64], field: &str, step: usize) -> Result<[f64; N], AssemblyError> {
    values.try_into().map_err(|_| AssemblyError::FieldError {
        step,
        message: format!("expected {N} values for {field}, got {}", values.len()),
    })
}

fn convert_step(idx: usize, mut raw: RawStep, instruction: &str) -> Result<Step, AssemblyError> {
    let (exterior_id, wrist_id) = select_cameras(&raw).ok_or_else(|| AssemblyError::FieldError {
        step: idx,
        message: "need one wrist and one exterior camera".to_string(),
    })?;
    let mut take_left = |camera: &str| {
        let key = format!("{camera}_left");
        raw.observation
            .image
            .remove(&key)
            .map(reverse_channels)
            .ok_or_else(|| AssemblyError::FieldError {
                step: idx,
                message: format!("missing image '{key}'"),
            })
    };
    let exterior_image_1_left = take_left(&exterior_id)?;
    let wrist_image_left = take_left(&wrist_id)?;

    let state = &raw.observation.robot_state;
    let observation = StepObservation {
        exterior_image_1_left,
        wrist_image_left,
        cartesian_position: fixed(&state.cartesian_position, "cartesian_position", idx)?,
        joint_position: fixed(&state.joint_positions, "joint_positions", idx)?,
        gripper_position: [state.gripper_position],
    };

    let action = &raw.action;
    let action_dict = ActionDict {
        cartesian_position: fixed(&action.cartesian_position, "action.cartesian_position", idx)?,
        cartesian_velocity: fixed(&action.cartesian_velocity, "action.cartesian_velocity", idx)?,
        gripper_position: [action.gripper_position],
        gripper_velocity: [action.gripper_velocity],
        joint_position: fixed(&action.joint_position, "action.joint_position", idx)?,
        joint_velocity: fixed(&action.joint_velocity, "action.joint_velocity", idx)?,
    };

    Ok(Step {
        observation,
        action: action_dict.action_vector(),
        action_dict,
        discount: 1.0,
        reward: 0.0,
        is_first: false,
        is_last: false,
        is_terminal: false,
        language_instruction: instruction.to_string(),
    })
}

/// Demonstrations: the last retained step is terminal and earns reward 1.
fn mark_boundaries(steps: &mut [Step]) -> Result<(), AssemblyError> {
    let first = steps
        .first_mut()
        .ok_or(AssemblyError::EmptyAfterFiltering)?;
    first.is_first = true;
    let last = steps
        .last_mut()
        .ok_or(AssemblyError::EmptyAfterFiltering)?;
    last.is_last = true;
    last.is_terminal = true;
    last.reward = 1.0;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::trajectory::{RawObservation, RobotState};
    use image::Rgb;

    pub const WRIST: &str = "23007103";
    pub const EXTERIOR: &str = "24259877";

    /// A raw step with a wrist and an exterior camera, each filled with a
    /// single BGR color.
    pub fn raw_step(cartesian_velocity: [f64; 6], wrist_bgr: [u8; 3], exterior_bgr: [u8; 3]) -> RawStep {
        let mut observation = RawObservation {
            robot_state: RobotState {
                cartesian_position: vec![0.4, 0.0, 0.3, 3.1, 0.0, 0.0],
                joint_positions: vec![0.0, -0.5, 0.0, -2.0, 0.0, 1.5, 0.7],
                gripper_position: 0.25,
            },
            ..Default::default()
        };
        observation.camera_type.insert(WRIST.to_string(), 0);
        observation.camera_type.insert(EXTERIOR.to_string(), 1);
        observation.image.insert(
            format!("{WRIST}_left"),
            RgbImage::from_pixel(12, 8, Rgb(wrist_bgr)),
        );
        observation.image.insert(
            format!("{EXTERIOR}_left"),
            RgbImage::from_pixel(16, 9, Rgb(exterior_bgr)),
        );
        RawStep {
            observation,
            action: RawAction {
                cartesian_position: vec![0.41, 0.01, 0.3, 3.1, 0.0, 0.0],
                cartesian_velocity: cartesian_velocity.to_vec(),
                joint_position: vec![0.1; 7],
                joint_velocity: vec![0.0; 7],
                gripper_position: 0.75,
                gripper_velocity: -0.5,
            },
        }
    }

    pub fn options(filter_no_ops: bool) -> AssemblyOptions {
        AssemblyOptions {
            resolution: ImageResolution {
                height: 4,
                width: 6,
            },
            filter_no_ops,
            language_instruction: "Fold the fabric into a triangle".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const MOVING: [f64; 6] = [0.1, 0.0, 0.0, 0.0, 0.0, 0.0];
    const IDLE: [f64; 6] = [0.0; 6];

    fn assert_boundaries(steps: &[Step]) {
        assert_eq!(steps.iter().filter(|s| s.is_first).count(), 1);
        assert_eq!(steps.iter().filter(|s| s.is_last).count(), 1);
        assert_eq!(steps.iter().filter(|s| s.is_terminal).count(), 1);
        assert!(steps[0].is_first);
        let last = steps.last().unwrap();
        assert!(last.is_last && last.is_terminal);
        assert_eq!(last.reward, 1.0);
        for step in &steps[..steps.len() - 1] {
            assert_eq!(step.reward, 0.0);
            assert!(!step.is_last && !step.is_terminal);
        }
        for step in &steps[1..] {
            assert!(!step.is_first);
        }
    }

    #[test]
    fn flags_and_reward_mark_first_and_last_steps() {
        let raw = (0..5).map(|_| raw_step(MOVING, [1, 2, 3], [4, 5, 6])).collect();
        let steps = assemble_steps(raw, &options(true)).unwrap();
        assert_eq!(steps.len(), 5);
        assert_boundaries(&steps);
        assert!(steps.iter().all(|s| s.discount == 1.0));
    }

    #[test]
    fn single_step_episode_carries_all_flags() {
        let steps = assemble_steps(vec![raw_step(MOVING, [0; 3], [0; 3])], &options(true)).unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].is_first && steps[0].is_last && steps[0].is_terminal);
        assert_eq!(steps[0].reward, 1.0);
    }

    #[test]
    fn action_is_cartesian_position_then_gripper() {
        let steps = assemble_steps(vec![raw_step(MOVING, [0; 3], [0; 3])], &options(true)).unwrap();
        let step = &steps[0];
        let mut expected = step.action_dict.cartesian_position.to_vec();
        expected.extend_from_slice(&step.action_dict.gripper_position);
        assert_eq!(step.action.to_vec(), expected);
        assert_eq!(step.action, [0.41, 0.01, 0.3, 3.1, 0.0, 0.0, 0.75]);
        assert_eq!(step.action_dict.gripper_velocity, [-0.5]);
        assert_eq!(step.observation.gripper_position, [0.25]);
        assert_eq!(step.observation.joint_position[6], 0.7);
        assert_eq!(step.language_instruction, "Fold the fabric into a triangle");
    }

    #[test]
    fn no_op_steps_are_dropped_only_when_enabled() {
        let raw = || {
            vec![
                raw_step(IDLE, [0; 3], [0; 3]),
                raw_step(MOVING, [0; 3], [0; 3]),
                raw_step([0.0, -0.0, 0.0, 0.0, 0.0, 0.0], [0; 3], [0; 3]),
                raw_step([0.0, 0.0, 0.0, 0.0, 0.0, 1e-12], [0; 3], [0; 3]),
            ]
        };

        let filtered = assemble_steps(raw(), &options(true)).unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(
            filtered
                .iter()
                .all(|s| s.action_dict.cartesian_velocity.iter().any(|&v| v != 0.0))
        );
        assert_boundaries(&filtered);

        let unfiltered = assemble_steps(raw(), &options(false)).unwrap();
        assert_eq!(unfiltered.len(), 4);
        assert_eq!(unfiltered[0].action_dict.cartesian_velocity, IDLE);
        assert_boundaries(&unfiltered);
    }

    #[test]
    fn all_idle_episode_is_rejected() {
        let raw = vec![raw_step(IDLE, [0; 3], [0; 3]), raw_step(IDLE, [0; 3], [0; 3])];
        let err = assemble_steps(raw, &options(true)).unwrap_err();
        assert!(matches!(err, AssemblyError::EmptyAfterFiltering));
        assert!(matches!(
            assemble_steps(Vec::new(), &options(false)).unwrap_err(),
            AssemblyError::EmptyAfterFiltering
        ));
    }

    #[test]
    fn images_are_resized_and_swapped_to_rgb() {
        let steps =
            assemble_steps(vec![raw_step(MOVING, [10, 20, 30], [200, 100, 50])], &options(true))
                .unwrap();
        let obs = &steps[0].observation;
        for image in [&obs.exterior_image_1_left, &obs.wrist_image_left] {
            assert_eq!(image.dimensions(), (6, 4));
            assert_eq!(image.as_raw().len(), 4 * 6 * 3);
        }
        assert!(obs.wrist_image_left.pixels().all(|p| p.0 == [30, 20, 10]));
        assert!(obs.exterior_image_1_left.pixels().all(|p| p.0 == [50, 100, 200]));
    }

    #[test]
    fn first_camera_of_each_type_is_selected() {
        let mut step = raw_step(MOVING, [1, 1, 1], [2, 2, 2]);
        let obs = &mut step.observation;
        obs.camera_type.insert("11111111".to_string(), 3);
        obs.image.insert(
            "11111111_left".to_string(),
            RgbImage::from_pixel(8, 8, image::Rgb([9, 9, 9])),
        );
        obs.camera_type.insert("99999999".to_string(), 0);
        obs.image.insert(
            "99999999_left".to_string(),
            RgbImage::from_pixel(8, 8, image::Rgb([7, 7, 7])),
        );

        let steps = assemble_steps(vec![step], &options(true)).unwrap();
        let obs = &steps[0].observation;
        assert_eq!(obs.exterior_image_1_left.get_pixel(0, 0).0, [9, 9, 9]);
        assert_eq!(obs.wrist_image_left.get_pixel(0, 0).0, [1, 1, 1]);
    }

    #[test]
    fn mismatched_observation_keys_are_rejected() {
        let mut second = raw_step(MOVING, [0; 3], [0; 3]);
        second.observation.image.remove(&format!("{EXTERIOR}_left"));
        let raw = vec![raw_step(MOVING, [0; 3], [0; 3]), second];
        let err = assemble_steps(raw, &options(true)).unwrap_err();
        assert!(matches!(err, AssemblyError::SchemaMismatch { step: 1 }));
    }

    #[test]
    fn malformed_vectors_are_field_errors() {
        let mut step = raw_step(MOVING, [0; 3], [0; 3]);
        step.observation.robot_state.joint_positions.pop();
        let err = assemble_steps(vec![step], &options(true)).unwrap_err();
        match err {
            AssemblyError::FieldError { step, message } => {
                assert_eq!(step, 0);
                assert!(message.contains("joint_positions"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn field_errors_point_at_the_raw_step() {
        let mut bad = raw_step(MOVING, [0; 3], [0; 3]);
        bad.action.joint_velocity.truncate(3);
        let raw = vec![
            raw_step(IDLE, [0; 3], [0; 3]),
            raw_step(IDLE, [0; 3], [0; 3]),
            raw_step(MOVING, [0; 3], [0; 3]),
            bad,
        ];
        let err = assemble_steps(raw, &options(true)).unwrap_err();
        match err {
            AssemblyError::FieldError { step, message } => {
                assert_eq!(step, 3);
                assert!(message.contains("action.joint_velocity"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_wrist_camera_is_a_field_error() {
        let mut step = raw_step(MOVING, [0; 3], [0; 3]);
        step.observation.camera_type.insert(WRIST.to_string(), 2);
        let err = assemble_steps(vec![step], &options(true)).unwrap_err();
        assert!(matches!(err, AssemblyError::FieldError { .. }));
    }
}
