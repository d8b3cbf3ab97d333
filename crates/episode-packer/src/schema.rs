//! On-disk layouts: the structured `.npy` step row and the declared feature
//! tree written to `features.json`.
//!
//! Images are not part of the step row; they are JPEG-encoded into the
//! `frames` table of `metadata.db` and keyed by `(episode_id, step_index,
//! camera)`.

use npyz::{DType, Field, TypeStr};
use serde::Serialize;

use crate::config::ImageResolution;
use crate::episode::{EXTERIOR_IMAGE_KEY, Step, WRIST_IMAGE_KEY};

/// Trait implemented by structured rows that can be written to an `.npy` file.
pub trait StructuredRow: Copy + npyz::Serialize {
    /// Return the NumPy dtype descriptor for the row.
    fn dtype() -> DType;
}

/// One step of one episode. Flags are stored as 0/1 bytes; the language
/// instruction is an index into `language_instructions.json`.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, PartialEq, npyz::Serialize, npyz::Deserialize, npyz::AutoSerialize,
)]
pub struct StepRow {
    pub episode_id: u32,
    pub step_index: u32,
    pub cartesian_position: [f64; 6],
    pub joint_position: [f64; 7],
    pub gripper_position: [f64; 1],
    pub action_cartesian_position: [f64; 6],
    pub action_cartesian_velocity: [f64; 6],
    pub action_gripper_position: [f64; 1],
    pub action_gripper_velocity: [f64; 1],
    pub action_joint_position: [f64; 7],
    pub action_joint_velocity: [f64; 7],
    pub action: [f64; 7],
    pub discount: f32,
    pub reward: f32,
    pub is_first: u8,
    pub is_last: u8,
    pub is_terminal: u8,
    pub language_instruction: u8,
}

impl StepRow {
    pub fn from_step(episode_id: u32, step_index: u32, step: &Step, instruction_id: u8) -> Self {
        let obs = &step.observation;
        let act = &step.action_dict;
        Self {
            episode_id,
            step_index,
            cartesian_position: obs.cartesian_position,
            joint_position: obs.joint_position,
            gripper_position: obs.gripper_position,
            action_cartesian_position: act.cartesian_position,
            action_cartesian_velocity: act.cartesian_velocity,
            action_gripper_position: act.gripper_position,
            action_gripper_velocity: act.gripper_velocity,
            action_joint_position: act.joint_position,
            action_joint_velocity: act.joint_velocity,
            action: step.action,
            discount: step.discount,
            reward: step.reward,
            is_first: step.is_first as u8,
            is_last: step.is_last as u8,
            is_terminal: step.is_terminal as u8,
            language_instruction: instruction_id,
        }
    }
}

impl StructuredRow for StepRow {
    fn dtype() -> DType {
        let u1: TypeStr = "|u1".parse().unwrap();
        let u4: TypeStr = "<u4".parse().unwrap();
        let f4: TypeStr = "<f4".parse().unwrap();
        let f8: TypeStr = "<f8".parse().unwrap();
        let plain = |name: &str, ty: &TypeStr| Field {
            name: name.into(),
            dtype: DType::Plain(ty.clone()),
        };
        let vector = |name: &str, len: u64| Field {
            name: name.into(),
            dtype: DType::Array(len, Box::new(DType::Plain(f8.clone()))),
        };
        DType::Record(vec![
            plain("episode_id", &u4),
            plain("step_index", &u4),
            vector("cartesian_position", 6),
            vector("joint_position", 7),
            vector("gripper_position", 1),
            vector("action_cartesian_position", 6),
            vector("action_cartesian_velocity", 6),
            vector("action_gripper_position", 1),
            vector("action_gripper_velocity", 1),
            vector("action_joint_position", 7),
            vector("action_joint_velocity", 7),
            vector("action", 7),
            plain("discount", &f4),
            plain("reward", &f4),
            plain("is_first", &u1),
            plain("is_last", &u1),
            plain("is_terminal", &u1),
            plain("language_instruction", &u1),
        ])
    }
}

/// Declared feature of the episode schema.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Feature {
    FeaturesDict {
        fields: Vec<NamedFeature>,
    },
    /// Variable-length sequence of `step` records.
    Dataset {
        step: Box<Feature>,
    },
    Image {
        shape: [u32; 3],
        dtype: &'static str,
        encoding_format: &'static str,
        doc: &'static str,
    },
    Tensor {
        shape: Vec<usize>,
        dtype: &'static str,
        doc: &'static str,
    },
    Scalar {
        dtype: &'static str,
        doc: &'static str,
    },
    Text {
        doc: &'static str,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NamedFeature {
    pub name: &'static str,
    pub feature: Feature,
}

fn dict(fields: Vec<(&'static str, Feature)>) -> Feature {
    Feature::FeaturesDict {
        fields: fields
            .into_iter()
            .map(|(name, feature)| NamedFeature { name, feature })
            .collect(),
    }
}

fn image(resolution: ImageResolution, doc: &'static str) -> Feature {
    Feature::Image {
        shape: [resolution.height, resolution.width, 3],
        dtype: "uint8",
        encoding_format: "jpeg",
        doc,
    }
}

fn tensor(len: usize, doc: &'static str) -> Feature {
    Feature::Tensor {
        shape: vec![len],
        dtype: "float64",
        doc,
    }
}

fn scalar(dtype: &'static str, doc: &'static str) -> Feature {
    Feature::Scalar { dtype, doc }
}

/// The full episode schema for images of `resolution`.
pub fn episode_features(resolution: ImageResolution) -> Feature {
    let observation = dict(vec![
        (
            EXTERIOR_IMAGE_KEY,
            image(resolution, "Exterior camera 1 left viewpoint"),
        ),
        (
            WRIST_IMAGE_KEY,
            image(resolution, "Wrist camera RGB left viewpoint"),
        ),
        ("cartesian_position", tensor(6, "Robot Cartesian state")),
        ("gripper_position", tensor(1, "Gripper position state")),
        ("joint_position", tensor(7, "Joint position state")),
    ]);
    let action_dict = dict(vec![
        ("cartesian_position", tensor(6, "Commanded Cartesian position")),
        ("cartesian_velocity", tensor(6, "Commanded Cartesian velocity")),
        ("gripper_position", tensor(1, "Commanded gripper position")),
        ("gripper_velocity", tensor(1, "Commanded gripper velocity")),
        ("joint_position", tensor(7, "Commanded joint position")),
        ("joint_velocity", tensor(7, "Commanded joint velocity")),
    ]);
    let step = dict(vec![
        ("observation", observation),
        ("action_dict", action_dict),
        (
            "action",
            tensor(
                7,
                "Robot action, consists of [6x cartesian position, 1x gripper position].",
            ),
        ),
        ("discount", scalar("float32", "Discount if provided, default to 1.")),
        (
            "reward",
            scalar("float32", "Reward if provided, 1 on final step for demos."),
        ),
        ("is_first", scalar("bool", "True on first step of the episode.")),
        ("is_last", scalar("bool", "True on last step of the episode.")),
        (
            "is_terminal",
            scalar(
                "bool",
                "True on last step of the episode if it is a terminal step, True for demos.",
            ),
        ),
        (
            "language_instruction",
            Feature::Text {
                doc: "Language Instruction.",
            },
        ),
    ]);
    dict(vec![
        ("steps", Feature::Dataset { step: Box::new(step) }),
        (
            "episode_metadata",
            dict(vec![
                (
                    "file_path",
                    Feature::Text {
                        doc: "Path to the original data file.",
                    },
                ),
                (
                    "recording_folderpath",
                    Feature::Text {
                        doc: "Path to the folder of recordings.",
                    },
                ),
            ]),
        ),
    ])
}
