//! Attention estimation from a single landmark mesh
//!
//! Head pose is approximated from five anchors (nose tip, outer eye corners,
//! chin, forehead). When the detector supplies iris points, the iris position
//! inside each eye refines the gaze; otherwise head pose alone is used.
//!
//! `GOOD_ATTENTION_THRESHOLD` is the single cutoff for `is_looking_at_camera`,
//! for the aggregator's attention percentage and for the live display.

use crate::landmarks::*;
use serde::{Deserialize, Serialize};

/// Scores strictly above this count as "good attention".
pub const GOOD_ATTENTION_THRESHOLD: f32 = 70.0;

const EPSILON: f32 = 1e-6;

/// Coarse gaze direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GazeDirection {
    Center,
    Left,
    Right,
    Up,
    Down,
}

/// Per-frame attention reading sent to the peer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionSample {
    pub is_looking_at_camera: bool,
    pub attention_score: f32,
    pub gaze_direction: GazeDirection,
}

/// Approximate head rotation in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
}

/// Combined head + eye gaze magnitudes in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GazeMagnitude {
    pub horizontal: f32,
    pub vertical: f32,
}

/// Tunable constants. Weights must sum to at most 100.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionTuning {
    /// Scales normalized nose offsets to approximate degrees.
    pub pose_multiplier: f32,
    /// Degrees per unit of iris offset from the eye center.
    pub iris_scale: f32,
    pub horizontal_threshold: f32,
    pub vertical_threshold: f32,
    pub horizontal_cap: f32,
    pub vertical_cap: f32,
    pub horizontal_weight: f32,
    pub vertical_weight: f32,
    pub good_threshold: f32,
}

impl Default for AttentionTuning {
    fn default() -> Self {
        Self {
            pose_multiplier: 90.0,
            iris_scale: 60.0,
            horizontal_threshold: 15.0,
            vertical_threshold: 12.0,
            horizontal_cap: 30.0,
            vertical_cap: 25.0,
            horizontal_weight: 60.0,
            vertical_weight: 40.0,
            good_threshold: GOOD_ATTENTION_THRESHOLD,
        }
    }
}

/// Stateless estimator; `estimate` is a pure function of the mesh.
#[derive(Debug, Clone, Default)]
pub struct AttentionEstimator {
    tuning: AttentionTuning,
}

impl AttentionEstimator {
    pub fn new(tuning: AttentionTuning) -> Self {
        Self { tuning }
    }

    pub fn tuning(&self) -> &AttentionTuning {
        &self.tuning
    }

    pub fn estimate(&self, mesh: &LandmarkMesh) -> AttentionSample {
        let gaze = self.gaze(mesh);
        let direction = self.classify(gaze);
        let score = self.score(gaze);

        AttentionSample {
            is_looking_at_camera: score > self.tuning.good_threshold,
            attention_score: score,
            gaze_direction: direction,
        }
    }

    /// Yaw/pitch proxies from the five head anchors.
    pub fn head_pose(&self, mesh: &LandmarkMesh) -> HeadPose {
        let nose = mesh.anchor(NOSE_TIP);
        let left_eye = mesh.anchor(LEFT_EYE_OUTER);
        let right_eye = mesh.anchor(RIGHT_EYE_OUTER);
        let chin = mesh.anchor(CHIN);
        let forehead = mesh.anchor(FOREHEAD_TOP);

        let mid_x = (left_eye.x + right_eye.x) / 2.0;
        let eye_span = left_eye.planar_distance(&right_eye);
        let yaw = if eye_span > EPSILON {
            (nose.x - mid_x) / eye_span * self.tuning.pose_multiplier
        } else {
            0.0
        };

        let upper = nose.y - forehead.y;
        let lower = chin.y - nose.y;
        let span = upper + lower;
        let pitch = if span.abs() > EPSILON {
            (upper - lower) / span * self.tuning.pose_multiplier
        } else {
            0.0
        };

        HeadPose {
            yaw: finite_or_zero(yaw),
            pitch: finite_or_zero(pitch),
        }
    }

    /// Head pose plus the iris term when iris points exist.
    pub fn gaze(&self, mesh: &LandmarkMesh) -> GazeMagnitude {
        let pose = self.head_pose(mesh);
        let (eye_h, eye_v) = if mesh.has_iris() {
            self.iris_offset(mesh)
        } else {
            (0.0, 0.0)
        };

        GazeMagnitude {
            horizontal: finite_or_zero(pose.yaw + eye_h),
            vertical: finite_or_zero(pose.pitch + eye_v),
        }
    }

    fn iris_offset(&self, mesh: &LandmarkMesh) -> (f32, f32) {
        let left = iris_ratio(
            mesh.anchor(LEFT_IRIS_CENTER),
            mesh.anchor(LEFT_EYE_OUTER),
            mesh.anchor(LEFT_EYE_INNER),
            mesh.anchor(LEFT_EYE_UPPER),
            mesh.anchor(LEFT_EYE_LOWER),
        );
        let right = iris_ratio(
            mesh.anchor(RIGHT_IRIS_CENTER),
            mesh.anchor(RIGHT_EYE_OUTER),
            mesh.anchor(RIGHT_EYE_INNER),
            mesh.anchor(RIGHT_EYE_UPPER),
            mesh.anchor(RIGHT_EYE_LOWER),
        );

        let h = (left.0 + right.0) / 2.0;
        let v = (left.1 + right.1) / 2.0;
        (
            (h - 0.5) * self.tuning.iris_scale,
            (v - 0.5) * self.tuning.iris_scale,
        )
    }

    /// Horizontal takes priority over vertical.
    pub fn classify(&self, gaze: GazeMagnitude) -> GazeDirection {
        if gaze.horizontal.abs() > self.tuning.horizontal_threshold {
            if gaze.horizontal > 0.0 {
                GazeDirection::Right
            } else {
                GazeDirection::Left
            }
        } else if gaze.vertical.abs() > self.tuning.vertical_threshold {
            if gaze.vertical > 0.0 {
                GazeDirection::Down
            } else {
                GazeDirection::Up
            }
        } else {
            GazeDirection::Center
        }
    }

    pub fn score(&self, gaze: GazeMagnitude) -> f32 {
        let t = &self.tuning;
        let h_penalty = (gaze.horizontal.abs() / t.horizontal_cap).min(1.0);
        let v_penalty = (gaze.vertical.abs() / t.vertical_cap).min(1.0);
        let score = 100.0 - (h_penalty * t.horizontal_weight + v_penalty * t.vertical_weight);
        finite_or_zero(score).clamp(0.0, 100.0)
    }
}

/// Iris position inside the eye's bounding box, 0.5 meaning centered.
fn iris_ratio(iris: Point3, outer: Point3, inner: Point3, upper: Point3, lower: Point3) -> (f32, f32) {
    let min_x = outer.x.min(inner.x);
    let width = (outer.x - inner.x).abs();
    let top = upper.y.min(lower.y);
    let height = (lower.y - upper.y).abs();

    let h = if width > EPSILON {
        ((iris.x - min_x) / width).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let v = if height > EPSILON {
        ((iris.y - top) / height).clamp(0.0, 1.0)
    } else {
        0.5
    };
    (h, v)
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
