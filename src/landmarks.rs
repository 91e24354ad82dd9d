//! Landmark mesh contract shared with the external face detector
//!
//! The detector hands us one normalized point mesh per processed video frame,
//! optionally with named blendshape coefficients. Anchor indices below are
//! hard-coded against the 468/478 point face mesh layout, so any detector
//! upgrade must be checked against `CONTRACT_VERSION`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Detector layout these indices were taken from.
pub const CONTRACT_VERSION: &str = "mediapipe-face-mesh/478";

/// Minimum number of points a mesh must carry.
pub const MESH_POINTS: usize = 468;
/// Point count when the detector runs with iris refinement.
pub const MESH_POINTS_WITH_IRIS: usize = 478;

pub const NOSE_TIP: usize = 1;
pub const FOREHEAD_TOP: usize = 10;
pub const CHIN: usize = 152;

pub const LEFT_EYE_OUTER: usize = 33;
pub const LEFT_EYE_INNER: usize = 133;
pub const LEFT_EYE_UPPER: usize = 159;
pub const LEFT_EYE_LOWER: usize = 145;

pub const RIGHT_EYE_OUTER: usize = 263;
pub const RIGHT_EYE_INNER: usize = 362;
pub const RIGHT_EYE_UPPER: usize = 386;
pub const RIGHT_EYE_LOWER: usize = 374;

pub const MOUTH_LEFT: usize = 61;
pub const MOUTH_RIGHT: usize = 291;
pub const UPPER_LIP_INNER: usize = 13;
pub const LOWER_LIP_INNER: usize = 14;

pub const LEFT_IRIS_CENTER: usize = 468;
pub const RIGHT_IRIS_CENTER: usize = 473;

/// Errors raised when a detector sample breaks the contract
#[derive(Debug, Error, PartialEq)]
pub enum MeshError {
    #[error("mesh has {found} points, contract requires at least {required}")]
    TooFewPoints { found: usize, required: usize },

    #[error("point {index} has a non-finite coordinate")]
    NonFinite { index: usize },
}

/// One normalized 3-D landmark
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl Point3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Distance in the image plane.
    pub fn planar_distance(&self, other: &Point3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// A single detector sample. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMesh")]
pub struct LandmarkMesh {
    points: Vec<Point3>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    blendshapes: HashMap<String, f32>,
}

#[derive(Deserialize)]
struct RawMesh {
    points: Vec<Point3>,
    #[serde(default)]
    blendshapes: HashMap<String, f32>,
}

impl TryFrom<RawMesh> for LandmarkMesh {
    type Error = MeshError;

    fn try_from(raw: RawMesh) -> Result<Self, Self::Error> {
        LandmarkMesh::new(raw.points, raw.blendshapes)
    }
}

impl LandmarkMesh {
    /// Validate a detector sample against the contract.
    ///
    /// Blendshape scores outside [0,1] are clamped; non-finite scores are
    /// dropped since the classifier treats a missing coefficient as zero.
    pub fn new(points: Vec<Point3>, blendshapes: HashMap<String, f32>) -> Result<Self, MeshError> {
        if points.len() < MESH_POINTS {
            return Err(MeshError::TooFewPoints {
                found: points.len(),
                required: MESH_POINTS,
            });
        }

        if let Some(index) = points
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()))
        {
            return Err(MeshError::NonFinite { index });
        }

        let blendshapes = blendshapes
            .into_iter()
            .filter(|(_, score)| score.is_finite())
            .map(|(name, score)| (name, score.clamp(0.0, 1.0)))
            .collect();

        Ok(Self { points, blendshapes })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether the iris refinement points are present.
    pub fn has_iris(&self) -> bool {
        self.points.len() >= MESH_POINTS_WITH_IRIS
    }

    /// Anchor lookup. Every anchor below `MESH_POINTS` is guaranteed by construction.
    pub fn point(&self, index: usize) -> Option<&Point3> {
        self.points.get(index)
    }

    pub(crate) fn anchor(&self, index: usize) -> Point3 {
        self.points.get(index).copied().unwrap_or_default()
    }

    pub fn has_blendshapes(&self) -> bool {
        !self.blendshapes.is_empty()
    }

    pub fn blendshapes(&self) -> &HashMap<String, f32> {
        &self.blendshapes
    }

    /// Coefficient by name; missing coefficients read as zero.
    pub fn blendshape(&self, name: &str) -> f32 {
        self.blendshapes.get(name).copied().unwrap_or(0.0)
    }

    /// Mean of the `<prefix>Left` / `<prefix>Right` pair, using whichever side exists.
    pub fn blendshape_pair(&self, prefix: &str) -> f32 {
        let left = self.blendshapes.get(&format!("{prefix}Left")).copied();
        let right = self.blendshapes.get(&format!("{prefix}Right")).copied();
        match (left, right) {
            (Some(l), Some(r)) => (l + r) / 2.0,
            (Some(v), None) | (None, Some(v)) => v,
            (None, None) => 0.0,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Mesh builders for tests. Coordinates are binary fractions so the
    //! geometry comes out exact in f32.

    use super::*;

    pub struct MeshBuilder {
        points: Vec<Point3>,
        blendshapes: HashMap<String, f32>,
    }

    impl MeshBuilder {
        /// Frontal face, nose centered between the eyes, forehead and chin equidistant.
        pub fn frontal(with_iris: bool) -> Self {
            let count = if with_iris { MESH_POINTS_WITH_IRIS } else { MESH_POINTS };
            let mut points = vec![Point3::new(0.5, 0.5, 0.0); count];

            let mut set = |i: usize, x: f32, y: f32| points[i] = Point3::new(x, y, 0.0);
            set(NOSE_TIP, 0.5, 0.5);
            set(FOREHEAD_TOP, 0.5, 0.25);
            set(CHIN, 0.5, 0.75);

            set(LEFT_EYE_OUTER, 0.375, 0.375);
            set(LEFT_EYE_INNER, 0.4375, 0.375);
            set(LEFT_EYE_UPPER, 0.40625, 0.3671875);
            set(LEFT_EYE_LOWER, 0.40625, 0.3828125);

            set(RIGHT_EYE_OUTER, 0.625, 0.375);
            set(RIGHT_EYE_INNER, 0.5625, 0.375);
            set(RIGHT_EYE_UPPER, 0.59375, 0.3671875);
            set(RIGHT_EYE_LOWER, 0.59375, 0.3828125);

            set(MOUTH_LEFT, 0.4375, 0.625);
            set(MOUTH_RIGHT, 0.5625, 0.625);
            set(UPPER_LIP_INNER, 0.5, 0.62109375);
            set(LOWER_LIP_INNER, 0.5, 0.62890625);

            if with_iris {
                set(LEFT_IRIS_CENTER, 0.40625, 0.375);
                set(RIGHT_IRIS_CENTER, 0.59375, 0.375);
            }

            Self {
                points,
                blendshapes: HashMap::new(),
            }
        }

        pub fn point(mut self, index: usize, x: f32, y: f32) -> Self {
            self.points[index] = Point3::new(x, y, 0.0);
            self
        }

        pub fn blendshape(mut self, name: &str, score: f32) -> Self {
            self.blendshapes.insert(name.to_string(), score);
            self
        }

        pub fn build(self) -> LandmarkMesh {
            LandmarkMesh::new(self.points, self.blendshapes).expect("fixture mesh is valid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::MeshBuilder;
    use super::*;

    #[test]
    fn rejects_short_meshes() {
        let err = LandmarkMesh::new(vec![Point3::default(); 10], HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            MeshError::TooFewPoints {
                found: 10,
                required: MESH_POINTS
            }
        );
    }

    #[test]
    fn rejects_non_finite_points() {
        let mut points = vec![Point3::default(); MESH_POINTS];
        points[42].y = f32::NAN;
        let err = LandmarkMesh::new(points, HashMap::new()).unwrap_err();
        assert_eq!(err, MeshError::NonFinite { index: 42 });
    }

    #[test]
    fn clamps_and_filters_blendshapes() {
        let mut shapes = HashMap::new();
        shapes.insert("jawOpen".to_string(), 1.7);
        shapes.insert("mouthPucker".to_string(), -0.2);
        shapes.insert("browInnerUp".to_string(), f32::INFINITY);
        let mesh = LandmarkMesh::new(vec![Point3::default(); MESH_POINTS], shapes).unwrap();

        assert_eq!(mesh.blendshape("jawOpen"), 1.0);
        assert_eq!(mesh.blendshape("mouthPucker"), 0.0);
        assert_eq!(mesh.blendshape("browInnerUp"), 0.0);
        assert_eq!(mesh.blendshapes().len(), 2);
    }

    #[test]
    fn blendshape_pair_uses_available_sides() {
        let mesh = MeshBuilder::frontal(false)
            .blendshape("mouthSmileLeft", 0.4)
            .blendshape("mouthSmileRight", 0.8)
            .blendshape("eyeWideLeft", 0.6)
            .build();

        assert!((mesh.blendshape_pair("mouthSmile") - 0.6).abs() < 1e-6);
        assert!((mesh.blendshape_pair("eyeWide") - 0.6).abs() < 1e-6);
        assert_eq!(mesh.blendshape_pair("browDown"), 0.0);
    }

    #[test]
    fn iris_presence_follows_point_count() {
        assert!(!MeshBuilder::frontal(false).build().has_iris());
        assert!(MeshBuilder::frontal(true).build().has_iris());
    }

    #[test]
    fn deserializing_validates_the_contract() {
        let json = serde_json::json!({ "points": [{ "x": 0.1, "y": 0.2 }] });
        assert!(serde_json::from_value::<LandmarkMesh>(json).is_err());

        let mesh = MeshBuilder::frontal(true).blendshape("jawOpen", 0.25).build();
        let line = serde_json::to_string(&mesh).unwrap();
        let parsed: LandmarkMesh = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, mesh);
    }
}
