//! Emotion classification from mesh geometry and blendshape coefficients

use crate::landmarks::*;
use serde::{Deserialize, Serialize};

/// Discrete emotion label. Declaration order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Surprised,
    Angry,
}

impl Emotion {
    pub const ALL: [Emotion; 5] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprised,
        Emotion::Angry,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionSample {
    pub emotion: Emotion,
    pub confidence: f32,
}

impl EmotionSample {
    pub const NEUTRAL: EmotionSample = EmotionSample {
        emotion: Emotion::Neutral,
        confidence: 0.0,
    };
}

/// Minimum composite an emotion needs before it can win.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionThresholds {
    pub happy: f32,
    pub sad: f32,
    pub surprised: f32,
    pub angry: f32,
}

impl Default for EmotionThresholds {
    fn default() -> Self {
        // surprised overlaps with open-mouth speech, so it needs more evidence
        Self {
            happy: 0.30,
            sad: 0.30,
            surprised: 0.45,
            angry: 0.30,
        }
    }
}

/// Openness ratios derived from the mesh geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceRatios {
    pub eye_aspect: f32,
    pub mouth_aspect: f32,
}

/// Raw composites before thresholding, each in [0,1]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmotionScores {
    pub neutral: f32,
    pub happy: f32,
    pub sad: f32,
    pub surprised: f32,
    pub angry: f32,
}

#[derive(Debug, Clone, Default)]
pub struct EmotionClassifier {
    thresholds: EmotionThresholds,
}

impl EmotionClassifier {
    pub fn new(thresholds: EmotionThresholds) -> Self {
        Self { thresholds }
    }

    /// Pure classification of one mesh. An empty blendshape set yields
    /// `Neutral` at zero confidence.
    pub fn classify(&self, mesh: &LandmarkMesh) -> EmotionSample {
        if !mesh.has_blendshapes() {
            return EmotionSample::NEUTRAL;
        }

        let scores = self.scores(mesh);
        let t = &self.thresholds;
        let gate = |value: f32, min: f32| if value >= min { value } else { 0.0 };

        let candidates = [
            (Emotion::Neutral, scores.neutral),
            (Emotion::Happy, gate(scores.happy, t.happy)),
            (Emotion::Sad, gate(scores.sad, t.sad)),
            (Emotion::Surprised, gate(scores.surprised, t.surprised)),
            (Emotion::Angry, gate(scores.angry, t.angry)),
        ];

        let (emotion, best) = candidates
            .iter()
            .copied()
            .fold((Emotion::Neutral, f32::MIN), |acc, candidate| {
                if candidate.1 > acc.1 {
                    candidate
                } else {
                    acc
                }
            });

        EmotionSample {
            emotion,
            confidence: (best * 100.0).clamp(0.0, 100.0),
        }
    }

    pub fn ratios(&self, mesh: &LandmarkMesh) -> FaceRatios {
        let left = aspect(
            mesh.anchor(LEFT_EYE_UPPER),
            mesh.anchor(LEFT_EYE_LOWER),
            mesh.anchor(LEFT_EYE_OUTER),
            mesh.anchor(LEFT_EYE_INNER),
        );
        let right = aspect(
            mesh.anchor(RIGHT_EYE_UPPER),
            mesh.anchor(RIGHT_EYE_LOWER),
            mesh.anchor(RIGHT_EYE_OUTER),
            mesh.anchor(RIGHT_EYE_INNER),
        );
        let mouth = aspect(
            mesh.anchor(UPPER_LIP_INNER),
            mesh.anchor(LOWER_LIP_INNER),
            mesh.anchor(MOUTH_LEFT),
            mesh.anchor(MOUTH_RIGHT),
        );

        FaceRatios {
            eye_aspect: (left + right) / 2.0,
            mouth_aspect: mouth,
        }
    }

    pub fn scores(&self, mesh: &LandmarkMesh) -> EmotionScores {
        let ratios = self.ratios(mesh);
        // wide-open eyes / mouth beyond a relaxed face
        let eyes_open = unit((ratios.eye_aspect - 0.25) / 0.15);
        let mouth_open = unit((ratios.mouth_aspect - 0.3) / 0.4);

        let smile = mesh.blendshape_pair("mouthSmile");
        let frown = mesh.blendshape_pair("mouthFrown");
        let eye_wide = mesh.blendshape_pair("eyeWide");
        let eye_squint = mesh.blendshape_pair("eyeSquint");
        let brow_down = mesh.blendshape_pair("browDown");
        let brow_inner_up = mesh.blendshape("browInnerUp");
        let brow_outer_up = mesh.blendshape_pair("browOuterUp");
        let jaw_open = mesh.blendshape("jawOpen");
        let pucker = mesh.blendshape("mouthPucker");
        let cheek_squint = mesh.blendshape_pair("cheekSquint");

        let happy = unit(0.6 * smile + 0.25 * cheek_squint + 0.15 * eye_squint);
        let sad = unit(0.5 * frown + 0.3 * brow_inner_up + 0.2 * pucker);
        let surprised = unit(
            0.3 * eye_wide
                + 0.2 * jaw_open
                + 0.15 * brow_outer_up
                + 0.15 * brow_inner_up
                + 0.1 * eyes_open
                + 0.1 * mouth_open,
        );
        let angry = unit(0.55 * brow_down + 0.25 * eye_squint + 0.2 * frown);

        let strongest = happy.max(sad).max(surprised).max(angry);
        let neutral = (1.0 - 1.5 * strongest).max(0.0);

        EmotionScores {
            neutral,
            happy,
            sad,
            surprised,
            angry,
        }
    }
}

/// Vertical gap over horizontal width.
fn aspect(top: Point3, bottom: Point3, a: Point3, b: Point3) -> f32 {
    let width = a.planar_distance(&b);
    if width <= f32::EPSILON {
        return 0.0;
    }
    let ratio = top.planar_distance(&bottom) / width;
    if ratio.is_finite() {
        ratio
    } else {
        0.0
    }
}

fn unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
