use crate::common::config::AcquisitionConfig;
use crate::core::detector::{FaceBox, FaceLandmarks};

/// What one frame tells the acquisition gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionSample {
    pub score: f32,
    pub box_height: f32,
    /// Signed head yaw in [-1, 1]. Positive when the head turns towards the
    /// image's right edge.
    pub horizontal_angle_ratio: f32,
}

impl DetectionSample {
    /// Needs landmarks; a box alone gives no angle.
    pub fn from_face(face: &FaceBox) -> Option<Self> {
        let landmarks = face.landmarks.as_ref()?;
        Some(Self {
            score: face.confidence,
            box_height: face.height(),
            horizontal_angle_ratio: horizontal_angle_ratio(face, landmarks),
        })
    }
}

/// Estimates yaw from where the nose sits between the face's sides.
///
/// Two estimates are averaged: the nose position between the box edges
/// (standing in for the jaw line), and the nose offset from the eye/mouth
/// midline scaled by the eye distance. A frontal face gives 0.
pub fn horizontal_angle_ratio(face: &FaceBox, lm: &FaceLandmarks) -> f32 {
    let nose_x = lm.nose.x;

    let left_span = nose_x - face.x1;
    let right_span = face.x2 - nose_x;
    let total = left_span + right_span;
    let edge_ratio = if total > f32::EPSILON {
        (left_span - right_span) / total
    } else {
        0.0
    };

    let eye_mid = (lm.left_eye.x + lm.right_eye.x) / 2.0;
    let mouth_mid = (lm.mouth_left.x + lm.mouth_right.x) / 2.0;
    let midline = (eye_mid + mouth_mid) / 2.0;
    let eye_distance = (lm.right_eye.x - lm.left_eye.x).abs();
    let landmark_ratio = if eye_distance > f32::EPSILON {
        (nose_x - midline) / eye_distance
    } else {
        0.0
    };

    ((edge_ratio + landmark_ratio) / 2.0).clamp(-1.0, 1.0)
}

/// Hint shown while a sample does not qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guidance {
    NoFace,
    LowConfidence,
    MoveCloser,
    TurnLeft,
    TurnRight,
}

impl Guidance {
    pub fn message(&self) -> &'static str {
        match self {
            Guidance::NoFace => "No face detected",
            Guidance::LowConfidence => "Face not clear, improve lighting",
            Guidance::MoveCloser => "Move closer to the camera",
            Guidance::TurnLeft => "Turn your head slightly left",
            Guidance::TurnRight => "Turn your head slightly right",
        }
    }
}

/// The qualification gate: confident, frontal enough and close enough.
pub fn assess(sample: &DetectionSample, config: &AcquisitionConfig) -> Result<(), Guidance> {
    if sample.score <= config.score_threshold {
        return Err(Guidance::LowConfidence);
    }
    if sample.box_height <= config.min_box_height {
        return Err(Guidance::MoveCloser);
    }
    if sample.horizontal_angle_ratio.abs() > config.angle_threshold {
        return Err(if sample.horizontal_angle_ratio > 0.0 {
            Guidance::TurnLeft
        } else {
            Guidance::TurnRight
        });
    }
    Ok(())
}
