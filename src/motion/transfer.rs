//! Motion transfer from driving frames onto the source keypoints.

use crate::geometry::compose_relative_rotation;
use crate::pose_estimation::MotionInfo;
use nalgebra::Matrix3;
use ndarray::Array2;
use opencv::core::Point2f;

/// `(kp · R + exp) × scale`, then `t.x`/`t.y` added to x and y
#[must_use]
pub fn transform_keypoints(
    keypoints: &Array2<f32>,
    rotation: &Matrix3<f32>,
    expression: &Array2<f32>,
    scale: f32,
    translation: &[f32; 3],
) -> Array2<f32> {
    let mut out = Array2::zeros(keypoints.raw_dim());
    for ((kp, exp), mut dst) in keypoints
        .outer_iter()
        .zip(expression.outer_iter())
        .zip(out.outer_iter_mut())
    {
        for col in 0..3 {
            let rotated = kp[0] * rotation[(0, col)] + kp[1] * rotation[(1, col)] + kp[2] * rotation[(2, col)];
            dst[col] = (rotated + exp[col]) * scale;
        }
        dst[0] += translation[0];
        dst[1] += translation[1];
    }
    out
}

/// Pose, expression, scale and translation to apply to the source keypoints
#[derive(Debug, Clone, PartialEq)]
pub struct MotionTarget {
    /// Target rotation
    pub rotation: Matrix3<f32>,
    /// Target expression offsets
    pub expression: Array2<f32>,
    /// Target scale
    pub scale: f32,
    /// Target translation with z forced to zero
    pub translation: [f32; 3],
}

impl MotionTarget {
    /// Motion of the current driving frame relative to the first one, applied on the source
    #[must_use]
    pub fn relative(source: &MotionInfo, driving: &MotionInfo, reference: &MotionInfo) -> Self {
        let expression = &source.expression + &(&driving.expression - &reference.expression);
        let scale = source.scale * (driving.scale / reference.scale);
        let translation = [
            source.translation[0] + (driving.translation[0] - reference.translation[0]),
            source.translation[1] + (driving.translation[1] - reference.translation[1]),
            0.0,
        ];
        Self {
            rotation: compose_relative_rotation(&driving.rotation, &reference.rotation, &source.rotation),
            expression,
            scale,
            translation,
        }
    }

    /// Driving motion used as is
    #[must_use]
    pub fn absolute(driving: &MotionInfo) -> Self {
        Self {
            rotation: driving.rotation,
            expression: driving.expression.clone(),
            scale: driving.scale,
            translation: [driving.translation[0], driving.translation[1], 0.0],
        }
    }

    /// Apply to the source's canonical keypoints
    #[must_use]
    pub fn driving_keypoints(&self, canonical: &Array2<f32>) -> Array2<f32> {
        transform_keypoints(canonical, &self.rotation, &self.expression, self.scale, &self.translation)
    }
}

/// Per-session tracking state
#[derive(Debug, Clone, Default)]
pub struct PredictionState {
    /// Landmarks of the previous driving frame
    pub landmarks: Option<Vec<Point2f>>,
    /// Motion of the first driving frame
    pub reference: Option<MotionInfo>,
}

impl PredictionState {
    /// Whether the next driving frame is the first of the session
    #[must_use]
    pub fn is_first_frame(&self) -> bool {
        self.landmarks.is_none()
    }

    /// Forget everything so the next frame is treated as the first
    pub fn reset(&mut self) {
        self.landmarks = None;
        self.reference = None;
    }
}
