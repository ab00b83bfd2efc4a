use crate::constants::{
    HEAD_POSE_BINS, HEAD_POSE_BIN_DEGREES, HEAD_POSE_OFFSET_DEGREES, MOTION_INPUT_SIZE, NUM_IMPLICIT_KEYPOINTS,
};
use crate::geometry::rotation_matrix;
use crate::runtime::{BufferPool, SharedModel};
use crate::utils::image_conversion::{frame_to_nchw_into, validate_frame, Normalization};
use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use nalgebra::Matrix3;
use ndarray::{Array2, ArrayD};
use opencv::core::Mat;
use opencv::prelude::*;

/// Head pose, expression and keypoints of one face crop
#[derive(Debug, Clone, PartialEq)]
pub struct MotionInfo {
    /// Rotation about x in degrees
    pub pitch: f32,
    /// Rotation about y in degrees
    pub yaw: f32,
    /// Rotation about z in degrees
    pub roll: f32,
    /// Translation
    pub translation: [f32; 3],
    /// Per-keypoint expression offsets, `(21, 3)`
    pub expression: Array2<f32>,
    /// Uniform scale
    pub scale: f32,
    /// Canonical keypoints, `(21, 3)`
    pub keypoints: Array2<f32>,
    /// Rotation built from the three angles
    pub rotation: Matrix3<f32>,
}

impl MotionInfo {
    /// Assemble motion from its components, deriving the rotation matrix
    #[must_use]
    pub fn new(
        (pitch, yaw, roll): (f32, f32, f32),
        translation: [f32; 3],
        expression: Array2<f32>,
        scale: f32,
        keypoints: Array2<f32>,
    ) -> Self {
        Self {
            pitch,
            yaw,
            roll,
            translation,
            expression,
            scale,
            keypoints,
            rotation: rotation_matrix(pitch, yaw, roll),
        }
    }
}

/// Softmax-weighted bin index mapped to degrees
///
/// # Errors
///
/// Returns an error unless exactly 66 logits are given
pub fn headpose_degrees(logits: &[f32]) -> Result<f32> {
    if logits.len() != HEAD_POSE_BINS {
        return Err(Error::ModelOutputError(format!(
            "Expected {HEAD_POSE_BINS} head pose bins, got {}",
            logits.len()
        )));
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let total: f32 = weights.iter().sum();
    let expectation: f32 = weights.iter().enumerate().map(|(i, w)| i as f32 * w).sum::<f32>() / total;
    Ok(expectation * HEAD_POSE_BIN_DEGREES - HEAD_POSE_OFFSET_DEGREES)
}

fn values<'a>(outputs: &'a [ArrayD<f32>], index: usize, expected: usize, what: &str) -> Result<&'a [f32]> {
    let data = outputs
        .get(index)
        .ok_or_else(|| Error::ModelOutputError(format!("Motion extractor is missing its {what} output")))?
        .as_slice()
        .ok_or_else(|| Error::ModelDataFormatError(format!("{what} output is not contiguous")))?;
    if data.len() != expected {
        return Err(Error::ModelOutputError(format!(
            "{what} output has {} values, expected {expected}",
            data.len()
        )));
    }
    Ok(data)
}

fn keypoint_array(data: &[f32]) -> Result<Array2<f32>> {
    Array2::from_shape_vec((NUM_IMPLICIT_KEYPOINTS, 3), data.to_vec())
        .map_err(|e| Error::ModelDataFormatError(format!("Failed to shape keypoints: {e}")))
}

/// Pose and expression extractor.
///
/// Output order: pitch, yaw, roll logits, translation, expression, scale,
/// canonical keypoints.
pub struct MotionExtractor {
    model: SharedModel,
    pool: BufferPool,
}

impl MotionExtractor {
    /// Wrap a motion extraction model
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        log::info!("Initializing MotionExtractor with model '{}'", model.lock().name());
        Self {
            model,
            pool: BufferPool::new(),
        }
    }

    /// The wrapped model
    #[must_use]
    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    /// Motion of a 256×256 face crop
    ///
    /// # Errors
    ///
    /// Returns an error for crops of the wrong size and model failures
    pub fn extract(&mut self, crop: &Mat) -> Result<MotionInfo> {
        validate_frame(crop)?;
        if crop.cols() != MOTION_INPUT_SIZE || crop.rows() != MOTION_INPUT_SIZE {
            return Err(Error::InvalidInput(format!(
                "Motion extractor expects a {MOTION_INPUT_SIZE}x{MOTION_INPUT_SIZE} crop, got {}x{}",
                crop.cols(),
                crop.rows()
            )));
        }
        let side = i32_to_usize(MOTION_INPUT_SIZE)?;
        let tensor = self.pool.nchw(0, [1, 3, side, side]);
        frame_to_nchw_into(crop, &Normalization::UNIT, tensor)?;

        let mut model = self.model.lock();
        let outputs = model.run(&[tensor.view().into_dyn()])?;
        let n = NUM_IMPLICIT_KEYPOINTS * 3;

        let pitch = headpose_degrees(values(outputs, 0, HEAD_POSE_BINS, "pitch")?)?;
        let yaw = headpose_degrees(values(outputs, 1, HEAD_POSE_BINS, "yaw")?)?;
        let roll = headpose_degrees(values(outputs, 2, HEAD_POSE_BINS, "roll")?)?;
        let t = values(outputs, 3, 3, "translation")?;
        let expression = keypoint_array(values(outputs, 4, n, "expression")?)?;
        let scale = values(outputs, 5, 1, "scale")?[0];
        let keypoints = keypoint_array(values(outputs, 6, n, "keypoint")?)?;

        log::debug!("Head pose: pitch {pitch:.1}°, yaw {yaw:.1}°, roll {roll:.1}°");
        Ok(MotionInfo::new(
            (pitch, yaw, roll),
            [t[0], t[1], t[2]],
            expression,
            scale,
            keypoints,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_are_centred() {
        let degrees = headpose_degrees(&[0.0; HEAD_POSE_BINS]).unwrap();
        assert!(degrees.abs() < 1e-4);
    }

    #[test]
    fn test_peaked_logits_pick_bin() {
        let mut logits = vec![-100.0f32; HEAD_POSE_BINS];
        logits[40] = 100.0;
        let degrees = headpose_degrees(&logits).unwrap();
        assert!((degrees - (40.0 * 3.0 - 97.5)).abs() < 1e-3);
    }

    #[test]
    fn test_wrong_bin_count() {
        assert!(headpose_degrees(&[0.0; 10]).is_err());
    }

    #[test]
    fn test_motion_info_builds_rotation() {
        let zeros = Array2::zeros((NUM_IMPLICIT_KEYPOINTS, 3));
        let info = MotionInfo::new((0.0, 0.0, 0.0), [0.0; 3], zeros.clone(), 1.0, zeros);
        assert!((info.rotation - Matrix3::identity()).abs().max() < 1e-7);
    }
}
