use crate::constants::{LANDMARK_CROP_EXPAND, LANDMARK_INPUT_SIZE, NUM_FACIAL_LANDMARKS, REFINER_INPUT_SIZE};
use crate::geometry::{
    affine_transform, center_scale_transform, estimate_similarity_transform_with, AlignParams, FaceBox,
    SimilarityTransform,
};
use crate::runtime::{BufferPool, SharedModel};
use crate::utils::image_conversion::{frame_to_nchw_into, validate_frame, Normalization};
use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use ndarray::ArrayD;
use opencv::core::{Mat, Point2f};

fn landmark_output(outputs: &[ArrayD<f32>], index: usize, model: &str) -> Result<Vec<f32>> {
    let output = outputs
        .get(index)
        .ok_or_else(|| Error::ModelOutputError(format!("Model '{model}' produced no output {index}")))?;
    let values: Vec<f32> = output.iter().copied().collect();
    if values.is_empty() || values.len() % 2 != 0 {
        return Err(Error::ModelOutputError(format!(
            "Model '{model}' produced {} landmark values",
            values.len()
        )));
    }
    Ok(values)
}

/// 106-point landmark detector working on a box-centred 192×192 crop
pub struct LandmarkDetector {
    model: SharedModel,
    pool: BufferPool,
}

impl LandmarkDetector {
    /// Wrap a 106-point landmark model
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        log::info!("Initializing LandmarkDetector with model '{}'", model.lock().name());
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

    /// Crop transform for a detection box
    ///
    /// # Errors
    ///
    /// Returns an error for degenerate boxes
    pub fn crop_transform(bbox: &FaceBox) -> Result<SimilarityTransform> {
        bbox.validate()?;
        let scale = LANDMARK_INPUT_SIZE as f32 / (bbox.width().max(bbox.height()) * LANDMARK_CROP_EXPAND);
        center_scale_transform(bbox.center(), LANDMARK_INPUT_SIZE, scale)
    }

    /// Detect 106 landmarks inside `bbox`, returned in image coordinates
    ///
    /// # Errors
    ///
    /// Returns an error for invalid frames or boxes and model failures
    pub fn detect(&mut self, frame: &Mat, bbox: &FaceBox) -> Result<Vec<Point2f>> {
        validate_frame(frame)?;
        let transform = Self::crop_transform(bbox)?;
        let crop = affine_transform(frame, &transform.inverse, LANDMARK_INPUT_SIZE, LANDMARK_INPUT_SIZE)?;

        let side = i32_to_usize(LANDMARK_INPUT_SIZE)?;
        let tensor = self.pool.nchw(0, [1, 3, side, side]);
        frame_to_nchw_into(&crop, &Normalization::IDENTITY, tensor)?;

        let values = {
            let mut model = self.model.lock();
            let name = model.name().to_string();
            let outputs = model.run(&[tensor.view().into_dyn()])?;
            landmark_output(outputs, 0, &name)?
        };
        if values.len() < NUM_FACIAL_LANDMARKS * 2 {
            return Err(Error::ModelOutputError(format!(
                "Expected {} landmark values, got {}",
                NUM_FACIAL_LANDMARKS * 2,
                values.len()
            )));
        }

        let half = LANDMARK_INPUT_SIZE as f32 / 2.0;
        Ok(values
            .chunks_exact(2)
            .take(NUM_FACIAL_LANDMARKS)
            .map(|p| transform.forward.apply(Point2f::new((p[0] + 1.0) * half, (p[1] + 1.0) * half)))
            .collect())
    }
}

/// Landmark refiner used for tracking between driving frames
pub struct LandmarkRefiner {
    model: SharedModel,
    pool: BufferPool,
}

impl LandmarkRefiner {
    /// Wrap a refinement model
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        log::info!("Initializing LandmarkRefiner with model '{}'", model.lock().name());
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

    /// Re-estimate landmarks from a 224×224 crop aligned on the previous ones.
    ///
    /// Accepts 5-, 106- or 203-point input; the output layout is whatever the
    /// model's last output holds.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid frames, unsupported layouts or model failures
    pub fn refine(&mut self, frame: &Mat, landmarks: &[Point2f]) -> Result<Vec<Point2f>> {
        validate_frame(frame)?;
        let transform = estimate_similarity_transform_with(landmarks, &AlignParams::REFINER)?;
        let crop = affine_transform(frame, &transform.inverse, REFINER_INPUT_SIZE, REFINER_INPUT_SIZE)?;

        let side = i32_to_usize(REFINER_INPUT_SIZE)?;
        let tensor = self.pool.nchw(0, [1, 3, side, side]);
        frame_to_nchw_into(&crop, &Normalization::UNIT, tensor)?;

        let values = {
            let mut model = self.model.lock();
            let name = model.name().to_string();
            let outputs = model.run(&[tensor.view().into_dyn()])?;
            let last = outputs
                .len()
                .checked_sub(1)
                .ok_or_else(|| Error::ModelOutputError(format!("Model '{name}' produced no outputs")))?;
            landmark_output(outputs, last, &name)?
        };

        let size = REFINER_INPUT_SIZE as f32;
        Ok(values
            .chunks_exact(2)
            .map(|p| transform.forward.apply(Point2f::new(p[0] * size, p[1] * size)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_transform_centres_box() {
        let bbox = FaceBox::new(100.0, 50.0, 164.0, 130.0);
        let t = LandmarkDetector::crop_transform(&bbox).unwrap();
        let c = t.inverse.apply(bbox.center());
        assert!((c.x - 96.0).abs() < 1e-4 && (c.y - 96.0).abs() < 1e-4);
        // 80px side expanded by 1.5 fills the 192 crop
        let top = t.inverse.apply(Point2f::new(132.0, 30.0));
        assert!((top.y - 0.0).abs() < 1e-3);
    }

    #[test]
    fn test_crop_transform_rejects_degenerate_box() {
        assert!(LandmarkDetector::crop_transform(&FaceBox::new(10.0, 10.0, 10.0, 20.0)).is_err());
    }

    #[test]
    fn test_landmark_output_validation() {
        let odd = vec![ArrayD::zeros(ndarray::IxDyn(&[1, 3]))];
        assert!(landmark_output(&odd, 0, "m").is_err());
        assert!(landmark_output(&odd, 1, "m").is_err());
        let ok = vec![ArrayD::zeros(ndarray::IxDyn(&[1, 212]))];
        assert_eq!(landmark_output(&ok, 0, "m").unwrap().len(), 212);
    }
}
