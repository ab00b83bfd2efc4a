use crate::constants::{MOTION_INPUT_SIZE, NUM_IMPLICIT_KEYPOINTS};
use crate::runtime::{BufferPool, FlatBuffer, SharedModel};
use crate::utils::image_conversion::{frame_to_nchw_into, unit_nchw_to_frame, validate_frame, Normalization};
use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use ndarray::{Array2, ArrayD};
use opencv::core::Mat;
use opencv::prelude::*;

/// Extracts the 3-D appearance feature volume of a source crop
pub struct AppearanceExtractor {
    model: SharedModel,
    pool: BufferPool,
}

impl AppearanceExtractor {
    /// Wrap an appearance feature model
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
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

    /// Feature volume of a 256×256 crop, owned by the caller so it can be
    /// handed to the warping model on every frame
    ///
    /// # Errors
    ///
    /// Returns an error for crops of the wrong size and model failures
    pub fn extract(&mut self, crop: &Mat) -> Result<ArrayD<f32>> {
        validate_frame(crop)?;
        if crop.cols() != MOTION_INPUT_SIZE || crop.rows() != MOTION_INPUT_SIZE {
            return Err(Error::InvalidInput(format!(
                "Appearance extractor expects a {MOTION_INPUT_SIZE}x{MOTION_INPUT_SIZE} crop"
            )));
        }
        let side = i32_to_usize(MOTION_INPUT_SIZE)?;
        let tensor = self.pool.nchw(0, [1, 3, side, side]);
        frame_to_nchw_into(crop, &Normalization::UNIT, tensor)?;

        let mut outputs = self.model.lock().run_owned(&[tensor.view().into_dyn()])?;
        if outputs.is_empty() {
            return Err(Error::ModelOutputError(
                "Appearance extractor produced no outputs".to_string(),
            ));
        }
        Ok(outputs.swap_remove(0))
    }
}

/// Renders the reposed face from features and two keypoint sets
pub struct Warper {
    model: SharedModel,
    source_kp: FlatBuffer,
    driving_kp: FlatBuffer,
}

impl Warper {
    /// Wrap a warping/render model
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        Self {
            model,
            source_kp: FlatBuffer::default(),
            driving_kp: FlatBuffer::default(),
        }
    }

    /// The wrapped model
    #[must_use]
    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    /// Render the face; output pixels come from the model's `[0, 1]` image
    ///
    /// # Errors
    ///
    /// Returns an error for wrongly shaped keypoints or model failures
    pub fn render(&mut self, features: &ArrayD<f32>, source: &Array2<f32>, driving: &Array2<f32>) -> Result<Mat> {
        let shape = [1, NUM_IMPLICIT_KEYPOINTS, 3];
        if source.len() != NUM_IMPLICIT_KEYPOINTS * 3 || driving.len() != NUM_IMPLICIT_KEYPOINTS * 3 {
            return Err(Error::InvalidInput(format!(
                "Warping expects {NUM_IMPLICIT_KEYPOINTS} keypoints per set"
            )));
        }
        let kp_s = self.source_kp.shaped(&shape);
        kp_s.iter_mut().zip(source.iter()).for_each(|(d, s)| *d = *s);
        let kp_d = self.driving_kp.shaped(&shape);
        kp_d.iter_mut().zip(driving.iter()).for_each(|(d, s)| *d = *s);

        let mut model = self.model.lock();
        let outputs = model.run(&[features.view(), kp_s.view(), kp_d.view()])?;
        let image = outputs
            .first()
            .ok_or_else(|| Error::ModelOutputError("Warping model produced no outputs".to_string()))?;
        unit_nchw_to_frame(&image.view())
    }
}
