use crate::constants::{NUM_IMPLICIT_KEYPOINTS, STITCHING_OUTPUT_LEN};
use crate::runtime::{FlatBuffer, SharedModel};
use crate::{Error, Result};
use ndarray::Array2;

/// Apply a stitching prediction: per-keypoint deltas, then a shared `(dx, dy)`
///
/// # Errors
///
/// Returns an error if `prediction` does not hold 65 values
pub fn apply_stitching(driving: &Array2<f32>, prediction: &[f32]) -> Result<Array2<f32>> {
    if prediction.len() != STITCHING_OUTPUT_LEN || driving.nrows() != NUM_IMPLICIT_KEYPOINTS {
        return Err(Error::ModelOutputError(format!(
            "Stitching expects {STITCHING_OUTPUT_LEN} values for {NUM_IMPLICIT_KEYPOINTS} keypoints, got {} for {}",
            prediction.len(),
            driving.nrows()
        )));
    }
    let n = NUM_IMPLICIT_KEYPOINTS * 3;
    let delta = Array2::from_shape_vec((NUM_IMPLICIT_KEYPOINTS, 3), prediction[..n].to_vec())
        .map_err(|e| Error::ModelDataFormatError(format!("Failed to shape stitching deltas: {e}")))?;
    let (dx, dy) = (prediction[n], prediction[n + 1]);

    let mut out = driving + &delta;
    out.column_mut(0).mapv_inplace(|v| v + dx);
    out.column_mut(1).mapv_inplace(|v| v + dy);
    Ok(out)
}

/// Keypoint stitching refiner
pub struct StitchingRefiner {
    model: SharedModel,
    input: FlatBuffer,
}

impl StitchingRefiner {
    /// Wrap a stitching model
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        Self {
            model,
            input: FlatBuffer::default(),
        }
    }

    /// The wrapped model
    #[must_use]
    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    /// Refine driving keypoints against the source keypoints
    ///
    /// # Errors
    ///
    /// Returns an error for wrongly shaped keypoints or model failures
    pub fn stitch(&mut self, source: &Array2<f32>, driving: &Array2<f32>) -> Result<Array2<f32>> {
        let n = NUM_IMPLICIT_KEYPOINTS * 3;
        if source.len() != n || driving.len() != n {
            return Err(Error::InvalidInput(format!(
                "Stitching expects two sets of {NUM_IMPLICIT_KEYPOINTS} keypoints"
            )));
        }

        let input = self.input.shaped(&[1, 2 * n]);
        for (dst, src) in input.iter_mut().zip(source.iter().chain(driving.iter())) {
            *dst = *src;
        }

        let prediction: Vec<f32> = {
            let mut model = self.model.lock();
            let outputs = model.run(&[input.view()])?;
            outputs
                .first()
                .ok_or_else(|| Error::ModelOutputError("Stitching model produced no outputs".to_string()))?
                .iter()
                .copied()
                .collect()
        };
        apply_stitching(driving, &prediction)
    }
}
