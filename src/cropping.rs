use crate::geometry::{
    affine_transform, estimate_similarity_transform_with, resize_frame, AlignParams, Interpolation,
    SimilarityTransform,
};
use crate::utils::image_conversion::validate_frame;
use crate::Result;
use opencv::core::{Mat, Point2f};

/// A landmark-aligned face crop and the transform pair that produced it
#[derive(Debug)]
pub struct CropInfo {
    /// Crop at full alignment size
    pub crop: Mat,
    /// Crop resized for the motion networks
    pub crop_model: Mat,
    /// `inverse` maps original → crop, `forward` maps crop → original
    pub transform: SimilarityTransform,
    /// Input landmarks expressed in crop coordinates
    pub landmarks: Vec<Point2f>,
}

impl CropInfo {
    /// Original → crop matrix
    #[must_use]
    pub fn m_o2c(&self) -> &crate::geometry::Affine2 {
        &self.transform.inverse
    }

    /// Crop → original matrix
    #[must_use]
    pub fn m_c2o(&self) -> &crate::geometry::Affine2 {
        &self.transform.forward
    }
}

/// Align and crop a face from its landmarks
///
/// # Errors
///
/// Returns an error for invalid frames, unsupported landmark layouts or
/// degenerate alignments
pub fn crop_image(frame: &Mat, landmarks: &[Point2f], params: &AlignParams, model_size: i32) -> Result<CropInfo> {
    validate_frame(frame)?;
    let transform = estimate_similarity_transform_with(landmarks, params)?;
    let crop = affine_transform(frame, &transform.inverse, params.dsize, params.dsize)?;
    let crop_model = resize_frame(&crop, model_size, model_size, Interpolation::Area)?;
    Ok(CropInfo {
        landmarks: transform.inverse.apply_all(landmarks),
        crop,
        crop_model,
        transform,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::image_conversion::solid_frame;
    use opencv::prelude::*;

    #[test]
    fn test_crop_image_sizes_and_landmarks() {
        let frame = solid_frame(400, 300, [90, 90, 90]).unwrap();
        let landmarks = vec![
            Point2f::new(180.0, 140.0),
            Point2f::new(220.0, 140.0),
            Point2f::new(200.0, 160.0),
            Point2f::new(185.0, 180.0),
            Point2f::new(215.0, 180.0),
        ];
        let info = crop_image(&frame, &landmarks, &AlignParams::PORTRAIT, 256).unwrap();
        assert_eq!((info.crop.cols(), info.crop.rows()), (512, 512));
        assert_eq!((info.crop_model.cols(), info.crop_model.rows()), (256, 256));
        for (original, cropped) in landmarks.iter().zip(&info.landmarks) {
            let back = info.m_c2o().apply(*cropped);
            assert!((back.x - original.x).abs() < 1e-3 && (back.y - original.y).abs() < 1e-3);
        }
    }
}
