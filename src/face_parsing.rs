use crate::constants::{IMAGENET_MEAN, IMAGENET_STD, PARSING_INPUT_SIZE, PARSING_NUM_CLASSES};
use crate::geometry::{resize_frame, Interpolation};
use crate::runtime::{BufferPool, SharedModel};
use crate::utils::image_conversion::{frame_to_nchw_into, solid_mask, validate_frame, Normalization};
use crate::utils::safe_cast::{i32_to_usize, usize_to_i32};
use crate::{Error, Result};
use ndarray::{ArrayView4, Ix4};
use opencv::core::{Mat, Point, Size};
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

/// Segmentation classes of the 19-class parsing model that masks may select
pub mod class {
    /// Facial skin
    pub const SKIN: u8 = 1;
    /// Inner mouth
    pub const MOUTH: u8 = 11;
    /// Upper lip
    pub const UPPER_LIP: u8 = 12;
    /// Lower lip
    pub const LOWER_LIP: u8 = 13;
    /// Neck
    pub const NECK: u8 = 14;
}

const RAW_CLASSES: &[u8] = &[class::SKIN, class::MOUTH, class::UPPER_LIP, class::LOWER_LIP];
const NECK_CLASSES: &[u8] = &[class::SKIN, class::MOUTH, class::UPPER_LIP, class::LOWER_LIP, class::NECK];

/// Which regions the blend mask covers and how its edges are smoothed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskMode {
    /// Skin, mouth and lips with a light blur
    #[default]
    Raw,
    /// Raw plus the neck
    Neck,
    /// Raw classes closed by dilation and erosion before blurring
    Jaw,
}

impl MaskMode {
    /// Classes selected by this mode
    #[must_use]
    pub const fn classes(self) -> &'static [u8] {
        match self {
            Self::Raw | Self::Jaw => RAW_CLASSES,
            Self::Neck => NECK_CLASSES,
        }
    }

    fn smooth(self, mask: &Mat) -> Result<Mat> {
        let mut out = Mat::default();
        match self {
            Self::Raw | Self::Neck => {
                imgproc::gaussian_blur_def(mask, &mut out, Size::new(3, 3), 0.0)?;
            }
            Self::Jaw => {
                let mut dilated = Mat::default();
                let dilate_kernel = imgproc::get_structuring_element_def(imgproc::MORPH_RECT, Size::new(3, 3))?;
                imgproc::dilate_def(mask, &mut dilated, &dilate_kernel)?;

                let mut eroded = Mat::default();
                let erode_kernel = imgproc::get_structuring_element(
                    imgproc::MORPH_RECT,
                    Size::new(2, 2),
                    Point::new(-1, -1),
                )?;
                imgproc::erode_def(&dilated, &mut eroded, &erode_kernel)?;

                imgproc::gaussian_blur_def(&eroded, &mut out, Size::new(5, 5), 0.0)?;
            }
        }
        Ok(out)
    }
}

impl std::str::FromStr for MaskMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "neck" => Ok(Self::Neck),
            "jaw" => Ok(Self::Jaw),
            _ => Err(Error::ConfigError(format!("Unknown mask mode: {s}"))),
        }
    }
}

/// 255 where the arg-max class of a `(1, C, H, W)` score map is in `classes`
///
/// # Errors
///
/// Returns an error for unexpected score-map shapes
pub fn class_mask(scores: &ArrayView4<'_, f32>, classes: &[u8]) -> Result<Mat> {
    let (batch, channels, height, width) = scores.dim();
    if batch < 1 || channels != PARSING_NUM_CLASSES || height == 0 || width == 0 {
        return Err(Error::ModelOutputError(format!(
            "Expected (1, {PARSING_NUM_CLASSES}, H, W) parsing scores, got {:?}",
            scores.shape()
        )));
    }

    let mut mask = solid_mask(usize_to_i32(width)?, usize_to_i32(height)?, 0)?;
    let pixels = mask.data_typed_mut::<u8>()?;
    for (index, pixel) in pixels.iter_mut().enumerate() {
        let (row, col) = (index / width, index % width);
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for c in 0..channels {
            let s = scores[[0, c, row, col]];
            if s > best_score {
                best_score = s;
                best = c;
            }
        }
        if classes.iter().any(|&c| usize::from(c) == best) {
            *pixel = 255;
        }
    }
    Ok(mask)
}

/// BiSeNet face parser producing blend masks
pub struct FaceParser {
    model: SharedModel,
    pool: BufferPool,
}

impl FaceParser {
    /// Wrap a 19-class parsing model
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        log::info!("Initializing FaceParser with model '{}'", model.lock().name());
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

    /// Blend mask for `frame` at the frame's own size
    ///
    /// # Errors
    ///
    /// Returns an error for invalid frames or model failures
    pub fn parse(&mut self, frame: &Mat, mode: MaskMode) -> Result<Mat> {
        validate_frame(frame)?;
        let resized = resize_frame(frame, PARSING_INPUT_SIZE, PARSING_INPUT_SIZE, Interpolation::Bilinear)?;

        let side = i32_to_usize(PARSING_INPUT_SIZE)?;
        let tensor = self.pool.nchw(0, [1, 3, side, side]);
        frame_to_nchw_into(&resized, &Normalization::imagenet(IMAGENET_MEAN, IMAGENET_STD), tensor)?;

        let mask = {
            let mut model = self.model.lock();
            let outputs = model.run(&[tensor.view().into_dyn()])?;
            let scores = outputs
                .first()
                .ok_or_else(|| Error::ModelOutputError("Parsing model produced no outputs".to_string()))?
                .view()
                .into_dimensionality::<Ix4>()
                .map_err(|e| Error::ModelDataFormatError(format!("Parsing output is not NCHW: {e}")))?;
            class_mask(&scores, mode.classes())?
        };

        let smoothed = mode.smooth(&mask)?;
        resize_frame(&smoothed, frame.cols(), frame.rows(), Interpolation::Bilinear)
    }
}
