//! Conversions between OpenCV frames and NCHW `f32` tensors.
//!
//! Frames are `CV_8UC3` Mats in RGB order with packed rows; masks are
//! `CV_8UC1` Mats where 255 means fully selected.

use crate::{Error, Result};
use ndarray::{Array4, ArrayView4, ArrayViewD, Ix4};
use opencv::core::{Mat, Scalar, Vec3b, CV_8UC1, CV_8UC3};
use opencv::prelude::*;

/// Per-channel normalization `(pixel * scale - mean) / std` applied while packing a tensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    /// Multiplier applied to the raw 0..255 value first
    pub scale: f32,
    /// Subtracted after scaling, per RGB channel
    pub mean: [f32; 3],
    /// Divisor applied last, per RGB channel
    pub std: [f32; 3],
}

impl Normalization {
    /// Raw pixel values
    pub const IDENTITY: Self = Self {
        scale: 1.0,
        mean: [0.0; 3],
        std: [1.0; 3],
    };

    /// Values mapped to [0, 1]
    pub const UNIT: Self = Self {
        scale: 1.0 / 255.0,
        mean: [0.0; 3],
        std: [1.0; 3],
    };

    /// Values mapped to [-1, 1]
    pub const SIGNED: Self = Self {
        scale: 1.0 / 255.0,
        mean: [0.5; 3],
        std: [0.5; 3],
    };

    /// `(pixel - offset) / scale` on every channel, as SCRFD expects
    #[must_use]
    pub const fn centered(offset: f32, scale: f32) -> Self {
        Self {
            scale: 1.0,
            mean: [offset; 3],
            std: [scale; 3],
        }
    }

    /// ImageNet-style normalization on [0, 1] values
    #[must_use]
    pub const fn imagenet(mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            scale: 1.0 / 255.0,
            mean,
            std,
        }
    }

    #[inline]
    fn apply(&self, value: u8, channel: usize) -> f32 {
        (f32::from(value) * self.scale - self.mean[channel]) / self.std[channel]
    }
}

/// Build a frame from a packed RGB buffer supplied by an external pixel source
///
/// # Errors
///
/// Returns an error if the dimensions are zero or do not match the buffer length
pub fn from_rgb(width: i32, height: i32, rgb: &[u8]) -> Result<Mat> {
    if width <= 0 || height <= 0 {
        return Err(Error::InvalidInput(format!("Invalid frame dimensions: {width}x{height}")));
    }
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(Error::InvalidInput(format!(
            "Pixel buffer has {} bytes, expected {expected} for {width}x{height}",
            rgb.len()
        )));
    }
    let mut frame = Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(0.0))?;
    frame.data_bytes_mut()?.copy_from_slice(rgb);
    Ok(frame)
}

/// Create a frame filled with one RGB colour
///
/// # Errors
///
/// Returns an error if OpenCV cannot allocate the frame
pub fn solid_frame(width: i32, height: i32, rgb: [u8; 3]) -> Result<Mat> {
    Ok(Mat::new_rows_cols_with_default(
        height,
        width,
        CV_8UC3,
        Scalar::new(f64::from(rgb[0]), f64::from(rgb[1]), f64::from(rgb[2]), 0.0),
    )?)
}

/// Create a single-channel mask filled with `value`
///
/// # Errors
///
/// Returns an error if OpenCV cannot allocate the mask
pub fn solid_mask(width: i32, height: i32, value: u8) -> Result<Mat> {
    Ok(Mat::new_rows_cols_with_default(
        height,
        width,
        CV_8UC1,
        Scalar::all(f64::from(value)),
    )?)
}

/// Reject empty frames and frames that are not 8-bit, 3-channel
///
/// # Errors
///
/// Returns `InvalidInput` describing the problem
pub fn validate_frame(frame: &Mat) -> Result<()> {
    if frame.empty() || frame.rows() <= 0 || frame.cols() <= 0 {
        return Err(Error::InvalidInput("Empty frame".to_string()));
    }
    if frame.typ() != CV_8UC3 {
        return Err(Error::InvalidInput(format!(
            "Expected an 8-bit 3-channel frame, got type {}",
            frame.typ()
        )));
    }
    Ok(())
}

/// Reject empty masks and masks that are not 8-bit single channel
///
/// # Errors
///
/// Returns `InvalidInput` describing the problem
pub fn validate_mask(mask: &Mat) -> Result<()> {
    if mask.empty() || mask.typ() != CV_8UC1 {
        return Err(Error::InvalidInput(format!(
            "Expected a non-empty 8-bit single-channel mask, got type {}",
            mask.typ()
        )));
    }
    Ok(())
}

/// Borrow the packed pixels of a frame, copying first if the Mat is a non-continuous view
///
/// # Errors
///
/// Returns an error if the frame is invalid
pub fn continuous(frame: &Mat) -> Result<std::borrow::Cow<'_, Mat>> {
    if frame.is_continuous() {
        Ok(std::borrow::Cow::Borrowed(frame))
    } else {
        Ok(std::borrow::Cow::Owned(frame.try_clone()?))
    }
}

/// Pack a frame into a `(1, 3, H, W)` tensor, reusing `tensor` when its shape matches
///
/// # Errors
///
/// Returns an error if the frame is invalid or the tensor shape disagrees with the frame
pub fn frame_to_nchw_into(frame: &Mat, norm: &Normalization, tensor: &mut Array4<f32>) -> Result<()> {
    validate_frame(frame)?;
    let height = frame.rows() as usize;
    let width = frame.cols() as usize;
    if tensor.shape() != [1, 3, height, width] {
        return Err(Error::ModelDataFormatError(format!(
            "Tensor shape {:?} does not match frame {width}x{height}",
            tensor.shape()
        )));
    }

    let packed = continuous(frame)?;
    let pixels = packed.data_typed::<Vec3b>()?;
    for (index, pixel) in pixels.iter().enumerate() {
        let row = index / width;
        let col = index % width;
        for ch in 0..3 {
            tensor[[0, ch, row, col]] = norm.apply(pixel[ch], ch);
        }
    }
    Ok(())
}

/// Pack a frame into a freshly allocated `(1, 3, H, W)` tensor
///
/// # Errors
///
/// Returns an error if the frame is invalid
pub fn frame_to_nchw(frame: &Mat, norm: &Normalization) -> Result<Array4<f32>> {
    let mut tensor = Array4::zeros((1, 3, frame.rows().max(0) as usize, frame.cols().max(0) as usize));
    frame_to_nchw_into(frame, norm, &mut tensor)?;
    Ok(tensor)
}

/// Turn a `(1, 3, H, W)` tensor of values in [0, 1] back into a frame
///
/// # Errors
///
/// Returns an error if the tensor is not 4-D with three channels
pub fn unit_nchw_to_frame(tensor: &ArrayViewD<'_, f32>) -> Result<Mat> {
    nchw_to_frame(tensor, |v| v.clamp(0.0, 1.0) * 255.0)
}

/// Turn a `(1, 3, H, W)` tensor of values in [-1, 1] back into a frame
///
/// # Errors
///
/// Returns an error if the tensor is not 4-D with three channels
pub fn signed_nchw_to_frame(tensor: &ArrayViewD<'_, f32>) -> Result<Mat> {
    nchw_to_frame(tensor, |v| ((v + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0)
}

fn nchw_to_frame(tensor: &ArrayViewD<'_, f32>, denormalize: impl Fn(f32) -> f32) -> Result<Mat> {
    let view: ArrayView4<'_, f32> = tensor
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::ModelDataFormatError(format!("Expected NCHW output: {e}")))?;
    let (batch, channels, height, width) = view.dim();
    if batch < 1 || channels != 3 || height == 0 || width == 0 {
        return Err(Error::ModelDataFormatError(format!(
            "Expected (1, 3, H, W) output, got {:?}",
            view.shape()
        )));
    }

    let rows = i32::try_from(height).map_err(|_| Error::InvalidInput("Output too tall".into()))?;
    let cols = i32::try_from(width).map_err(|_| Error::InvalidInput("Output too wide".into()))?;
    let mut frame = Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0))?;
    let pixels = frame.data_typed_mut::<Vec3b>()?;
    for (index, pixel) in pixels.iter_mut().enumerate() {
        let row = index / width;
        let col = index % width;
        for ch in 0..3 {
            pixel[ch] = denormalize(view[[0, ch, row, col]]).round() as u8;
        }
    }
    Ok(frame)
}

/// Copy a frame's pixels out as packed RGB bytes
///
/// # Errors
///
/// Returns an error if the frame is invalid
pub fn to_rgb_bytes(frame: &Mat) -> Result<Vec<u8>> {
    validate_frame(frame)?;
    Ok(continuous(frame)?.data_bytes()?.to_vec())
}
