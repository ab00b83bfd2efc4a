use super::Affine2;
use crate::{Error, Result};
use opencv::core::{Mat, Rect, Scalar, Size, BORDER_CONSTANT};
use opencv::imgproc;
use opencv::prelude::*;

/// Resampling filter for resizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Bilinear
    #[default]
    Bilinear,
    /// Nearest neighbour
    Nearest,
    /// Pixel-area averaging, best for downscaling
    Area,
    /// 8×8 Lanczos
    Lanczos,
}

impl Interpolation {
    const fn flag(self) -> i32 {
        match self {
            Self::Bilinear => imgproc::INTER_LINEAR,
            Self::Nearest => imgproc::INTER_NEAREST,
            Self::Area => imgproc::INTER_AREA,
            Self::Lanczos => imgproc::INTER_LANCZOS4,
        }
    }
}

fn ensure_non_empty(image: &Mat) -> Result<()> {
    if image.empty() || image.rows() <= 0 || image.cols() <= 0 {
        return Err(Error::InvalidInput("Empty image".to_string()));
    }
    Ok(())
}

fn ensure_size(width: i32, height: i32) -> Result<Size> {
    if width <= 0 || height <= 0 {
        return Err(Error::InvalidInput(format!("Invalid output size {width}x{height}")));
    }
    Ok(Size::new(width, height))
}

/// Bilinear warp of a frame or mask by `m`, which maps input coordinates to
/// output coordinates. Pixels outside the input are black.
///
/// # Errors
///
/// Returns an error for empty input, a non-positive output size or OpenCV failures
pub fn affine_transform(image: &Mat, m: &Affine2, out_width: i32, out_height: i32) -> Result<Mat> {
    ensure_non_empty(image)?;
    let size = ensure_size(out_width, out_height)?;
    let mut out = Mat::default();
    imgproc::warp_affine(
        image,
        &mut out,
        &m.to_mat()?,
        size,
        imgproc::INTER_LINEAR,
        BORDER_CONSTANT,
        Scalar::all(0.0),
    )?;
    Ok(out)
}

/// Copy out a region; `rect` must lie fully inside the image
///
/// # Errors
///
/// Returns `InvalidInput` if the region is empty or leaves the image
pub fn crop_frame(image: &Mat, rect: Rect) -> Result<Mat> {
    ensure_non_empty(image)?;
    if rect.width <= 0
        || rect.height <= 0
        || rect.x < 0
        || rect.y < 0
        || rect.x + rect.width > image.cols()
        || rect.y + rect.height > image.rows()
    {
        return Err(Error::InvalidInput(format!(
            "Crop {rect:?} outside {}x{} image",
            image.cols(),
            image.rows()
        )));
    }
    Ok(Mat::roi(image, rect)?.try_clone()?)
}

/// Resize to exactly `width × height`
///
/// # Errors
///
/// Returns an error for empty input or a non-positive size
pub fn resize_frame(image: &Mat, width: i32, height: i32, interpolation: Interpolation) -> Result<Mat> {
    ensure_non_empty(image)?;
    let size = ensure_size(width, height)?;
    if image.cols() == width && image.rows() == height {
        return Ok(image.try_clone()?);
    }
    let mut out = Mat::default();
    imgproc::resize(image, &mut out, size, 0.0, 0.0, interpolation.flag())?;
    Ok(out)
}

/// Place `image` at the top-left of a black `size × size` canvas
///
/// # Errors
///
/// Returns an error if the image does not fit
pub fn pad_to_canvas(image: &Mat, size: i32) -> Result<Mat> {
    ensure_non_empty(image)?;
    let mut canvas = Mat::new_rows_cols_with_default(size, size, image.typ(), Scalar::all(0.0))?;
    paste_region(&mut canvas, image, 0, 0)?;
    Ok(canvas)
}

/// Overwrite the region of `dst` starting at `(x, y)` with `src`
///
/// # Errors
///
/// Returns `InvalidInput` if `src` does not fit or the types differ
pub fn paste_region(dst: &mut Mat, src: &Mat, x: i32, y: i32) -> Result<()> {
    ensure_non_empty(src)?;
    if src.typ() != dst.typ() {
        return Err(Error::InvalidInput(format!(
            "Cannot paste type {} into type {}",
            src.typ(),
            dst.typ()
        )));
    }
    let rect = Rect::new(x, y, src.cols(), src.rows());
    if x < 0 || y < 0 || x + rect.width > dst.cols() || y + rect.height > dst.rows() {
        return Err(Error::InvalidInput(format!(
            "Region {rect:?} outside {}x{} destination",
            dst.cols(),
            dst.rows()
        )));
    }
    let mut roi = dst.roi_mut(rect)?;
    src.copy_to(&mut roi)?;
    Ok(())
}
