use super::warp::affine_transform;
use super::Affine2;
use crate::utils::image_conversion::{continuous, validate_frame, validate_mask};
use crate::utils::safe_cast::f32_to_u8;
use crate::{Error, Result};
use opencv::core::{Mat, Vec3b};
use opencv::prelude::*;

/// Per-pixel alpha blend `original × (1 − m) + generated × m` with `m = mask / 255`.
///
/// A zero mask reproduces `original` exactly and a full mask reproduces
/// `generated` exactly.
///
/// # Errors
///
/// Returns `InvalidInput` if the three images differ in size or type
pub fn blend_with_mask(original: &Mat, generated: &Mat, mask: &Mat) -> Result<Mat> {
    validate_frame(original)?;
    validate_frame(generated)?;
    validate_mask(mask)?;
    let size = original.size()?;
    if generated.size()? != size || mask.size()? != size {
        return Err(Error::InvalidInput(format!(
            "Blend inputs differ in size: original {size:?}, generated {:?}, mask {:?}",
            generated.size()?,
            mask.size()?
        )));
    }

    let generated = continuous(generated)?;
    let mask = continuous(mask)?;
    let mut out = original.try_clone()?;
    let gen_pixels = generated.data_typed::<Vec3b>()?;
    let weights = mask.data_typed::<u8>()?;

    for ((dst, src), &w) in out.data_typed_mut::<Vec3b>()?.iter_mut().zip(gen_pixels).zip(weights) {
        match w {
            0 => {}
            255 => *dst = *src,
            _ => {
                let m = f32::from(w) / 255.0;
                for ch in 0..3 {
                    dst[ch] = f32_to_u8(f32::from(dst[ch]) * (1.0 - m) + f32::from(src[ch]) * m);
                }
            }
        }
    }
    Ok(out)
}

/// Warp a generated crop into the original image through `m_c2o` and blend it
/// with a mask already expressed in original-image coordinates
///
/// # Errors
///
/// Returns an error if the warp fails or the mask does not match the original size
pub fn paste_back(crop_output: &Mat, m_c2o: &Affine2, original: &Mat, mask: &Mat) -> Result<Mat> {
    validate_frame(original)?;
    let warped = affine_transform(crop_output, m_c2o, original.cols(), original.rows())?;
    blend_with_mask(original, &warped, mask)
}
