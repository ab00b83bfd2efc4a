//! Mask preparation and compositing for the lip-sync path.
//!
//! Each avatar frame gets a "face-large" crop around its face box, a parsing
//! mask restricted to the face box with the upper face cut away, and a blurred
//! copy of that mask used to blend generated mouths back in.

use crate::face_analysis::FaceAnalysis;
use crate::face_parsing::MaskMode;
use crate::geometry::{blend_with_mask, crop_frame, paste_region, resize_frame, FaceBox, Interpolation};
use crate::utils::image_conversion::{solid_mask, validate_frame};
use crate::utils::safe_cast::{f32_to_i32_clamp, i32_to_usize};
use crate::{Error, Result};
use opencv::core::{Mat, Point2f, Rect, Size};
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

/// Landmark whose height splits the face in the hybrid face box
pub const HALF_FACE_INDEX: usize = 66;
/// Horizontal enlargement of the landmark extent
pub const FACE_WIDTH_EXPAND: f32 = 1.05;
/// Share of the detector box kept, measured from its bottom, when landmarks give no usable box
pub const FALLBACK_HEIGHT_RATIO: f32 = 0.9;

/// Crop geometry revision of the lip-sync models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginVersion {
    /// Face box extended downwards to include the chin
    #[default]
    V15,
}

impl MarginVersion {
    /// Pixels added below the face box
    #[must_use]
    pub const fn extra_margin(self) -> i32 {
        match self {
            Self::V15 => 10,
        }
    }

    /// Extend the face box, staying inside a frame of `frame_height` rows
    #[must_use]
    pub fn adjust(self, face_box: Rect, frame_height: i32) -> Rect {
        let y2 = (face_box.y + face_box.height + self.extra_margin()).min(frame_height);
        Rect::new(face_box.x, face_box.y, face_box.width, (y2 - face_box.y).max(1))
    }
}

/// Face box from the lower half of the landmarks, falling back to the detector box.
///
/// The landmark box spans the landmarks horizontally (widened by
/// [`FACE_WIDTH_EXPAND`]) and vertically from the lowest landmark up to the
/// same distance above landmark [`HALF_FACE_INDEX`] shifted by `bbox_shift`.
/// The result is clamped to the frame and truncated to whole pixels.
///
/// # Errors
///
/// Returns an error if neither source yields a box with positive extent
pub fn hybrid_face_box(
    landmarks: &[Point2f],
    detector_box: &FaceBox,
    bbox_shift: i32,
    frame_width: i32,
    frame_height: i32,
) -> Result<Rect> {
    let from_landmarks = landmarks.get(HALF_FACE_INDEX).map(|half| {
        let half_y = half.y + bbox_shift as f32;
        let max_y = landmarks.iter().map(|p| p.y).fold(f32::MIN, f32::max);
        let min_x = landmarks.iter().map(|p| p.x).fold(f32::MAX, f32::min);
        let max_x = landmarks.iter().map(|p| p.x).fold(f32::MIN, f32::max);
        let cx = (min_x + max_x) / 2.0;
        let half_width = (max_x - min_x) * FACE_WIDTH_EXPAND / 2.0;
        FaceBox::new(cx - half_width, half_y - (max_y - half_y), cx + half_width, max_y)
    });

    let chosen = match from_landmarks {
        Some(b) if b.width() > 0.0 && b.height() > 0.0 => b,
        _ => {
            log::debug!("Landmark face box unusable, falling back to the detector box");
            let h = detector_box.height();
            FaceBox::new(
                detector_box.x1,
                detector_box.y2 - h * FALLBACK_HEIGHT_RATIO,
                detector_box.x2,
                detector_box.y2,
            )
        }
    };

    let x1 = f32_to_i32_clamp(chosen.x1, 0, frame_width);
    let y1 = f32_to_i32_clamp(chosen.y1, 0, frame_height);
    let x2 = f32_to_i32_clamp(chosen.x2, 0, frame_width);
    let y2 = f32_to_i32_clamp(chosen.y2, 0, frame_height);
    FaceBox::new(x1 as f32, y1 as f32, x2 as f32, y2 as f32).validate()?;
    Ok(Rect::new(x1, y1, x2 - x1, y2 - y1))
}

/// Square box centred on the face box with half side `int(max(w, h) / 2 × expand)`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn crop_box(face_box: Rect, expand: f32) -> Rect {
    let cx = face_box.x + face_box.width / 2;
    let cy = face_box.y + face_box.height / 2;
    let s = ((face_box.width.max(face_box.height) / 2) as f32 * expand) as i32;
    Rect::new(cx - s, cy - s, 2 * s, 2 * s)
}

/// Clip a rectangle to a `width × height` frame
#[must_use]
pub fn clamp_rect(rect: Rect, width: i32, height: i32) -> Rect {
    let x1 = rect.x.clamp(0, width);
    let y1 = rect.y.clamp(0, height);
    let x2 = (rect.x + rect.width).clamp(0, width);
    let y2 = (rect.y + rect.height).clamp(0, height);
    Rect::new(x1, y1, x2 - x1, y2 - y1)
}

/// Odd Gaussian kernel size proportional to the crop width
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn blur_kernel_size(width: i32) -> i32 {
    ((0.1 * width as f32 / 2.0).floor() * 2.0) as i32 + 1
}

/// Precomputed compositing data of one avatar frame
#[derive(Debug)]
pub struct BlendMaterial {
    /// Face box (after margin adjustment) in frame coordinates
    pub face_box: Rect,
    /// Expanded crop box in frame coordinates
    pub crop_box: Rect,
    /// Frame pixels inside the crop box
    pub face_large: Mat,
    /// Parsing mask of `face_large`
    pub parsing_mask: Mat,
    /// Blurred blend mask, same size as `face_large`
    pub mask: Mat,
}

/// Blend mask built from a parsing mask of the face-large crop.
///
/// Only the face-box part of the parsing mask is kept, rows above
/// `upper_ratio` of the crop height are cleared, then the mask is blurred.
///
/// # Errors
///
/// Returns an error if the face box does not lie inside the crop
pub fn build_blend_mask(parsing_mask: &Mat, face_in_crop: Rect, upper_ratio: f32) -> Result<Mat> {
    let (width, height) = (parsing_mask.cols(), parsing_mask.rows());
    let small = crop_frame(parsing_mask, face_in_crop)?;
    let mut full = solid_mask(width, height, 0)?;
    paste_region(&mut full, &small, face_in_crop.x, face_in_crop.y)?;

    #[allow(clippy::cast_possible_truncation)]
    let top_boundary = ((height as f32 * upper_ratio) as i32).clamp(0, height);
    let row_bytes = i32_to_usize(width)?;
    let cleared = i32_to_usize(top_boundary)? * row_bytes;
    full.data_bytes_mut()?[..cleared].fill(0);

    let k = blur_kernel_size(width);
    let mut blurred = Mat::default();
    imgproc::gaussian_blur_def(&full, &mut blurred, Size::new(k, k), 0.0)?;
    Ok(blurred)
}

/// Crop, parse and mask one avatar frame
///
/// # Errors
///
/// Returns an error for invalid frames, boxes outside the frame or parser failures
pub fn prepare_material(
    frame: &Mat,
    face_box: Rect,
    analysis: &FaceAnalysis,
    mode: MaskMode,
    upper_ratio: f32,
    expand: f32,
) -> Result<BlendMaterial> {
    validate_frame(frame)?;
    let crop_box = clamp_rect(crop_box(face_box, expand), frame.cols(), frame.rows());
    let face_in_crop = Rect::new(
        face_box.x - crop_box.x,
        face_box.y - crop_box.y,
        face_box.width,
        face_box.height,
    );
    if crop_box.width <= 0 || crop_box.height <= 0 {
        return Err(Error::InvalidInput(format!("Face box {face_box:?} outside frame")));
    }

    let face_large = crop_frame(frame, crop_box)?;
    let parsing_mask = analysis.generate_parsing_mask(&face_large, mode)?;
    let mask = build_blend_mask(&parsing_mask, face_in_crop, upper_ratio)?;

    Ok(BlendMaterial {
        face_box,
        crop_box,
        face_large,
        parsing_mask,
        mask,
    })
}

/// Paste a generated face into the avatar frame using its precomputed material
///
/// # Errors
///
/// Returns an error if the frame or generated face is invalid
pub fn blend_generated(frame: &Mat, generated_face: &Mat, material: &BlendMaterial) -> Result<Mat> {
    validate_frame(frame)?;
    let face_box = material.face_box;
    let resized = resize_frame(generated_face, face_box.width, face_box.height, Interpolation::Bilinear)?;

    let mut patched = material.face_large.try_clone()?;
    paste_region(
        &mut patched,
        &resized,
        face_box.x - material.crop_box.x,
        face_box.y - material.crop_box.y,
    )?;
    let blended = blend_with_mask(&material.face_large, &patched, &material.mask)?;

    let mut out = frame.try_clone()?;
    paste_region(&mut out, &blended, material.crop_box.x, material.crop_box.y)?;
    Ok(out)
}
