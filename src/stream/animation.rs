//! Portrait animation: one source face driven by a sequence of frames.

use super::exact_len;
use super::queue::OutputQueue;
use crate::constants::MOTION_INPUT_SIZE;
use crate::cropping::{crop_image, CropInfo};
use crate::face_analysis::FaceAnalysis;
use crate::geometry::{affine_transform, paste_back, resize_frame, AlignParams, Interpolation};
use crate::motion::{transform_keypoints, AppearanceExtractor, MotionTarget, PredictionState, StitchingRefiner, Warper};
use crate::pose_estimation::{MotionExtractor, MotionInfo};
use crate::runtime::{end_all, start_all, ModelFactory, ModelKind, SharedModel};
use crate::utils::image_conversion::{solid_mask, validate_frame, validate_mask};
use crate::{Error, Result};
use ndarray::{Array2, ArrayD};
use opencv::core::{Mat, Point, Point2f, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// Behaviour switches of the animation pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationSettings {
    /// Alignment used for both source and driving crops
    pub crop: AlignParams,
    /// Refine driving keypoints with the stitching network
    pub use_stitching: bool,
    /// Apply driving motion relative to the first driving frame
    pub relative_motion: bool,
    /// Composite the rendered crop back into the source image
    pub paste_back: bool,
}

impl Default for AnimationSettings {
    fn default() -> Self {
        Self {
            crop: AlignParams::PORTRAIT,
            use_stitching: true,
            relative_motion: true,
            paste_back: true,
        }
    }
}

/// Filled, feathered ellipse used as the paste-back mask in crop space
///
/// # Errors
///
/// Returns an error for a non-positive size or OpenCV failures
pub fn face_mask_template(size: i32) -> Result<Mat> {
    if size <= 0 {
        return Err(Error::InvalidInput(format!("Invalid mask template size {size}")));
    }
    let mut mask = solid_mask(size, size, 0)?;
    let half = size / 2;
    imgproc::ellipse(
        &mut mask,
        Point::new(half, half),
        Size::new(size * 3 / 8, size * 9 / 20),
        0.0,
        0.0,
        360.0,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )?;
    let k = (size / 16) | 1;
    let mut feathered = Mat::default();
    imgproc::gaussian_blur_def(&mask, &mut feathered, Size::new(k, k), 0.0)?;
    Ok(feathered)
}

/// Everything derived once from the source portrait
pub struct SourceState {
    /// Source image
    pub frame: Mat,
    /// Aligned source crop
    pub crop: CropInfo,
    /// Source motion
    pub motion: MotionInfo,
    /// Appearance feature volume
    pub features: ArrayD<f32>,
    /// Source keypoints after the source's own motion
    pub keypoints: Array2<f32>,
    /// Mask template warped into source-image coordinates
    pub paste_mask: Mat,
}

/// Drives a source portrait with the pose and expression of driving frames
pub struct PortraitAnimator {
    analysis: Arc<FaceAnalysis>,
    motion: MotionExtractor,
    appearance: AppearanceExtractor,
    stitching: StitchingRefiner,
    warper: Warper,
    settings: AnimationSettings,
    mask_template: Option<Mat>,
    source: Option<SourceState>,
    state: PredictionState,
}

impl PortraitAnimator {
    /// Assemble from already wrapped models
    #[must_use]
    pub fn new(
        analysis: Arc<FaceAnalysis>,
        motion: MotionExtractor,
        appearance: AppearanceExtractor,
        stitching: StitchingRefiner,
        warper: Warper,
        settings: AnimationSettings,
    ) -> Self {
        Self {
            analysis,
            motion,
            appearance,
            stitching,
            warper,
            settings,
            mask_template: None,
            source: None,
            state: PredictionState::default(),
        }
    }

    /// Create the animation models through `factory`
    ///
    /// # Errors
    ///
    /// Returns an error if an eagerly loaded model fails to load
    pub fn from_factory(factory: &ModelFactory, analysis: Arc<FaceAnalysis>, settings: AnimationSettings) -> Result<Self> {
        Ok(Self::new(
            analysis,
            MotionExtractor::new(factory.create(ModelKind::MotionExtractor)?),
            AppearanceExtractor::new(factory.create(ModelKind::AppearanceExtractor)?),
            StitchingRefiner::new(factory.create(ModelKind::Stitching)?),
            Warper::new(factory.create(ModelKind::Warping)?),
            settings,
        ))
    }

    /// Replace the procedural paste-back mask with a crop-space mask
    ///
    /// # Errors
    ///
    /// Returns an error if `mask` is not a single-channel 8-bit image
    pub fn with_mask_template(mut self, mask: Mat) -> Result<Self> {
        validate_mask(&mask)?;
        let size = self.settings.crop.dsize;
        self.mask_template = Some(resize_frame(&mask, size, size, Interpolation::Bilinear)?);
        Ok(self)
    }

    /// Active settings
    #[must_use]
    pub fn settings(&self) -> &AnimationSettings {
        &self.settings
    }

    /// Source state, once `setup` succeeded
    #[must_use]
    pub fn source(&self) -> Option<&SourceState> {
        self.source.as_ref()
    }

    /// Tracking state of the current driving sequence
    #[must_use]
    pub fn prediction_state(&self) -> &PredictionState {
        &self.state
    }

    fn models(&self) -> [&SharedModel; 4] {
        [
            self.motion.model(),
            self.appearance.model(),
            self.stitching.model(),
            self.warper.model(),
        ]
    }

    /// Load every model used by the pipeline
    ///
    /// # Errors
    ///
    /// Returns the first load failure
    pub fn start_session(&self) -> Result<()> {
        self.analysis.start_session()?;
        if let Err(e) = start_all(&self.models()) {
            self.analysis.end_session();
            return Err(e);
        }
        Ok(())
    }

    /// End the session on every model
    pub fn end_session(&self) {
        end_all(&self.models());
        self.analysis.end_session();
    }

    /// Dense landmarks of the primary face: detection plus refinement
    fn detect_landmarks(&self, frame: &Mat) -> Result<Vec<Point2f>> {
        let detection = self.analysis.detect_primary(frame)?;
        self.analysis.refine_landmarks(frame, &detection.landmarks)
    }

    /// Analyse the source portrait and reset the driving state.
    ///
    /// Runs inside its own model session.
    ///
    /// # Errors
    ///
    /// Returns an error if no face is found or a model fails
    pub fn setup(&mut self, source: &Mat) -> Result<()> {
        validate_frame(source)?;
        self.start_session()?;
        let result = self.analyse_source(source);
        self.end_session();
        let state = result?;
        self.source = Some(state);
        self.state.reset();
        Ok(())
    }

    fn analyse_source(&mut self, source: &Mat) -> Result<SourceState> {
        let started = Instant::now();
        let landmarks = self.detect_landmarks(source)?;
        let crop = crop_image(source, &landmarks, &self.settings.crop, MOTION_INPUT_SIZE)?;
        let motion = self.motion.extract(&crop.crop_model)?;
        let features = self.appearance.extract(&crop.crop_model)?;
        let keypoints = transform_keypoints(
            &motion.keypoints,
            &motion.rotation,
            &motion.expression,
            motion.scale,
            &motion.translation,
        );

        let template = match &self.mask_template {
            Some(mask) => mask.try_clone()?,
            None => face_mask_template(self.settings.crop.dsize)?,
        };
        let paste_mask = affine_transform(&template, crop.m_c2o(), source.cols(), source.rows())?;

        log::info!(
            "Source ready in {:.1} ms (pitch {:.1}, yaw {:.1}, roll {:.1})",
            started.elapsed().as_secs_f64() * 1000.0,
            motion.pitch,
            motion.yaw,
            motion.roll
        );
        Ok(SourceState {
            frame: source.try_clone()?,
            crop,
            motion,
            features,
            keypoints,
            paste_mask,
        })
    }

    /// Landmarks of a driving frame: full detection on the first frame,
    /// refinement from the previous estimate afterwards
    fn track(&self, frame: &Mat) -> Result<Vec<Point2f>> {
        match &self.state.landmarks {
            None => self.detect_landmarks(frame),
            Some(previous) => self.analysis.refine_landmarks(frame, previous).map_err(|e| {
                log::warn!("Landmark tracking failed: {e}");
                e
            }),
        }
    }

    /// Render the source with the motion of one driving frame
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` before `setup`, otherwise detection or model errors
    pub fn process(&mut self, driving: &Mat) -> Result<Mat> {
        validate_frame(driving)?;
        if self.source.is_none() {
            return Err(Error::InvalidInput("No source portrait; call setup first".to_string()));
        }

        let landmarks = self.track(driving)?;
        let crop = crop_image(driving, &landmarks, &self.settings.crop, MOTION_INPUT_SIZE)?;
        let motion = self.motion.extract(&crop.crop_model)?;
        let reference = self.state.reference.get_or_insert_with(|| motion.clone());

        let Some(source) = self.source.as_ref() else {
            return Err(Error::InvalidInput("No source portrait; call setup first".to_string()));
        };
        let target = if self.settings.relative_motion {
            MotionTarget::relative(&source.motion, &motion, reference)
        } else {
            MotionTarget::absolute(&motion)
        };
        let mut driving_kp = target.driving_keypoints(&source.motion.keypoints);
        if self.settings.use_stitching {
            driving_kp = self.stitching.stitch(&source.keypoints, &driving_kp)?;
        }

        let rendered = self.warper.render(&source.features, &source.keypoints, &driving_kp)?;
        let size = self.settings.crop.dsize;
        let rendered = resize_frame(&rendered, size, size, Interpolation::Bilinear)?;
        let output = if self.settings.paste_back {
            paste_back(&rendered, source.crop.m_c2o(), &source.frame, &source.paste_mask)?
        } else {
            rendered
        };

        self.state.landmarks = Some(landmarks);
        Ok(output)
    }

    /// Animate every driving frame in order, pushing results to `queue`.
    ///
    /// Each call starts a new driving sequence: its first frame is detected
    /// from scratch and becomes the motion reference. Returns the number of
    /// frames produced. The queue is finished on success and when the
    /// consumer cancels; on error it is left for the caller to fail.
    ///
    /// # Errors
    ///
    /// Returns the first detection or model error
    pub fn run<I>(&mut self, driving: I, queue: &OutputQueue) -> Result<usize>
    where
        I: IntoIterator<Item = Mat>,
    {
        let driving = driving.into_iter();
        if let Some(total) = exact_len(&driving) {
            queue.set_total_expected(total);
        }
        self.state.reset();
        self.start_session()?;
        let result = self.drive(driving, queue);
        self.end_session();
        match result {
            Ok(count) => {
                queue.finish();
                log::info!("Animation finished: {count} frames");
                Ok(count)
            }
            Err(Error::Cancelled) => {
                queue.finish();
                log::info!("Animation cancelled after {} frames", queue.produced());
                Ok(queue.produced())
            }
            Err(e) => Err(e),
        }
    }

    fn drive<I>(&mut self, driving: I, queue: &OutputQueue) -> Result<usize>
    where
        I: IntoIterator<Item = Mat>,
    {
        let mut count = 0;
        for frame in driving {
            if queue.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let started = Instant::now();
            let output = self.process(&frame)?;
            queue.push(output)?;
            count += 1;
            log::debug!(
                "Frame {count} animated in {:.1} ms",
                started.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_template_is_centred() {
        let mask = face_mask_template(64).unwrap();
        assert_eq!(mask.rows(), 64);
        assert_eq!(mask.cols(), 64);
        let pixels = mask.data_bytes().unwrap();
        assert_eq!(pixels[32 * 64 + 32], 255);
        assert_eq!(pixels[0], 0);
        assert_eq!(pixels[64 * 64 - 1], 0);
    }

    #[test]
    fn test_mask_template_rejects_empty() {
        assert!(face_mask_template(0).is_err());
    }

    #[test]
    fn test_default_settings() {
        let settings = AnimationSettings::default();
        assert_eq!(settings.crop, AlignParams::PORTRAIT);
        assert!(settings.use_stitching && settings.relative_motion && settings.paste_back);
    }
}
