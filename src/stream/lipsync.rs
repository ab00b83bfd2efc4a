//! Audio-driven lip sync over a looping avatar clip.

use super::queue::OutputQueue;
use crate::audio::AudioFeatures;
use crate::constants::{FACE_LARGE_EXPAND, LIPSYNC_FACE_SIZE, UPPER_BOUNDARY_RATIO, VAE_SCALING_FACTOR};
use crate::face_analysis::FaceAnalysis;
use crate::face_parsing::MaskMode;
use crate::geometry::{crop_frame, resize_frame, Interpolation};
use crate::runtime::{end_all, start_all, BufferPool, ModelFactory, ModelKind, SharedModel};
use crate::segmentation::{blend_generated, hybrid_face_box, prepare_material, BlendMaterial, MarginVersion};
use crate::utils::image_conversion::{frame_to_nchw_into, signed_nchw_to_frame, validate_frame, Normalization};
use crate::utils::safe_cast::i32_to_usize;
use crate::{Error, Result};
use ndarray::{concatenate, Array1, Array2, Array4, Axis, Ix4};
use opencv::core::{Mat, Rect};
use opencv::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// Position in the forward-then-reverse loop over `n` avatar frames.
///
/// Indices run `0, 1, …, n-1, n-1, …, 1, 0` and repeat, so the clip never
/// jumps back to its first frame.
#[must_use]
pub fn cycle_index(i: usize, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let j = i % (2 * n);
    if j < n {
        j
    } else {
        2 * n - 1 - j
    }
}

/// Avatar preparation and compositing switches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LipSyncSettings {
    /// Crop geometry revision
    pub margin_version: MarginVersion,
    /// Parsing classes blended back
    pub mask_mode: MaskMode,
    /// Fraction of the face-large crop kept from the original at the top
    pub upper_boundary_ratio: f32,
    /// Vertical shift of the half-face landmark in pixels
    pub bbox_shift: i32,
    /// Expansion of the face box into the blending region
    pub face_expand: f32,
}

impl Default for LipSyncSettings {
    fn default() -> Self {
        Self {
            margin_version: MarginVersion::default(),
            mask_mode: MaskMode::Jaw,
            upper_boundary_ratio: UPPER_BOUNDARY_RATIO,
            bbox_shift: 0,
            face_expand: FACE_LARGE_EXPAND,
        }
    }
}

/// One prepared avatar frame
pub struct AvatarFrame {
    /// Original frame
    pub frame: Mat,
    /// Face box after margin adjustment
    pub face_box: Rect,
    /// Face crop at the generator's input size
    pub face: Mat,
    /// Compositing crops and masks
    pub material: BlendMaterial,
    /// Masked and reference latents stacked on the channel axis
    pub latent: Array4<f32>,
}

/// All prepared frames of an avatar clip
#[derive(Default)]
pub struct AvatarData {
    /// Frames in clip order
    pub frames: Vec<AvatarFrame>,
}

impl AvatarData {
    /// Number of prepared frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing was prepared
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame used for output frame `index`
    #[must_use]
    pub fn frame_for(&self, index: usize) -> Option<&AvatarFrame> {
        self.frames.get(cycle_index(index, self.frames.len()))
    }
}

/// Generates mouth motion for an avatar from audio feature chunks
pub struct LipSyncGenerator {
    analysis: Arc<FaceAnalysis>,
    encoder: SharedModel,
    decoder: SharedModel,
    unet: SharedModel,
    settings: LipSyncSettings,
    pool: BufferPool,
    avatar: Option<AvatarData>,
}

impl LipSyncGenerator {
    /// Assemble from already wrapped models
    #[must_use]
    pub fn new(
        analysis: Arc<FaceAnalysis>,
        encoder: SharedModel,
        decoder: SharedModel,
        unet: SharedModel,
        settings: LipSyncSettings,
    ) -> Self {
        Self {
            analysis,
            encoder,
            decoder,
            unet,
            settings,
            pool: BufferPool::new(),
            avatar: None,
        }
    }

    /// Create the generation models through `factory`
    ///
    /// # Errors
    ///
    /// Returns an error if an eagerly loaded model fails to load
    pub fn from_factory(factory: &ModelFactory, analysis: Arc<FaceAnalysis>, settings: LipSyncSettings) -> Result<Self> {
        Ok(Self::new(
            analysis,
            factory.create(ModelKind::VaeEncoder)?,
            factory.create(ModelKind::VaeDecoder)?,
            factory.create(ModelKind::LipSyncGenerator)?,
            settings,
        ))
    }

    /// Active settings
    #[must_use]
    pub fn settings(&self) -> &LipSyncSettings {
        &self.settings
    }

    /// Prepared avatar, once `prepare_avatar` succeeded
    #[must_use]
    pub fn avatar(&self) -> Option<&AvatarData> {
        self.avatar.as_ref()
    }

    /// Load every model used by the pipeline
    ///
    /// # Errors
    ///
    /// Returns the first load failure
    pub fn start_session(&self) -> Result<()> {
        self.analysis.start_session()?;
        if let Err(e) = start_all(&[&self.encoder, &self.decoder, &self.unet]) {
            self.analysis.end_session();
            return Err(e);
        }
        Ok(())
    }

    /// End the session on every model
    pub fn end_session(&self) {
        end_all(&[&self.encoder, &self.decoder, &self.unet]);
        self.analysis.end_session();
    }

    /// Detect, crop, mask and encode every avatar frame.
    ///
    /// Runs inside its own model session.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty clip, a frame without a face or model failures
    pub fn prepare_avatar(&mut self, frames: &[Mat]) -> Result<()> {
        if frames.is_empty() {
            return Err(Error::InvalidInput("Avatar clip has no frames".to_string()));
        }
        self.start_session()?;
        let started = Instant::now();
        let result = frames
            .iter()
            .enumerate()
            .map(|(index, frame)| {
                self.prepare_frame(frame).map_err(|e| {
                    log::warn!("Avatar frame {index} could not be prepared: {e}");
                    e
                })
            })
            .collect::<Result<Vec<_>>>();
        self.end_session();

        let prepared = result?;
        log::info!(
            "Avatar prepared: {} frames in {:.1} ms",
            prepared.len(),
            started.elapsed().as_secs_f64() * 1000.0
        );
        self.avatar = Some(AvatarData { frames: prepared });
        Ok(())
    }

    fn prepare_frame(&mut self, frame: &Mat) -> Result<AvatarFrame> {
        validate_frame(frame)?;
        let detection = self.analysis.detect_primary(frame)?;
        let face_box = hybrid_face_box(
            &detection.landmarks,
            &detection.bbox,
            self.settings.bbox_shift,
            frame.cols(),
            frame.rows(),
        )?;
        let face_box = self.settings.margin_version.adjust(face_box, frame.rows());
        let face = resize_frame(
            &crop_frame(frame, face_box)?,
            LIPSYNC_FACE_SIZE,
            LIPSYNC_FACE_SIZE,
            Interpolation::Lanczos,
        )?;
        let material = prepare_material(
            frame,
            face_box,
            &self.analysis,
            self.settings.mask_mode,
            self.settings.upper_boundary_ratio,
            self.settings.face_expand,
        )?;
        let latent = self.encode_latent(&face)?;
        Ok(AvatarFrame {
            frame: frame.try_clone()?,
            face_box,
            face,
            material,
            latent,
        })
    }

    /// Scaled VAE latent of one face
    fn encode(&mut self, face: &Mat) -> Result<Array4<f32>> {
        let side = i32_to_usize(LIPSYNC_FACE_SIZE)?;
        let tensor = self.pool.nchw(0, [1, 3, side, side]);
        frame_to_nchw_into(face, &Normalization::SIGNED, tensor)?;

        let mut model = self.encoder.lock();
        let outputs = model.run(&[tensor.view().into_dyn()])?;
        let latent = outputs
            .first()
            .ok_or_else(|| Error::ModelOutputError("VAE encoder produced no outputs".to_string()))?
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| Error::ModelDataFormatError(format!("VAE encoder output: {e}")))?;
        Ok(latent.mapv(|v| v * VAE_SCALING_FACTOR))
    }

    /// Latent of the face with its lower half blanked, stacked on the full face's latent
    ///
    /// # Errors
    ///
    /// Returns an error for faces of the wrong size or encoder failures
    pub fn encode_latent(&mut self, face: &Mat) -> Result<Array4<f32>> {
        validate_frame(face)?;
        if face.cols() != LIPSYNC_FACE_SIZE || face.rows() != LIPSYNC_FACE_SIZE {
            return Err(Error::InvalidInput(format!(
                "Lip-sync faces must be {LIPSYNC_FACE_SIZE}x{LIPSYNC_FACE_SIZE}"
            )));
        }
        let mut masked = face.try_clone()?;
        let row_bytes = i32_to_usize(LIPSYNC_FACE_SIZE)? * 3;
        let half = i32_to_usize(LIPSYNC_FACE_SIZE / 2)? * row_bytes;
        masked.data_bytes_mut()?[half..].fill(0);

        let masked_latent = self.encode(&masked)?;
        let reference_latent = self.encode(face)?;
        concatenate(Axis(1), &[masked_latent.view(), reference_latent.view()])
            .map_err(|e| Error::ModelDataFormatError(format!("Latent shapes differ: {e}")))
    }

    /// Generate output frame `index` from its audio feature chunk
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` before `prepare_avatar`, otherwise model or compositing errors
    pub fn generate_frame(&mut self, index: usize, chunk: &Array2<f32>) -> Result<Mat> {
        let avatar = self
            .avatar
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("No avatar prepared".to_string()))?;
        let frame = avatar
            .frame_for(index)
            .ok_or_else(|| Error::InvalidInput("Avatar has no frames".to_string()))?;

        let audio = chunk.view().insert_axis(Axis(0));
        let timestep = Array1::from_elem(1, 0.0f32);
        let predicted = {
            let mut unet = self.unet.lock();
            let mut outputs = unet.run_owned(&[
                frame.latent.view().into_dyn(),
                timestep.view().into_dyn(),
                audio.into_dyn(),
            ])?;
            if outputs.is_empty() {
                return Err(Error::ModelOutputError("Generator produced no outputs".to_string()));
            }
            outputs.swap_remove(0)
        };

        let face = {
            let scaled = predicted.mapv(|v| v / VAE_SCALING_FACTOR);
            let mut model = self.decoder.lock();
            let outputs = model.run(&[scaled.view()])?;
            let image = outputs
                .first()
                .ok_or_else(|| Error::ModelOutputError("VAE decoder produced no outputs".to_string()))?;
            signed_nchw_to_frame(&image.view())?
        };
        blend_generated(&frame.frame, &face, &frame.material)
    }

    /// Generate one frame per audio chunk, pushing results to `queue`.
    ///
    /// Returns the number of frames produced. The queue is finished on
    /// success and when the consumer cancels; on error it is left for the
    /// caller to fail.
    ///
    /// # Errors
    ///
    /// Returns the first model or compositing error
    pub fn run(&mut self, features: &AudioFeatures, queue: &OutputQueue) -> Result<usize> {
        queue.set_total_expected(features.len());
        self.start_session()?;
        let result = self.drive(features, queue);
        self.end_session();
        match result {
            Ok(count) => {
                queue.finish();
                log::info!("Lip sync finished: {count} frames");
                Ok(count)
            }
            Err(Error::Cancelled) => {
                queue.finish();
                log::info!("Lip sync cancelled after {} frames", queue.produced());
                Ok(queue.produced())
            }
            Err(e) => Err(e),
        }
    }

    fn drive(&mut self, features: &AudioFeatures, queue: &OutputQueue) -> Result<usize> {
        for (index, chunk) in features.chunks.iter().enumerate() {
            if queue.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let started = Instant::now();
            let output = self.generate_frame(index, chunk)?;
            queue.push(output)?;
            log::debug!(
                "Frame {index} generated in {:.1} ms",
                started.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(features.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_runs_forward_then_back() {
        let indices: Vec<usize> = (0..8).map(|i| cycle_index(i, 3)).collect();
        assert_eq!(indices, vec![0, 1, 2, 2, 1, 0, 0, 1]);
    }

    #[test]
    fn test_cycle_is_palindrome() {
        for n in 1..6 {
            for i in n..2 * n - 1 {
                assert_eq!(cycle_index(i, n), cycle_index(2 * n - 1 - i, n));
            }
        }
    }

    #[test]
    fn test_cycle_single_frame() {
        assert!((0..5).all(|i| cycle_index(i, 1) == 0));
        assert_eq!(cycle_index(7, 0), 0);
    }

    #[test]
    fn test_empty_avatar_has_no_frame() {
        let avatar = AvatarData::default();
        assert!(avatar.is_empty());
        assert!(avatar.frame_for(3).is_none());
    }
}
