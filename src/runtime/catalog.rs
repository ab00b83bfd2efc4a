//! The models used by the pipelines and a factory that builds their runtimes.

use super::descriptor::{Accelerator, LoadPolicy, ModelDescriptor, Precision};
use super::{InferenceBackend, ModelRuntime, SharedModel};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Group of models sharing one precision setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    /// Detection, landmarks and parsing
    Detection,
    /// Motion transfer networks
    Animation,
    /// Audio encoder, latent codec and generator
    LipSync,
}

/// Every model the pipelines load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// SCRFD face detector
    FaceDetector,
    /// 106-point landmark model
    Landmark106,
    /// Landmark refiner used for tracking
    LandmarkRefiner,
    /// 19-class face parser
    FaceParsing,
    /// Pose, expression, scale and keypoint extractor
    MotionExtractor,
    /// 3-D appearance feature extractor
    AppearanceExtractor,
    /// Keypoint stitching refiner
    Stitching,
    /// Feature warping and rendering network
    Warping,
    /// Speech encoder producing 50 Hz features
    AudioEncoder,
    /// Image → latent encoder
    VaeEncoder,
    /// Latent → image decoder
    VaeDecoder,
    /// Audio-conditioned latent generator
    LipSyncGenerator,
}

impl ModelKind {
    /// Artifact stem
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FaceDetector => "scrfd_2.5g",
            Self::Landmark106 => "2d106det",
            Self::LandmarkRefiner => "landmark_203",
            Self::FaceParsing => "face_parsing",
            Self::MotionExtractor => "motion_extractor",
            Self::AppearanceExtractor => "appearance_feature_extractor",
            Self::Stitching => "stitching",
            Self::Warping => "warping_spade",
            Self::AudioEncoder => "audio_encoder",
            Self::VaeEncoder => "vae_encoder",
            Self::VaeDecoder => "vae_decoder",
            Self::LipSyncGenerator => "unet",
        }
    }

    /// Directory below the model root
    #[must_use]
    pub const fn sub_path(self) -> &'static str {
        match self.class() {
            ModelClass::Detection => "face",
            ModelClass::Animation => "animation",
            ModelClass::LipSync => "lipsync",
        }
    }

    /// Precision group
    #[must_use]
    pub const fn class(self) -> ModelClass {
        match self {
            Self::FaceDetector | Self::Landmark106 | Self::LandmarkRefiner | Self::FaceParsing => ModelClass::Detection,
            Self::MotionExtractor | Self::AppearanceExtractor | Self::Stitching | Self::Warping => {
                ModelClass::Animation
            }
            Self::AudioEncoder | Self::VaeEncoder | Self::VaeDecoder | Self::LipSyncGenerator => ModelClass::LipSync,
        }
    }
}

/// Builds shared runtimes with one backend, load policy and per-class precision
#[derive(Clone)]
pub struct ModelFactory {
    backend: Arc<dyn InferenceBackend>,
    policy: LoadPolicy,
    accelerator: Accelerator,
    detection: Precision,
    animation: Precision,
    lipsync: Precision,
}

impl ModelFactory {
    /// Full precision on CPU
    #[must_use]
    pub fn new(backend: Arc<dyn InferenceBackend>, policy: LoadPolicy) -> Self {
        Self {
            backend,
            policy,
            accelerator: Accelerator::Cpu,
            detection: Precision::Full,
            animation: Precision::Full,
            lipsync: Precision::Full,
        }
    }

    /// Prefer an accelerator for every model
    #[must_use]
    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Set the precision of one model class
    #[must_use]
    pub fn with_precision(mut self, class: ModelClass, precision: Precision) -> Self {
        match class {
            ModelClass::Detection => self.detection = precision,
            ModelClass::Animation => self.animation = precision,
            ModelClass::LipSync => self.lipsync = precision,
        }
        self
    }

    /// Load policy applied to created runtimes
    #[must_use]
    pub fn policy(&self) -> LoadPolicy {
        self.policy
    }

    /// Descriptor for `kind` under the current settings
    #[must_use]
    pub fn descriptor(&self, kind: ModelKind) -> ModelDescriptor {
        let precision = match kind.class() {
            ModelClass::Detection => self.detection,
            ModelClass::Animation => self.animation,
            ModelClass::LipSync => self.lipsync,
        };
        ModelDescriptor::new(kind.name(), kind.sub_path())
            .with_precision(precision)
            .with_accelerator(self.accelerator)
    }

    /// Build the shared runtime for `kind`; eager policies load immediately
    ///
    /// # Errors
    ///
    /// Returns an error if an eager load fails
    pub fn create(&self, kind: ModelKind) -> Result<SharedModel> {
        Ok(ModelRuntime::new(self.descriptor(kind), self.policy, Arc::clone(&self.backend))?.into_shared())
    }
}
