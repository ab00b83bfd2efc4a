//! Model identity, precision and load policy.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Numeric precision of a model artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// 32-bit float weights
    #[default]
    Full,
    /// 16-bit float weights
    Half,
    /// 8-bit quantized weights
    LowBit,
}

impl Precision {
    /// File name suffix for artifacts exported at this precision
    #[must_use]
    pub fn file_suffix(self) -> &'static str {
        match self {
            Self::Full => "",
            Self::Half => "_fp16",
            Self::LowBit => "_int8",
        }
    }
}

/// Preferred execution device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    /// Plain CPU execution
    #[default]
    Cpu,
    /// NVIDIA CUDA
    Cuda,
    /// Apple CoreML
    CoreMl,
    /// Windows DirectML
    DirectMl,
}

/// When a model is loaded and when it is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Loaded at construction and never released
    Eager,
    /// Loaded on the first `start_session` and never released afterwards
    OnDemandKeptAlive,
    /// Loaded on `start_session` and released on the matching `end_session`
    OnDemand,
}

/// Memory usage mode exposed in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Keep every model resident from startup
    Performance,
    /// Load lazily, keep once loaded
    #[default]
    Balanced,
    /// Load lazily, release after each session
    Economy,
}

impl From<MemoryMode> for LoadPolicy {
    fn from(mode: MemoryMode) -> Self {
        match mode {
            MemoryMode::Performance => Self::Eager,
            MemoryMode::Balanced => Self::OnDemandKeptAlive,
            MemoryMode::Economy => Self::OnDemand,
        }
    }
}

/// Identity of one neural model
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelDescriptor {
    /// Model name, also the artifact file stem
    pub name: String,
    /// Directory below the model root
    pub sub_path: String,
    /// Exported precision
    pub precision: Precision,
    /// Preferred execution device
    pub accelerator: Accelerator,
}

impl ModelDescriptor {
    /// Create a full-precision CPU descriptor
    pub fn new(name: impl Into<String>, sub_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_path: sub_path.into(),
            precision: Precision::Full,
            accelerator: Accelerator::Cpu,
        }
    }

    /// Override the precision
    #[must_use]
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Override the accelerator
    #[must_use]
    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Artifact file name, e.g. `warping_fp16.onnx`
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}{}.onnx", self.name, self.precision.file_suffix())
    }
}

/// Resolves descriptors to loadable artifacts below a root directory
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    /// Create a store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path the descriptor maps to, whether or not it exists
    #[must_use]
    pub fn path_for(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.root.join(&descriptor.sub_path).join(descriptor.file_name())
    }

    /// Resolve the descriptor to an existing artifact
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact does not exist
    pub fn resolve(&self, descriptor: &ModelDescriptor) -> Result<PathBuf> {
        let path = self.path_for(descriptor);
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::ModelError(format!(
                "Model artifact for '{}' not found at {}",
                descriptor.name,
                path.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_per_precision() {
        let desc = ModelDescriptor::new("warping", "liveportrait");
        assert_eq!(desc.file_name(), "warping.onnx");
        assert_eq!(desc.clone().with_precision(Precision::Half).file_name(), "warping_fp16.onnx");
        assert_eq!(desc.with_precision(Precision::LowBit).file_name(), "warping_int8.onnx");
    }

    #[test]
    fn test_memory_mode_maps_to_policy() {
        assert_eq!(LoadPolicy::from(MemoryMode::Performance), LoadPolicy::Eager);
        assert_eq!(LoadPolicy::from(MemoryMode::Balanced), LoadPolicy::OnDemandKeptAlive);
        assert_eq!(LoadPolicy::from(MemoryMode::Economy), LoadPolicy::OnDemand);
    }

    #[test]
    fn test_store_resolves_existing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("face")).unwrap();
        std::fs::write(dir.path().join("face").join("det_10g.onnx"), b"onnx").unwrap();

        let store = ModelStore::new(dir.path());
        let found = ModelDescriptor::new("det_10g", "face");
        assert!(store.resolve(&found).is_ok());

        let missing = ModelDescriptor::new("det_10g", "face").with_precision(Precision::Half);
        assert!(matches!(store.resolve(&missing), Err(Error::ModelError(_))));
    }
}
