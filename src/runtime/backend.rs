//! Seams between the model runtime and concrete inference engines.

use super::descriptor::ModelDescriptor;
use crate::Result;
use ndarray::{ArrayD, ArrayViewD, IxDyn};

/// A model that is resident and ready to execute
pub trait LoadedModel: Send {
    /// Declared input names in positional order
    fn input_names(&self) -> &[String];

    /// Declared output names in positional order
    fn output_names(&self) -> &[String];

    /// Execute with positional inputs, writing one tensor per output into `outputs`.
    ///
    /// Implementations should reuse the existing allocations in `outputs` when the
    /// shapes match; see [`store_output`].
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails
    fn run(&mut self, inputs: &[ArrayViewD<'_, f32>], outputs: &mut Vec<ArrayD<f32>>) -> Result<()>;
}

/// Loads models from their descriptors
pub trait InferenceBackend: Send + Sync {
    /// Load the artifact described by `descriptor`
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact is missing or cannot be initialised
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>>;
}

/// Copy `value` into the output slot at `index`, growing `outputs` if needed and
/// only reallocating when the shape changed.
pub fn store_output(outputs: &mut Vec<ArrayD<f32>>, index: usize, value: ArrayViewD<'_, f32>) {
    if outputs.len() <= index {
        outputs.resize_with(index + 1, || ArrayD::zeros(IxDyn(&[0])));
    }
    let slot = &mut outputs[index];
    if slot.shape() == value.shape() {
        slot.assign(&value);
    } else {
        *slot = value.to_owned();
    }
}
