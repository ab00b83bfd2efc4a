//! Neural model execution runtime.
//!
//! A [`ModelRuntime`] wraps one model and owns its lifecycle under a
//! [`LoadPolicy`]. Inference is bracketed by `start_session`/`end_session`;
//! outputs either land in scratch buffers owned by the runtime (valid until the
//! next call) or are handed out as independently owned tensors.

/// Traits implemented by inference engines
pub mod backend;

/// Model catalogue and runtime factory
pub mod catalog;

/// Model identity, precision and load policies
pub mod descriptor;

/// ONNX Runtime backend
pub mod ort_backend;

/// Reusable tensor buffers
pub mod pool;

pub use backend::{store_output, InferenceBackend, LoadedModel};
pub use catalog::{ModelClass, ModelFactory, ModelKind};
pub use descriptor::{Accelerator, LoadPolicy, MemoryMode, ModelDescriptor, ModelStore, Precision};
pub use ort_backend::OrtBackend;
pub use pool::{BufferPool, FlatBuffer};

use crate::{Error, Result};
use ndarray::{ArrayD, ArrayViewD};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Model runtime shared by reference between pipelines
pub type SharedModel = Arc<Mutex<ModelRuntime>>;

/// Stateful wrapper around a single model
pub struct ModelRuntime {
    descriptor: ModelDescriptor,
    policy: LoadPolicy,
    backend: Arc<dyn InferenceBackend>,
    model: Option<Box<dyn LoadedModel>>,
    scratch: Vec<ArrayD<f32>>,
    load_count: usize,
}

impl ModelRuntime {
    /// Create a runtime; `Eager` models are loaded immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if an eager load fails
    pub fn new(descriptor: ModelDescriptor, policy: LoadPolicy, backend: Arc<dyn InferenceBackend>) -> Result<Self> {
        let mut runtime = Self {
            descriptor,
            policy,
            backend,
            model: None,
            scratch: Vec::new(),
            load_count: 0,
        };
        if policy == LoadPolicy::Eager {
            runtime.load()?;
        }
        Ok(runtime)
    }

    /// Wrap into a [`SharedModel`]
    #[must_use]
    pub fn into_shared(self) -> SharedModel {
        Arc::new(Mutex::new(self))
    }

    /// Model name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Descriptor this runtime was built from
    #[must_use]
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    /// Load policy
    #[must_use]
    pub fn policy(&self) -> LoadPolicy {
        self.policy
    }

    /// Whether the model is currently resident
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// How many times the artifact has been loaded
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.load_count
    }

    fn load(&mut self) -> Result<()> {
        let started = Instant::now();
        let model = self.backend.load(&self.descriptor)?;
        self.model = Some(model);
        self.load_count += 1;
        log::debug!(
            "Model '{}' loaded in {:.1} ms (load #{})",
            self.descriptor.name,
            started.elapsed().as_secs_f64() * 1000.0,
            self.load_count
        );
        Ok(())
    }

    /// Begin a batch of inferences, loading the model if it is not resident.
    ///
    /// # Errors
    ///
    /// Returns an error if loading fails
    pub fn start_session(&mut self) -> Result<()> {
        if self.model.is_none() {
            self.load()?;
        }
        Ok(())
    }

    /// End a batch of inferences. `OnDemand` models are released; the next
    /// `start_session` reloads them.
    pub fn end_session(&mut self) {
        if self.policy == LoadPolicy::OnDemand && self.model.take().is_some() {
            self.scratch = Vec::new();
            log::debug!("Model '{}' released", self.descriptor.name);
        }
    }

    /// Declared input names
    ///
    /// # Errors
    ///
    /// Returns an error if the model is not loaded
    pub fn input_names(&self) -> Result<&[String]> {
        Ok(self.loaded()?.input_names())
    }

    /// Declared output names
    ///
    /// # Errors
    ///
    /// Returns an error if the model is not loaded
    pub fn output_names(&self) -> Result<&[String]> {
        Ok(self.loaded()?.output_names())
    }

    fn loaded(&self) -> Result<&dyn LoadedModel> {
        self.model
            .as_deref()
            .ok_or_else(|| Error::ModelNotLoaded(self.descriptor.name.clone()))
    }

    /// Run with positional inputs. Outputs live in runtime-owned scratch buffers
    /// that are overwritten by the next call; copy anything that must outlive it.
    ///
    /// # Errors
    ///
    /// Returns `ModelNotLoaded` outside a session and `ModelExecution` if inference fails
    pub fn run(&mut self, inputs: &[ArrayViewD<'_, f32>]) -> Result<&[ArrayD<f32>]> {
        let name = &self.descriptor.name;
        let model = self
            .model
            .as_deref_mut()
            .ok_or_else(|| Error::ModelNotLoaded(name.clone()))?;
        model
            .run(inputs, &mut self.scratch)
            .map_err(|e| Error::model_execution(name.clone(), e))?;
        Ok(&self.scratch)
    }

    /// Run with inputs bound by declared name, in any order.
    ///
    /// # Errors
    ///
    /// Returns an error if a declared input is missing or inference fails
    pub fn run_named(&mut self, inputs: &[(&str, ArrayViewD<'_, f32>)]) -> Result<&[ArrayD<f32>]> {
        let ordered = self.bind_by_name(inputs)?;
        self.run(&ordered)
    }

    /// Run and return freshly allocated outputs owned by the caller.
    ///
    /// # Errors
    ///
    /// Returns `ModelNotLoaded` outside a session and `ModelExecution` if inference fails
    pub fn run_owned(&mut self, inputs: &[ArrayViewD<'_, f32>]) -> Result<Vec<ArrayD<f32>>> {
        let name = &self.descriptor.name;
        let model = self
            .model
            .as_deref_mut()
            .ok_or_else(|| Error::ModelNotLoaded(name.clone()))?;
        let mut outputs = Vec::new();
        model
            .run(inputs, &mut outputs)
            .map_err(|e| Error::model_execution(name.clone(), e))?;
        Ok(outputs)
    }

    fn bind_by_name<'a>(&self, inputs: &[(&str, ArrayViewD<'a, f32>)]) -> Result<Vec<ArrayViewD<'a, f32>>> {
        let declared = self.loaded()?.input_names();
        declared
            .iter()
            .map(|wanted| {
                inputs
                    .iter()
                    .find(|(name, _)| *name == wanted.as_str())
                    .map(|(_, view)| view.clone())
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "Input '{wanted}' of model '{}' was not bound",
                            self.descriptor.name
                        ))
                    })
            })
            .collect()
    }
}

/// Start a session on every model, ending the already started ones on failure
///
/// # Errors
///
/// Returns the first load error
pub fn start_all(models: &[&SharedModel]) -> Result<()> {
    for (index, model) in models.iter().enumerate() {
        if let Err(e) = model.lock().start_session() {
            for started in &models[..index] {
                started.lock().end_session();
            }
            return Err(e);
        }
    }
    Ok(())
}

/// End the session on every model
pub fn end_all(models: &[&SharedModel]) {
    for model in models {
        model.lock().end_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Doubler {
        inputs: Vec<String>,
        outputs: Vec<String>,
    }

    impl LoadedModel for Doubler {
        fn input_names(&self) -> &[String] {
            &self.inputs
        }

        fn output_names(&self) -> &[String] {
            &self.outputs
        }

        fn run(&mut self, inputs: &[ArrayViewD<'_, f32>], outputs: &mut Vec<ArrayD<f32>>) -> Result<()> {
            let first = inputs.first().ok_or_else(|| Error::InvalidInput("no input".into()))?;
            let second = inputs.get(1).map_or(0.0, |v| v.iter().copied().sum::<f32>());
            let doubled = first.mapv(|v| v * 2.0 + second);
            store_output(outputs, 0, doubled.view());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingBackend {
        loads: AtomicUsize,
    }

    impl InferenceBackend for CountingBackend {
        fn load(&self, _descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Doubler {
                inputs: vec!["x".into(), "bias".into()],
                outputs: vec!["y".into()],
            }))
        }
    }

    fn runtime(policy: LoadPolicy) -> ModelRuntime {
        ModelRuntime::new(
            ModelDescriptor::new("doubler", "test"),
            policy,
            Arc::new(CountingBackend::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_eager_loads_at_construction() {
        let rt = runtime(LoadPolicy::Eager);
        assert!(rt.is_loaded());
        assert_eq!(rt.load_count(), 1);
    }

    #[test]
    fn test_on_demand_loads_lazily_and_releases() {
        let mut rt = runtime(LoadPolicy::OnDemand);
        assert!(!rt.is_loaded());
        rt.start_session().unwrap();
        rt.start_session().unwrap();
        assert_eq!(rt.load_count(), 1);
        rt.end_session();
        assert!(!rt.is_loaded());
        rt.start_session().unwrap();
        assert_eq!(rt.load_count(), 2);
    }

    #[test]
    fn test_kept_alive_survives_end_session() {
        let mut rt = runtime(LoadPolicy::OnDemandKeptAlive);
        rt.start_session().unwrap();
        rt.end_session();
        assert!(rt.is_loaded());
        rt.start_session().unwrap();
        assert_eq!(rt.load_count(), 1);
    }

    #[test]
    fn test_run_outside_session_is_an_error() {
        let mut rt = runtime(LoadPolicy::OnDemand);
        let input = ArrayD::<f32>::zeros(IxDyn(&[2]));
        assert!(matches!(rt.run(&[input.view()]), Err(Error::ModelNotLoaded(_))));
    }

    #[test]
    fn test_scratch_outputs_are_reused() {
        let mut rt = runtime(LoadPolicy::Eager);
        let input = ArrayD::from_elem(IxDyn(&[4]), 1.0f32);
        let first_ptr = rt.run(&[input.view()]).unwrap()[0].as_ptr();
        let second = rt.run(&[input.view()]).unwrap();
        assert_eq!(second[0].as_ptr(), first_ptr);
        assert!((second[0][[0]] - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_owned_outputs_are_independent() {
        let mut rt = runtime(LoadPolicy::Eager);
        let input = ArrayD::from_elem(IxDyn(&[4]), 1.0f32);
        let kept = rt.run_owned(&[input.view()]).unwrap();
        let other = ArrayD::from_elem(IxDyn(&[4]), 5.0f32);
        rt.run(&[other.view()]).unwrap();
        assert!((kept[0][[0]] - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_named_binding_reorders_inputs() {
        let mut rt = runtime(LoadPolicy::Eager);
        let x = ArrayD::from_elem(IxDyn(&[1]), 1.0f32);
        let bias = ArrayD::from_elem(IxDyn(&[1]), 10.0f32);
        let out = rt.run_named(&[("bias", bias.view()), ("x", x.view())]).unwrap();
        assert!((out[0][[0]] - 12.0).abs() < f32::EPSILON);

        let missing = rt.run_named(&[("x", x.view())]);
        assert!(matches!(missing, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_execution_failure_is_wrapped_with_model_name() {
        let mut rt = runtime(LoadPolicy::Eager);
        let err = rt.run(&[]).unwrap_err();
        match err {
            Error::ModelExecution { model, .. } => assert_eq!(model, "doubler"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
