//! ONNX Runtime implementation of the inference backend.

use super::backend::{store_output, InferenceBackend, LoadedModel};
use super::descriptor::{Accelerator, ModelDescriptor, ModelStore};
use crate::Result;
use ndarray::{ArrayD, ArrayViewD, CowArray};
use ort::{Environment, ExecutionProvider, GraphOptimizationLevel, LoggingLevel, Session, SessionBuilder, Value};
use std::sync::Arc;

/// Backend that loads `.onnx` artifacts from a [`ModelStore`]
pub struct OrtBackend {
    environment: Arc<Environment>,
    store: ModelStore,
    intra_threads: i16,
}

impl OrtBackend {
    /// Create a backend over `store`
    ///
    /// # Errors
    ///
    /// Returns an error if the ONNX runtime environment cannot be created
    pub fn new(store: ModelStore, intra_threads: i16) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("portrait_sync")
                .with_log_level(LoggingLevel::Warning)
                .build()?,
        );

        Ok(Self {
            environment,
            store,
            intra_threads,
        })
    }

    fn execution_providers(accelerator: Accelerator) -> Vec<ExecutionProvider> {
        let preferred = match accelerator {
            Accelerator::Cpu => None,
            Accelerator::Cuda => Some(ExecutionProvider::CUDA(Default::default())),
            Accelerator::CoreMl => Some(ExecutionProvider::CoreML(Default::default())),
            Accelerator::DirectMl => Some(ExecutionProvider::DirectML(Default::default())),
        };
        // CPU stays registered last as the fallback
        preferred
            .into_iter()
            .chain(std::iter::once(ExecutionProvider::CPU(Default::default())))
            .collect()
    }
}

impl InferenceBackend for OrtBackend {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>> {
        let path = self.store.resolve(descriptor)?;
        log::info!(
            "Loading model '{}' ({:?}, {:?}) from {}",
            descriptor.name,
            descriptor.precision,
            descriptor.accelerator,
            path.display()
        );

        let session = SessionBuilder::new(&self.environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.intra_threads)?
            .with_execution_providers(Self::execution_providers(descriptor.accelerator))?
            .with_model_from_file(path)?;

        let input_names = session.inputs.iter().map(|input| input.name.clone()).collect();
        let output_names = session.outputs.iter().map(|output| output.name.clone()).collect();

        Ok(Box::new(OrtModel {
            session,
            input_names,
            output_names,
        }))
    }
}

struct OrtModel {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl LoadedModel for OrtModel {
    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn run(&mut self, inputs: &[ArrayViewD<'_, f32>], outputs: &mut Vec<ArrayD<f32>>) -> Result<()> {
        // ONNX Runtime needs standard-layout buffers; views that already are one are borrowed
        let arrays: Vec<CowArray<'_, f32, ndarray::IxDyn>> = inputs
            .iter()
            .map(|view| {
                if view.is_standard_layout() {
                    CowArray::from(view.view())
                } else {
                    CowArray::from(view.as_standard_layout().into_owned())
                }
            })
            .collect();

        let values = arrays
            .iter()
            .map(|array| Value::from_array(self.session.allocator(), array))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let results = self.session.run(values)?;

        outputs.truncate(results.len());
        for (index, value) in results.iter().enumerate() {
            let tensor = value.try_extract::<f32>()?;
            store_output(outputs, index, tensor.view());
        }

        Ok(())
    }
}
