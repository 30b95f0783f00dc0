//! ONNX Runtime (ort) backend for native platforms with XNNPACK.

use std::path::Path;
use std::sync::Mutex;

use ort::ep::XNNPACK;
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::Tensor;
use tracing::debug;

use crate::error::InferenceError;
use crate::tensor::{InputTensor, OutputTensor};
use crate::{InferenceBackend, Result};

/// Session options for the native backend.
#[derive(Debug, Clone, Copy)]
pub struct OrtOptions {
    /// Threads used inside a single operator.
    pub intra_threads: usize,
    /// Register the XNNPACK execution provider.
    pub use_xnnpack: bool,
}

impl Default for OrtOptions {
    fn default() -> Self {
        Self {
            intra_threads: 4,
            use_xnnpack: true,
        }
    }
}

/// Backend using ONNX Runtime for native inference.
///
/// `Session::run` needs exclusive access, so concurrent requests serialize on
/// the session lock. The session itself is never modified after loading.
pub struct OrtBackend {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OrtBackend {
    /// Load a model from a file path.
    ///
    /// Loading from a path lets ONNX Runtime resolve external weight files
    /// stored next to the model.
    pub fn from_file<P: AsRef<Path>>(path: P, options: OrtOptions) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading ONNX model from: {}", path.display());

        if !path.exists() {
            return Err(InferenceError::ModelLoad(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        let session = Self::builder(options)?
            .commit_from_file(path)
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;

        Self::from_session(session)
    }

    fn builder(options: OrtOptions) -> Result<SessionBuilder> {
        let mut builder =
            Session::builder().map_err(|e| InferenceError::SessionCreate(e.to_string()))?;

        if options.use_xnnpack {
            builder = builder
                .with_execution_providers([XNNPACK::default().build()])
                .map_err(|e| InferenceError::SessionCreate(e.to_string()))?;
        }

        builder
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))?
            .with_intra_threads(options.intra_threads.max(1))
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))
    }

    fn from_session(session: Session) -> Result<Self> {
        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| InferenceError::ModelLoad("model has no inputs".to_string()))?;

        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| InferenceError::ModelLoad("model has no outputs".to_string()))?;

        debug!("Model input: {}, output: {}", input_name, output_name);

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl InferenceBackend for OrtBackend {
    fn run(&self, input: &InputTensor) -> Result<OutputTensor> {
        let shape: Vec<i64> = input.shape().iter().map(|&s| s as i64).collect();
        let value: ort::session::SessionInputValue<'static> = Tensor::from_array((shape, input.to_vec()))
            .map(Into::into)
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| InferenceError::InferenceFailed(format!("Failed to lock session: {}", e)))?;

        let outputs = session
            .run(vec![(self.input_name.as_str(), value)])
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let value = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| {
                InferenceError::OutputExtraction(format!("missing output '{}'", self.output_name))
            })?;

        let (shape_ref, data) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?;
        let shape: Vec<usize> = shape_ref.iter().map(|&s| s as usize).collect();

        OutputTensor::from_shape_vec(&shape, data.to_vec())
    }

    fn runtime_name(&self) -> &'static str {
        "onnxruntime"
    }
}
