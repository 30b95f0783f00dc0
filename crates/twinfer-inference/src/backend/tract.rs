//! Tract backend for portable ONNX inference.
//!
//! This is the runtime that also ships to the browser, so the byte-buffer
//! constructor is the primary entry point: a sandboxed environment receives
//! one file and cannot resolve external weight data next to it.

use tract_onnx::prelude::*;
use tracing::debug;

use crate::error::InferenceError;
use crate::tensor::{InputTensor, OutputTensor};
use crate::{InferenceBackend, Result};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Backend using Tract for portable ONNX inference.
pub struct TractBackend {
    model: RunnableModel,
    input_shape: Vec<usize>,
    output_name: String,
}

impl TractBackend {
    /// Load a model from bytes with the given input shape.
    pub fn from_bytes_with_shape(bytes: &[u8], input_shape: &[usize]) -> Result<Self> {
        debug!("Loading ONNX model with Tract from {} bytes", bytes.len());

        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to load model: {}", e)))?;

        Self::from_inference_model(model, input_shape)
    }

    fn from_inference_model(mut model: InferenceModel, input_shape: &[usize]) -> Result<Self> {
        let input_name = model
            .input_outlets()
            .ok()
            .and_then(|outlets| outlets.first().map(|o| model.node(o.node).name.clone()))
            .unwrap_or_else(|| "input".to_string());
        let output_name = model
            .output_outlets()
            .ok()
            .and_then(|outlets| outlets.first().map(|o| model.node(o.node).name.clone()))
            .unwrap_or_else(|| "output".to_string());

        // Pin the batch dimension so the optimizer can specialize every kernel.
        model
            .set_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), input_shape))
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to set input shape: {}", e)))?;

        let model = model
            .into_typed()
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to type model: {}", e)))?
            .into_optimized()
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to optimize: {}", e)))?
            .into_runnable()
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))?;

        debug!("Model input: {}, output: {}", input_name, output_name);

        Ok(Self {
            model,
            input_shape: input_shape.to_vec(),
            output_name,
        })
    }
}

impl InferenceBackend for TractBackend {
    fn run(&self, input: &InputTensor) -> Result<OutputTensor> {
        input.ensure_shape(&self.input_shape)?;

        let tensor = tract_ndarray::ArrayD::from_shape_vec(
            tract_ndarray::IxDyn(input.shape()),
            input.to_vec(),
        )
        .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let outputs = self
            .model
            .run(tvec!(tensor.into_tvalue()))
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let output = outputs.first().ok_or_else(|| {
            InferenceError::OutputExtraction(format!("missing output '{}'", self.output_name))
        })?;

        let view = output
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?;

        OutputTensor::from_shape_vec(view.shape(), view.iter().copied().collect())
    }

    fn runtime_name(&self) -> &'static str {
        "tract"
    }
}
