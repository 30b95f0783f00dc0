//! Inference backend implementations.

#[cfg(feature = "native")]
pub mod ort;

#[cfg(feature = "portable")]
pub mod tract;

use crate::{InputTensor, OutputTensor, Result};

/// Trait for ONNX inference backends.
///
/// A backend is loaded once and then shared read-only between requests, so
/// `run` takes `&self` and implementations must be `Send + Sync`. Neither
/// implementation tracks gradients or mutates its weights.
pub trait InferenceBackend: Send + Sync {
    /// Run the model on a single input tensor and return its first output.
    fn run(&self, input: &InputTensor) -> Result<OutputTensor>;

    /// Name of the runtime behind this backend, for logs and reports.
    fn runtime_name(&self) -> &'static str;
}
