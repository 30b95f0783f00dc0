//! ONNX inference backends for twinfer.
//!
//! The same classification graph runs on two interchangeable runtimes:
//! - `ort` (ONNX Runtime with XNNPACK) as the native in-process backend
//! - `tract` as the portable backend, which also builds for `wasm32`

mod backend;
mod error;
mod tensor;

pub use backend::InferenceBackend;
pub use error::InferenceError;
pub use tensor::{IMAGE_INPUT_SHAPE, InputTensor, OutputTensor};

#[cfg(feature = "native")]
pub use backend::ort::{OrtBackend, OrtOptions};

#[cfg(feature = "portable")]
pub use backend::tract::TractBackend;

/// Result type for inference operations.
pub type Result<T> = std::result::Result<T, InferenceError>;
