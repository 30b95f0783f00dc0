//! Core library for dual-backend image classification.
//!
//! This crate provides:
//! - Two interchangeable preprocessing pipelines that must agree numerically
//! - A dual executor running a native and a portable ONNX runtime
//! - Cross-backend divergence diagnostics and a regression gate
//! - Per-request latency breakdowns and the warm-up lifecycle
//! - An offline verifier that makes model artifacts self-contained

pub mod artifact;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod latency;
pub mod models;
pub mod preprocess;
pub mod service;

pub use diagnostics::{
    DivergenceReport, GateOutcome, ParityGate, ProbabilityDistribution, Top1, compare_scores,
    softmax,
};
pub use error::{InputError, PortabilityError, Result, TwinferError};
pub use executor::{BackendKind, DualExecutor, ModelSpec, ScoreVector};
pub use latency::{
    Clock, LatencyBreakdown, LatencyStats, LifecycleState, MonotonicClock, RequestTimer, Stage,
    WarmupController, WarmupReport,
};
pub use models::config::TwinferConfig;
pub use models::prediction::{PredictionResponse, PredictionResult};
pub use preprocess::{
    CanvasPreprocessor, NativePreprocessor, Normalization, PreprocessVariant, ResizeFilter,
    TensorParity, compare_tensors,
};
pub use service::{ComparisonResult, PredictionService, decode_image};

/// Re-export inference types.
pub use twinfer_inference::{InferenceBackend, InferenceError, InputTensor, OutputTensor};

#[cfg(feature = "native")]
pub use twinfer_inference::OrtBackend;

#[cfg(feature = "portable")]
pub use twinfer_inference::TractBackend;
