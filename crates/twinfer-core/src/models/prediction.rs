//! Prediction results and their response shape.

use serde::{Deserialize, Serialize};

use crate::executor::BackendKind;
use crate::latency::LatencyBreakdown;

/// Outcome of one classification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Index of the most likely class.
    pub class_id: usize,

    /// Softmax probability of `class_id`.
    pub probability: f32,

    /// Per-stage timings of this request only.
    pub latency: LatencyBreakdown,

    /// Which backend produced the scores.
    pub backend: BackendKind,
}

impl PredictionResult {
    /// Human readable backend label, e.g. `Native (onnxruntime)`.
    pub fn backend_label(&self) -> &'static str {
        self.backend.label()
    }
}

/// Flat response body returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub class_id: usize,
    pub probability: f32,
    /// End-to-end request time.
    pub latency_ms: f64,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub mode: String,
}

impl From<&PredictionResult> for PredictionResponse {
    fn from(result: &PredictionResult) -> Self {
        Self {
            class_id: result.class_id,
            probability: result.probability,
            latency_ms: result.latency.total_ms,
            preprocess_ms: result.latency.preprocess_ms,
            inference_ms: result.latency.inference_ms,
            mode: result.backend_label().to_string(),
        }
    }
}

impl From<PredictionResult> for PredictionResponse {
    fn from(result: PredictionResult) -> Self {
        Self::from(&result)
    }
}
