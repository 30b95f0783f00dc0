//! WASM bindings for in-browser classification.
//!
//! The browser runs only the portable backend. The model arrives as one
//! fetched byte buffer, so it must be self-contained; [`inspect_artifact`]
//! tells the page up front when it is not.

use wasm_bindgen::prelude::*;

use twinfer_core::artifact::ArtifactSummary;
use twinfer_core::{
    BackendKind, CanvasPreprocessor, Clock, LifecycleState, ModelSpec, Normalization,
    PredictionResponse, PredictionResult, RequestTimer, ResizeFilter, ScoreVector, Stage,
    TractBackend, TwinferError, WarmupController, WarmupReport, decode_image, softmax,
};
use twinfer_core::{InferenceBackend, InferenceError};

/// Initialize panic hook for better error messages in console.
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Version information.
#[wasm_bindgen]
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// `performance.now()`, or `Date.now()` where no window exists.
struct PerformanceClock;

impl Clock for PerformanceClock {
    fn now_ms(&self) -> f64 {
        web_sys::window()
            .and_then(|w| w.performance())
            .map(|p| p.now())
            .unwrap_or_else(js_sys::Date::now)
    }
}

fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, JsError> {
    serde_wasm_bindgen::to_value(value).map_err(|e| JsError::new(&e.to_string()))
}

/// Summarize a model buffer: opset, initializers and any external data
/// references the browser could never resolve.
#[wasm_bindgen]
pub fn inspect_artifact(model_bytes: &[u8]) -> Result<JsValue, JsError> {
    let summary = ArtifactSummary::parse(model_bytes).map_err(|e| JsError::new(&e.to_string()))?;
    to_js(&summary)
}

/// Portable-backend classifier for browser use.
#[wasm_bindgen]
pub struct BrowserClassifier {
    backend: TractBackend,
    preprocessor: CanvasPreprocessor,
    lifecycle: WarmupController,
    clock: Box<dyn Clock>,
    spec: ModelSpec,
}

#[wasm_bindgen]
impl BrowserClassifier {
    /// Load a self-contained model from its bytes.
    #[wasm_bindgen(constructor)]
    pub fn new(model_bytes: &[u8]) -> Result<BrowserClassifier, JsError> {
        Self::with_clock(model_bytes, Box::new(PerformanceClock))
            .map_err(|e| JsError::new(&e.to_string()))
    }

    /// Run `iterations` discarded inferences. Classification is refused
    /// until this has been called once.
    #[wasm_bindgen(js_name = warmUp)]
    pub fn warm_up(&mut self, iterations: usize) -> Result<JsValue, JsError> {
        let report = self.warm_up_report(iterations);
        if report.degraded() {
            web_sys::console::warn_1(
                &format!(
                    "warm-up degraded: {}/{} runs succeeded",
                    report.completed, report.requested
                )
                .into(),
            );
        }
        to_js(&report)
    }

    /// Whether warm-up has completed.
    #[wasm_bindgen(getter)]
    pub fn ready(&self) -> bool {
        self.lifecycle.state(BackendKind::Portable) == LifecycleState::Ready
    }

    /// Classify a canvas `ImageData` buffer (RGBA, row-major).
    #[wasm_bindgen(js_name = classifyRgba)]
    pub fn classify_rgba(&self, data: &[u8], width: u32, height: u32) -> Result<JsValue, JsError> {
        let result = self
            .classify_pixels(data, width, height)
            .map_err(|e| JsError::new(&e.to_string()))?;
        to_js(&PredictionResponse::from(&result))
    }

    /// Classify an encoded image (PNG, JPEG, ...).
    #[wasm_bindgen(js_name = classifyImage)]
    pub fn classify_image(&self, bytes: &[u8]) -> Result<JsValue, JsError> {
        let result = self
            .classify_encoded(bytes)
            .map_err(|e| JsError::new(&e.to_string()))?;
        to_js(&PredictionResponse::from(&result))
    }
}

impl BrowserClassifier {
    fn with_clock(model_bytes: &[u8], clock: Box<dyn Clock>) -> Result<Self, TwinferError> {
        let summary = ArtifactSummary::parse(model_bytes)?;
        if summary.external_data_present() {
            return Err(TwinferError::BackendUnavailable {
                backend: BackendKind::Portable,
                reason: format!(
                    "{} initializers reference external data the browser cannot fetch",
                    summary.external_tensor_count()
                ),
            });
        }

        let spec = ModelSpec::default();
        let backend = TractBackend::from_bytes_with_shape(model_bytes, &spec.input_shape())?;

        Ok(Self {
            backend,
            preprocessor: CanvasPreprocessor::new(Normalization::default(), ResizeFilter::Triangle),
            lifecycle: WarmupController::new(0),
            clock,
            spec,
        })
    }

    fn warm_up_report(&mut self, iterations: usize) -> WarmupReport {
        self.lifecycle = WarmupController::new(iterations);
        let shape = self.spec.input_shape();
        self.lifecycle
            .warm_up(BackendKind::Portable, &self.backend, &shape, self.clock.as_ref())
    }

    fn ensure_ready(&self) -> Result<(), TwinferError> {
        if self.ready() {
            Ok(())
        } else {
            Err(TwinferError::NotReady(BackendKind::Portable))
        }
    }

    fn classify_pixels(&self, data: &[u8], width: u32, height: u32) -> Result<PredictionResult, TwinferError> {
        self.ensure_ready()?;
        let mut timer = RequestTimer::start(self.clock.as_ref());
        let tensor = timer.measure(Stage::Preprocess, || {
            self.preprocessor.preprocess_rgba(data, width, height)
        })?;
        self.finish(tensor.into(), timer)
    }

    fn classify_encoded(&self, bytes: &[u8]) -> Result<PredictionResult, TwinferError> {
        self.ensure_ready()?;
        let mut timer = RequestTimer::start(self.clock.as_ref());
        let image = timer.measure(Stage::Decode, || decode_image(bytes))?;
        let tensor = timer.measure(Stage::Preprocess, || self.preprocessor.preprocess(&image))?;
        self.finish(tensor.into(), timer)
    }

    fn finish(
        &self,
        tensor: twinfer_core::InputTensor,
        mut timer: RequestTimer<'_>,
    ) -> Result<PredictionResult, TwinferError> {
        let output = timer.measure(Stage::Inference, || self.backend.run(&tensor))?;
        let scores = ScoreVector::new(output.into_scores()?);
        if scores.len() != self.spec.num_classes {
            return Err(InferenceError::OutputExtraction(format!(
                "portable backend returned {} scores, expected {}",
                scores.len(),
                self.spec.num_classes
            ))
            .into());
        }

        let top = softmax(&scores).top1().ok_or(TwinferError::ScoreLength {
            left: scores.len(),
            right: self.spec.num_classes,
        })?;

        Ok(PredictionResult {
            class_id: top.class_id,
            probability: top.probability,
            latency: timer.finish(),
            backend: BackendKind::Portable,
        })
    }
}
