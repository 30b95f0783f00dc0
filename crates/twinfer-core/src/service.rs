//! The request boundary.
//!
//! A [`PredictionService`] owns a warmed-up [`DualExecutor`] and turns raw
//! image bytes into a [`PredictionResult`]. Everything a request touches is
//! either immutable shared state or owned by the request itself, so concurrent
//! requests never see each other's timings or tensors.

use std::sync::Arc;

use image::DynamicImage;
use ndarray::Ix4;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use twinfer_inference::InputTensor;

use crate::diagnostics::{DivergenceReport, compare_scores, softmax};
use crate::error::{InputError, Result, TwinferError};
use crate::executor::{BackendKind, DualExecutor, ScoreVector};
use crate::latency::{
    Clock, LatencyBreakdown, MonotonicClock, RequestTimer, Stage, WarmupController, WarmupReport,
};
use crate::models::config::TwinferConfig;
use crate::models::prediction::PredictionResult;
use crate::preprocess::{
    CanvasPreprocessor, NativePreprocessor, PreprocessVariant, TensorParity, compare_tensors,
};

/// Both backends run on the same image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub native: PredictionResult,
    pub portable: PredictionResult,
    pub divergence: DivergenceReport,
    /// Agreement of the two preprocessing pipelines on this image.
    pub preprocess_parity: TensorParity,
}

/// Decode encoded image bytes (PNG, JPEG, ...).
pub fn decode_image(bytes: &[u8]) -> std::result::Result<DynamicImage, InputError> {
    if bytes.is_empty() {
        return Err(InputError::Decode("empty request body".to_string()));
    }
    image::load_from_memory(bytes).map_err(|e| InputError::Decode(e.to_string()))
}

/// Classification service over both backends.
pub struct PredictionService {
    executor: DualExecutor,
    native_preprocessor: NativePreprocessor,
    canvas_preprocessor: CanvasPreprocessor,
    preprocess_tolerance: f32,
    clock: Arc<dyn Clock>,
    lifecycle: WarmupController,
    warmup: Vec<WarmupReport>,
    #[cfg(feature = "runtime")]
    permits: Arc<tokio::sync::Semaphore>,
    #[cfg(feature = "runtime")]
    max_workers: usize,
    #[cfg(feature = "runtime")]
    timeout_ms: Option<u64>,
}

impl PredictionService {
    /// Warm up both backends, then return a service ready for traffic.
    pub fn start(executor: DualExecutor, config: &TwinferConfig) -> Arc<Self> {
        Self::start_with_clock(executor, config, Arc::new(MonotonicClock::new()))
    }

    /// [`PredictionService::start`] with an explicit clock.
    pub fn start_with_clock(
        executor: DualExecutor,
        config: &TwinferConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let norm = config.preprocess.normalization();
        let size = executor.spec().input_size as u32;

        let mut lifecycle = WarmupController::new(config.runtime.warmup_iterations);
        let warmup = lifecycle.warm_up_executor(&executor, clock.as_ref());
        info!(
            "Prediction service ready ({} warm-up runs per backend)",
            lifecycle.iterations()
        );

        #[cfg(feature = "runtime")]
        let max_workers = config.runtime.max_workers.max(1);

        Arc::new(Self {
            executor,
            native_preprocessor: NativePreprocessor::new(norm, config.preprocess.native_filter)
                .with_size(size),
            canvas_preprocessor: CanvasPreprocessor::new(norm, config.preprocess.canvas_filter)
                .with_size(size),
            preprocess_tolerance: config.diagnostics.preprocess_tolerance,
            clock,
            lifecycle,
            warmup,
            #[cfg(feature = "runtime")]
            permits: Arc::new(tokio::sync::Semaphore::new(max_workers)),
            #[cfg(feature = "runtime")]
            max_workers,
            #[cfg(feature = "runtime")]
            timeout_ms: config.runtime.request_timeout_ms,
        })
    }

    /// Reports from the warm-up performed at start.
    pub fn warmup_reports(&self) -> &[WarmupReport] {
        &self.warmup
    }

    pub fn executor(&self) -> &DualExecutor {
        &self.executor
    }

    /// Preprocess with one pipeline.
    pub fn preprocess(
        &self,
        image: &DynamicImage,
        variant: PreprocessVariant,
    ) -> std::result::Result<InputTensor, InputError> {
        let tensor = match variant {
            PreprocessVariant::Native => self.native_preprocessor.preprocess(image)?,
            PreprocessVariant::Canvas => self.canvas_preprocessor.preprocess(image)?,
        };
        Ok(tensor.into())
    }

    fn ensure_ready(&self, kind: BackendKind) -> Result<()> {
        if self.lifecycle.is_ready() {
            Ok(())
        } else {
            Err(TwinferError::NotReady(kind))
        }
    }

    fn classify(
        &self,
        image: &DynamicImage,
        kind: BackendKind,
        timer: &mut RequestTimer<'_>,
    ) -> Result<(PredictionResult, ScoreVector, InputTensor)> {
        let tensor =
            timer.measure(Stage::Preprocess, || self.preprocess(image, kind.default_variant()))?;
        let scores = timer.measure(Stage::Inference, || self.executor.infer(&tensor, kind))?;

        let top = softmax(&scores).top1().ok_or(TwinferError::ScoreLength {
            left: scores.len(),
            right: self.executor.spec().num_classes,
        })?;

        let result = PredictionResult {
            class_id: top.class_id,
            probability: top.probability,
            latency: LatencyBreakdown::default(),
            backend: kind,
        };
        Ok((result, scores, tensor))
    }

    /// Classify one encoded image with one backend.
    ///
    /// A bad request fails on its own; the backends and every other request
    /// are unaffected.
    pub fn predict(&self, bytes: &[u8], kind: BackendKind) -> Result<PredictionResult> {
        self.ensure_ready(kind)?;

        let mut timer = RequestTimer::start(self.clock.as_ref());
        let outcome = timer
            .measure(Stage::Decode, || decode_image(bytes))
            .map_err(TwinferError::from)
            .and_then(|image| self.classify(&image, kind, &mut timer));

        let (mut result, _, _) = outcome.inspect_err(|e| {
            if e.is_input_error() {
                debug!("Rejected {} request: {}", kind, e);
            } else {
                warn!("{} request failed: {}", kind, e);
            }
        })?;

        result.latency = timer.finish();
        debug!(
            "{} predicted class {} (p={:.4}) in {:.2}ms",
            kind, result.class_id, result.probability, result.latency.total_ms
        );
        Ok(result)
    }

    /// Run both backends on the same image and measure how far they drift.
    pub fn compare(&self, bytes: &[u8]) -> Result<ComparisonResult> {
        self.ensure_ready(BackendKind::Native)?;

        let mut decode_timer = RequestTimer::start(self.clock.as_ref());
        let image = decode_timer.measure(Stage::Decode, || decode_image(bytes))?;
        let decode_ms = decode_timer.finish().decode_ms;

        let run = |kind: BackendKind| -> Result<(PredictionResult, ScoreVector, InputTensor)> {
            let mut timer = RequestTimer::start(self.clock.as_ref());
            let (mut result, scores, tensor) = self.classify(&image, kind, &mut timer)?;
            let latency = timer.finish();
            result.latency = LatencyBreakdown {
                decode_ms,
                total_ms: latency.total_ms + decode_ms,
                ..latency
            };
            Ok((result, scores, tensor))
        };

        let (native, native_scores, native_tensor) = run(BackendKind::Native)?;
        let (portable, portable_scores, portable_tensor) = run(BackendKind::Portable)?;

        let divergence = compare_scores(&native_scores, &portable_scores)?;
        let preprocess_parity = match (
            native_tensor.view().view().into_dimensionality::<Ix4>(),
            portable_tensor.view().view().into_dimensionality::<Ix4>(),
        ) {
            (Ok(a), Ok(b)) => compare_tensors(&a.to_owned(), &b.to_owned(), self.preprocess_tolerance),
            _ => TensorParity {
                max_abs_diff: f32::INFINITY,
                mean_abs_diff: f32::INFINITY,
                tolerance: self.preprocess_tolerance,
                within_tolerance: false,
            },
        };

        if !divergence.top1_agreement {
            warn!(
                "Backends disagree: native={} portable={} (logit L2 {:.4})",
                divergence.native.class_id, divergence.portable.class_id, divergence.logit_l2_diff
            );
        }

        Ok(ComparisonResult {
            native,
            portable,
            divergence,
            preprocess_parity,
        })
    }

    /// Maximum number of inferences running at once.
    #[cfg(feature = "runtime")]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// [`PredictionService::predict`] on the blocking pool, bounded by the
    /// worker limit.
    ///
    /// The optional deadline covers queueing and inference. A request that
    /// times out stops waiting, but an inference already running finishes in
    /// the background and keeps its worker slot until then.
    #[cfg(feature = "runtime")]
    pub async fn predict_async(
        self: Arc<Self>,
        bytes: Vec<u8>,
        kind: BackendKind,
    ) -> Result<PredictionResult> {
        let timeout_ms = self.timeout_ms;

        let work = async move {
            let permit = self.permits.clone().acquire_owned().await.map_err(|e| {
                TwinferError::Inference(twinfer_inference::InferenceError::InferenceFailed(
                    format!("worker pool closed: {}", e),
                ))
            })?;

            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                self.predict(&bytes, kind)
            })
            .await
            .map_err(|e| {
                TwinferError::Inference(twinfer_inference::InferenceError::InferenceFailed(
                    format!("inference worker failed: {}", e),
                ))
            })?
        };

        match timeout_ms {
            Some(ms) => tokio::time::timeout(std::time::Duration::from_millis(ms), work)
                .await
                .map_err(|_| {
                    warn!("{} request timed out after {}ms", kind, ms);
                    TwinferError::Timeout(ms)
                })?,
            None => work.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{GrayImage, ImageFormat, Luma, RgbImage};

    use super::*;
    use crate::executor::ModelSpec;
    use crate::executor::fakes::LinearBackend;
    use crate::latency::test_clock::StepClock;
    use crate::preprocess::test_images;
    use pretty_assertions::assert_eq;

    fn png(image: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn config(warmup: usize) -> TwinferConfig {
        let mut config = TwinferConfig::default();
        config.runtime.warmup_iterations = warmup;
        config
    }

    fn service_with(
        native: Arc<LinearBackend>,
        portable: Arc<LinearBackend>,
    ) -> Arc<PredictionService> {
        let executor = DualExecutor::new(native, portable, ModelSpec::default());
        PredictionService::start(executor, &config(2))
    }

    fn service() -> Arc<PredictionService> {
        service_with(
            Arc::new(LinearBackend::new(1000, 0.001)),
            Arc::new(LinearBackend::new(1000, 0.001)),
        )
    }

    #[test]
    fn test_start_warms_up_both_backends() {
        let native = Arc::new(LinearBackend::new(1000, 0.0));
        let portable = Arc::new(LinearBackend::new(1000, 0.0));
        let service = service_with(native.clone(), portable.clone());

        assert_eq!(service.warmup_reports().len(), 2);
        assert_eq!(native.calls(), 2);
        assert_eq!(portable.calls(), 2);
    }

    #[test]
    fn test_black_image_is_deterministic() {
        let service = service();
        let bytes = png(&DynamicImage::ImageRgb8(RgbImage::new(224, 224)));

        for kind in BackendKind::ALL {
            let a = service.predict(&bytes, kind).unwrap();
            let b = service.predict(&bytes, kind).unwrap();
            assert_eq!(a.class_id, b.class_id);
            assert_eq!(a.probability, b.probability);
            assert!(a.class_id < 1000);
            assert!((0.0..=1.0).contains(&a.probability));
            assert_eq!(a.backend, kind);
        }
    }

    #[test]
    fn test_black_image_backends_agree() {
        let service = service();
        let bytes = png(&DynamicImage::ImageRgb8(RgbImage::new(224, 224)));

        let cmp = service.compare(&bytes).unwrap();
        assert_eq!(cmp.preprocess_parity.max_abs_diff, 0.0);
        assert!(cmp.divergence.top1_agreement);
        assert_eq!(cmp.native.class_id, cmp.portable.class_id);
        assert!(cmp.divergence.logit_l2_diff < 1e-6);
        assert!((cmp.native.probability - cmp.portable.probability).abs() < 1e-6);
    }

    #[test]
    fn test_tiny_and_grayscale_inputs() {
        let service = service();
        let one_pixel = png(&test_images::rgba(1, 1, [200, 10, 10, 0]));
        let gray = png(&DynamicImage::ImageLuma8(GrayImage::from_pixel(31, 17, Luma([90]))));

        for bytes in [one_pixel, gray] {
            for kind in BackendKind::ALL {
                assert!(service.predict(&bytes, kind).is_ok());
            }
        }
    }

    #[test]
    fn test_bad_bytes_are_input_errors() {
        let native = Arc::new(LinearBackend::new(1000, 0.0));
        let service = service_with(native.clone(), Arc::new(LinearBackend::new(1000, 0.0)));
        let before = native.calls();

        for bytes in [&b""[..], &b"definitely not a png"[..]] {
            let err = service.predict(bytes, BackendKind::Native).unwrap_err();
            assert!(err.is_input_error(), "{err}");
        }
        assert_eq!(native.calls(), before);

        let ok = png(&test_images::gradient(64, 48));
        assert!(service.predict(&ok, BackendKind::Native).is_ok());
    }

    #[test]
    fn test_latency_breakdown_is_per_request() {
        let executor = DualExecutor::new(
            Arc::new(LinearBackend::new(1000, 0.0)),
            Arc::new(LinearBackend::new(1000, 0.0)),
            ModelSpec::default(),
        );
        let clock = Arc::new(StepClock::new(5));
        let service = PredictionService::start_with_clock(executor, &config(0), clock);
        let bytes = png(&test_images::gradient(32, 32));

        let first = service.predict(&bytes, BackendKind::Portable).unwrap();
        let second = service.predict(&bytes, BackendKind::Portable).unwrap();
        // start + 3 stages (2 reads each) + finish = 8 reads, 7 steps
        assert_eq!(first.latency.total_ms, 35.0);
        assert_eq!(first.latency, second.latency);
        assert_eq!(first.latency.inference_ms, 5.0);
    }

    #[test]
    fn test_compare_reports_parity() {
        let service = service();
        let bytes = png(&test_images::noise(300, 200, 7));

        let cmp = service.compare(&bytes).unwrap();
        assert_eq!(cmp.native.backend, BackendKind::Native);
        assert_eq!(cmp.portable.backend, BackendKind::Portable);
        assert!(cmp.preprocess_parity.within_tolerance, "{:?}", cmp.preprocess_parity);
        assert!(cmp.divergence.top1_agreement);
        assert!(cmp.native.latency.decode_ms >= 0.0);
    }

    #[test]
    fn test_compare_flags_divergent_backends() {
        let service = service_with(
            Arc::new(LinearBackend::new(1000, 0.01)),
            Arc::new(LinearBackend::new(1000, -0.01)),
        );
        let bytes = png(&test_images::gradient(64, 64));

        let cmp = service.compare(&bytes).unwrap();
        assert!(!cmp.divergence.top1_agreement);
        assert!(cmp.divergence.logit_l2_diff > 1.0);
    }

    #[cfg(feature = "runtime")]
    struct SlowBackend {
        inner: LinearBackend,
        delay: std::time::Duration,
        running: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[cfg(feature = "runtime")]
    impl SlowBackend {
        fn new(delay_ms: u64) -> Self {
            Self {
                inner: LinearBackend::new(1000, 0.0),
                delay: std::time::Duration::from_millis(delay_ms),
                running: Default::default(),
                peak: Default::default(),
            }
        }
    }

    #[cfg(feature = "runtime")]
    impl twinfer_inference::InferenceBackend for SlowBackend {
        fn run(
            &self,
            input: &InputTensor,
        ) -> twinfer_inference::Result<twinfer_inference::OutputTensor> {
            use std::sync::atomic::Ordering;
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.inner.run(input)
        }

        fn runtime_name(&self) -> &'static str {
            "slow"
        }
    }

    #[cfg(feature = "runtime")]
    fn slow_service(
        delay_ms: u64,
        max_workers: usize,
        timeout_ms: Option<u64>,
    ) -> (Arc<PredictionService>, Arc<SlowBackend>) {
        let slow = Arc::new(SlowBackend::new(delay_ms));
        let executor = DualExecutor::new(
            slow.clone(),
            Arc::new(LinearBackend::new(1000, 0.0)),
            ModelSpec::default(),
        );
        let mut config = config(0);
        config.runtime.max_workers = max_workers;
        config.runtime.request_timeout_ms = timeout_ms;
        (PredictionService::start(executor, &config), slow)
    }

    #[cfg(feature = "runtime")]
    #[tokio::test]
    async fn test_async_requests_are_bounded() {
        let (service, slow) = slow_service(20, 2, None);
        let bytes = png(&test_images::gradient(16, 16));

        let handles: Vec<_> = (0..6)
            .map(|_| tokio::spawn(service.clone().predict_async(bytes.clone(), BackendKind::Native)))
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(service.max_workers(), 2);
        assert!(slow.peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }

    #[cfg(feature = "runtime")]
    #[tokio::test]
    async fn test_async_timeout() {
        let (service, _) = slow_service(300, 1, Some(20));
        let bytes = png(&test_images::gradient(16, 16));

        let err = service
            .clone()
            .predict_async(bytes.clone(), BackendKind::Native)
            .await
            .unwrap_err();
        assert!(matches!(err, TwinferError::Timeout(20)));

        // the deadline only applies at the async boundary
        assert!(service.predict(&bytes, BackendKind::Portable).is_ok());
    }
}
