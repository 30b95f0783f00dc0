//! Dual-backend inference executor.
//!
//! Both forms of the classification model are loaded once, eagerly, and then
//! shared read-only. Each request picks a [`BackendKind`]; the executor checks
//! the tensor shape before any backend sees it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InputError, Result, TwinferError};
use crate::preprocess::PreprocessVariant;
use twinfer_inference::{IMAGE_INPUT_SHAPE, InferenceBackend, InferenceError, InputTensor};

/// One of the two interchangeable executable forms of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process native tensor runtime.
    Native,
    /// Portable serialized-graph runtime.
    Portable,
}

impl BackendKind {
    /// Both backends, in warm-up order.
    pub const ALL: [BackendKind; 2] = [BackendKind::Native, BackendKind::Portable];

    /// Human readable label reported as the response `mode`.
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Native => "Native (onnxruntime)",
            BackendKind::Portable => "Portable (tract)",
        }
    }

    /// Preprocessing pipeline paired with this backend.
    pub fn default_variant(&self) -> PreprocessVariant {
        match self {
            BackendKind::Native => PreprocessVariant::Native,
            BackendKind::Portable => PreprocessVariant::Canvas,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Portable => write!(f, "portable"),
        }
    }
}

/// Raw class scores produced by one backend for one input.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreVector(Vec<f32>);

impl ScoreVector {
    pub fn new(scores: Vec<f32>) -> Self {
        Self(scores)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f32>> for ScoreVector {
    fn from(scores: Vec<f32>) -> Self {
        Self(scores)
    }
}

/// Fixed topology constants of the classification model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub num_classes: usize,
    pub input_size: usize,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            num_classes: 1000,
            input_size: IMAGE_INPUT_SHAPE[3],
        }
    }
}

impl ModelSpec {
    /// NCHW input shape with a batch of one.
    pub fn input_shape(&self) -> [usize; 4] {
        [1, 3, self.input_size, self.input_size]
    }
}

/// Holds both loaded backends and runs either against a tensor.
#[derive(Clone)]
pub struct DualExecutor {
    native: Arc<dyn InferenceBackend>,
    portable: Arc<dyn InferenceBackend>,
    spec: ModelSpec,
}

impl DualExecutor {
    /// Wrap two already-loaded backends.
    pub fn new(
        native: Arc<dyn InferenceBackend>,
        portable: Arc<dyn InferenceBackend>,
        spec: ModelSpec,
    ) -> Self {
        Self {
            native,
            portable,
            spec,
        }
    }

    /// Eagerly load both backends from the configured artifacts.
    ///
    /// The portable artifact is checked for external data first: the portable
    /// runtime receives one buffer and could never resolve a side file.
    #[cfg(all(feature = "native", feature = "portable"))]
    pub fn load(config: &crate::models::config::TwinferConfig) -> Result<Self> {
        use tracing::info;
        use twinfer_inference::{OrtBackend, OrtOptions, TractBackend};

        let spec = ModelSpec {
            num_classes: config.models.num_classes,
            input_size: config.models.input_size as usize,
        };

        let native_path = config.native_model_path();
        let options = OrtOptions {
            intra_threads: config.runtime.intra_threads,
            ..OrtOptions::default()
        };
        let native = OrtBackend::from_file(&native_path, options).map_err(|e| {
            TwinferError::BackendUnavailable {
                backend: BackendKind::Native,
                reason: format!("{}: {}", native_path.display(), e),
            }
        })?;
        info!("Loaded native backend from {}", native_path.display());

        let portable_path = config.portable_model_path();
        let unavailable = |reason: String| TwinferError::BackendUnavailable {
            backend: BackendKind::Portable,
            reason: format!("{}: {}", portable_path.display(), reason),
        };
        let bytes = std::fs::read(&portable_path).map_err(|e| unavailable(e.to_string()))?;
        let summary = crate::artifact::ArtifactSummary::parse(&bytes)
            .map_err(|e| unavailable(e.to_string()))?;
        if summary.external_data_present() {
            return Err(unavailable(format!(
                "{} initializers reference external data; run `twinfer artifact consolidate` first",
                summary.external_tensor_count()
            )));
        }
        let portable = TractBackend::from_bytes_with_shape(&bytes, &spec.input_shape())
            .map_err(|e| unavailable(e.to_string()))?;
        info!("Loaded portable backend from {}", portable_path.display());

        Ok(Self::new(Arc::new(native), Arc::new(portable), spec))
    }

    /// Topology constants.
    pub fn spec(&self) -> ModelSpec {
        self.spec
    }

    /// Borrow one backend.
    pub fn backend(&self, kind: BackendKind) -> &dyn InferenceBackend {
        match kind {
            BackendKind::Native => self.native.as_ref(),
            BackendKind::Portable => self.portable.as_ref(),
        }
    }

    /// Run one backend against a preprocessed tensor.
    pub fn infer(&self, tensor: &InputTensor, kind: BackendKind) -> Result<ScoreVector> {
        let expected = self.spec.input_shape();
        if tensor.shape() != expected {
            return Err(InputError::Shape {
                expected: expected.to_vec(),
                actual: tensor.shape().to_vec(),
            }
            .into());
        }

        let backend = self.backend(kind);
        let output = backend.run(tensor)?;
        let scores = output.into_scores()?;

        if scores.len() != self.spec.num_classes {
            return Err(InferenceError::OutputExtraction(format!(
                "{} backend returned {} scores, expected {}",
                kind,
                scores.len(),
                self.spec.num_classes
            ))
            .into());
        }

        debug!("{} inference via {} complete", kind, backend.runtime_name());
        Ok(ScoreVector(scores))
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use twinfer_inference::{InferenceBackend, InferenceError, InputTensor, OutputTensor};

    /// Deterministic stand-in for a classifier.
    ///
    /// Score `k` is the mean of every `k`-th input element plus `bias * k`,
    /// so the output depends on the whole tensor but stays cheap.
    pub struct LinearBackend {
        pub num_classes: usize,
        pub bias: f32,
        pub fail_first: usize,
        pub calls: AtomicUsize,
    }

    impl LinearBackend {
        pub fn new(num_classes: usize, bias: f32) -> Self {
            Self {
                num_classes,
                bias,
                fail_first: 0,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing_first(mut self, n: usize) -> Self {
            self.fail_first = n;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl InferenceBackend for LinearBackend {
        fn run(&self, input: &InputTensor) -> twinfer_inference::Result<OutputTensor> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(InferenceError::InferenceFailed("kernel not compiled".into()));
            }

            let data = input.view();
            let n = data.len().max(1) as f32;
            let sum: f32 = data.iter().sum();
            let scores = (0..self.num_classes)
                .map(|k| sum / n * ((k % 7) as f32 - 3.0) + self.bias * k as f32)
                .collect();
            OutputTensor::from_shape_vec(&[1, self.num_classes], scores)
        }

        fn runtime_name(&self) -> &'static str {
            "linear"
        }
    }
}
