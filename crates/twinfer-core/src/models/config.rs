//! Configuration structures for the dual-backend pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::preprocess::{IMAGENET_MEAN, IMAGENET_STD, Normalization, ResizeFilter};

/// Main configuration for twinfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinferConfig {
    /// Model artifact configuration.
    pub models: ModelConfig,

    /// Preprocessing configuration.
    pub preprocess: PreprocessConfig,

    /// Warm-up and worker pool configuration.
    pub runtime: RuntimeConfig,

    /// Parity tolerances.
    pub diagnostics: DiagnosticsConfig,
}

/// Model artifact paths and topology constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory containing model files.
    pub model_dir: PathBuf,

    /// Artifact loaded by the native backend. May reference external data.
    pub native_model: String,

    /// Artifact loaded by the portable backend. Must be self-contained.
    pub portable_model: String,

    /// Number of output classes.
    pub num_classes: usize,

    /// Square input edge length in pixels.
    pub input_size: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            native_model: "resnet18.onnx".to_string(),
            portable_model: "resnet18.single.onnx".to_string(),
            num_classes: 1000,
            input_size: 224,
        }
    }
}

/// Preprocessing constants shared by both pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Per-channel mean (RGB).
    pub mean: [f32; 3],

    /// Per-channel standard deviation (RGB).
    pub std: [f32; 3],

    /// Resize filter of the native pipeline.
    pub native_filter: ResizeFilter,

    /// Resize filter of the canvas pipeline.
    pub canvas_filter: ResizeFilter,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            native_filter: ResizeFilter::Triangle,
            canvas_filter: ResizeFilter::Triangle,
        }
    }
}

impl PreprocessConfig {
    /// Normalization constants as a value type.
    pub fn normalization(&self) -> Normalization {
        Normalization {
            mean: self.mean,
            std: self.std,
        }
    }
}

/// Warm-up and request pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Dummy inferences per backend before traffic is admitted.
    pub warmup_iterations: usize,

    /// Maximum concurrent inferences.
    pub max_workers: usize,

    /// Threads used inside a single native operator.
    pub intra_threads: usize,

    /// Deadline applied at the request boundary, if any.
    pub request_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 5,
            max_workers: 4,
            intra_threads: 4,
            request_timeout_ms: None,
        }
    }
}

/// Numeric tolerances used when judging parity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Max absolute element difference allowed between the two preprocessed tensors.
    pub preprocess_tolerance: f32,

    /// Max L2 distance between the two backends' logits.
    pub logit_l2_tolerance: f64,

    /// Max L2 distance between the two backends' probabilities.
    pub probability_l2_tolerance: f64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            preprocess_tolerance: 1e-2,
            logit_l2_tolerance: 0.05,
            probability_l2_tolerance: 1e-3,
        }
    }
}

impl TwinferConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        std::fs::write(path, content)
    }

    /// Get full path to a model file.
    pub fn model_path(&self, model_name: &str) -> PathBuf {
        self.models.model_dir.join(model_name)
    }

    /// Path of the native backend's artifact.
    pub fn native_model_path(&self) -> PathBuf {
        self.model_path(&self.models.native_model)
    }

    /// Path of the portable backend's artifact.
    pub fn portable_model_path(&self) -> PathBuf {
        self.model_path(&self.models.portable_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: TwinferConfig =
            serde_json::from_str(r#"{"runtime": {"warmup_iterations": 2}}"#).unwrap();
        assert_eq!(config.runtime.warmup_iterations, 2);
        assert_eq!(config.runtime.max_workers, 4);
        assert_eq!(config.models.num_classes, 1000);
        assert_eq!(config.preprocess.mean, IMAGENET_MEAN);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = TwinferConfig::default();
        config.models.model_dir = PathBuf::from("/srv/models");
        config.save(&path).unwrap();

        let loaded = TwinferConfig::from_file(&path).unwrap();
        assert_eq!(
            loaded.portable_model_path(),
            PathBuf::from("/srv/models/resnet18.single.onnx")
        );
    }
}
