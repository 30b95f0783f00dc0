//! Image preprocessing for the two inference paths.
//!
//! Two independent pipelines turn the same image into a normalized
//! `1×3×H×W` tensor:
//! - [`NativePreprocessor`] writes NCHW directly after an anti-aliased resize,
//!   the way the server-side framework transform does.
//! - [`CanvasPreprocessor`] resizes like a browser drawing surface, normalizes
//!   the interleaved HWC buffer and transposes it afterwards.
//!
//! Both must agree within [`DEFAULT_TOLERANCE`]. Any residual difference may
//! only come from the resize filters, never from the normalization constants.

mod canvas;
mod native;

pub use canvas::CanvasPreprocessor;
pub use native::NativePreprocessor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::InputError;

/// ImageNet channel means (RGB).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations (RGB).
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Canonical input edge length.
pub const INPUT_SIZE: u32 = 224;

/// Max absolute element difference tolerated between the two pipelines.
pub const DEFAULT_TOLERANCE: f32 = 1e-2;

/// Per-channel normalization constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl Normalization {
    /// Normalize one channel value already scaled to [0, 1].
    #[inline]
    pub fn apply(&self, channel: usize, value: f32) -> f32 {
        (value - self.mean[channel]) / self.std[channel]
    }
}

/// Resize filters available to the pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    /// Bilinear; anti-aliased when downscaling.
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Gaussian => FilterType::Gaussian,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Which pipeline produced a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessVariant {
    /// Variant A, the native-framework transform.
    Native,
    /// Variant B, the canvas-style transform.
    Canvas,
}

/// Coerce any colour type (grayscale, alpha, 16-bit) to 8-bit RGB.
///
/// Alpha is dropped rather than composited.
pub fn coerce_rgb(image: &DynamicImage) -> Result<RgbImage, InputError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(InputError::EmptyImage { width, height });
    }

    Ok(match image {
        DynamicImage::ImageRgb8(rgb) => rgb.clone(),
        other => other.to_rgb8(),
    })
}

/// Element-wise agreement between two preprocessed tensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TensorParity {
    pub max_abs_diff: f32,
    pub mean_abs_diff: f32,
    pub tolerance: f32,
    pub within_tolerance: bool,
}

/// Compare two tensors element by element.
///
/// Tensors of different shapes never agree.
pub fn compare_tensors(a: &Array4<f32>, b: &Array4<f32>, tolerance: f32) -> TensorParity {
    if a.shape() != b.shape() {
        return TensorParity {
            max_abs_diff: f32::INFINITY,
            mean_abs_diff: f32::INFINITY,
            tolerance,
            within_tolerance: false,
        };
    }

    let mut max_abs_diff = 0.0f32;
    let mut sum = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = (x - y).abs();
        max_abs_diff = max_abs_diff.max(d);
        sum += d as f64;
    }
    let mean_abs_diff = if a.is_empty() {
        0.0
    } else {
        (sum / a.len() as f64) as f32
    };

    TensorParity {
        max_abs_diff,
        mean_abs_diff,
        tolerance,
        within_tolerance: max_abs_diff < tolerance,
    }
}
