//! Variant B: canvas-style preprocessing.
//!
//! Mirrors what a browser does after `drawImage` onto a 224×224 canvas: read
//! interleaved pixels, scale, normalize, then transpose to channel-first.

use image::{DynamicImage, RgbaImage, imageops};
use ndarray::{Array1, Array3, Array4, Axis};

use super::{INPUT_SIZE, Normalization, ResizeFilter, coerce_rgb};
use crate::error::InputError;

/// Bilinear resize, HWC normalization, CHW transpose.
#[derive(Debug, Clone)]
pub struct CanvasPreprocessor {
    normalization: Normalization,
    filter: ResizeFilter,
    size: u32,
}

impl CanvasPreprocessor {
    /// Create a preprocessor with the given constants and resize filter.
    pub fn new(normalization: Normalization, filter: ResizeFilter) -> Self {
        Self {
            normalization,
            filter,
            size: INPUT_SIZE,
        }
    }

    /// Override the output edge length.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Preprocess an image into a `1×3×size×size` tensor.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Array4<f32>, InputError> {
        let rgb = coerce_rgb(image)?;
        let resized = imageops::resize(&rgb, self.size, self.size, self.filter.into());

        let side = self.size as usize;
        let hwc = Array3::from_shape_vec((side, side, 3), resized.into_raw()).map_err(|_| {
            InputError::RawBuffer {
                len: side * side * 3,
                width: self.size,
                height: self.size,
            }
        })?;

        Ok(self.normalize_hwc(hwc))
    }

    /// Preprocess a raw RGBA buffer such as a canvas `ImageData`.
    pub fn preprocess_rgba(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Array4<f32>, InputError> {
        let mismatch = InputError::RawBuffer {
            len: data.len(),
            width,
            height,
        };
        if data.len() as u64 != width as u64 * height as u64 * 4 {
            return Err(mismatch);
        }
        let buffer = RgbaImage::from_raw(width, height, data.to_vec()).ok_or(mismatch)?;
        self.preprocess(&DynamicImage::ImageRgba8(buffer))
    }

    fn normalize_hwc(&self, hwc: Array3<u8>) -> Array4<f32> {
        let mean = Array1::from(self.normalization.mean.to_vec());
        let std = Array1::from(self.normalization.std.to_vec());

        let scaled = hwc.mapv(|v| v as f32 / 255.0);
        let normalized = (scaled - &mean) / &std;

        normalized
            .permuted_axes([2, 0, 1])
            .as_standard_layout()
            .into_owned()
            .insert_axis(Axis(0))
    }
}

impl Default for CanvasPreprocessor {
    fn default() -> Self {
        Self::new(Normalization::default(), ResizeFilter::Triangle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{IMAGENET_MEAN, IMAGENET_STD};

    #[test]
    fn test_rgba_buffer_matches_decoded_image() {
        let mut data = Vec::new();
        for i in 0..(16 * 12) {
            data.extend_from_slice(&[(i % 256) as u8, 40, 200, 255]);
        }

        let pre = CanvasPreprocessor::default();
        let from_raw = pre.preprocess_rgba(&data, 16, 12).unwrap();
        let image = DynamicImage::ImageRgba8(RgbaImage::from_raw(16, 12, data).unwrap());
        assert_eq!(from_raw, pre.preprocess(&image).unwrap());
    }

    #[test]
    fn test_rgba_buffer_length_checked() {
        let pre = CanvasPreprocessor::default();
        let err = pre.preprocess_rgba(&[0u8; 10], 4, 4).unwrap_err();
        assert!(matches!(err, InputError::RawBuffer { len: 10, .. }));
    }

    #[test]
    fn test_rgba_oversized_buffer_rejected() {
        let pre = CanvasPreprocessor::default();
        let err = pre.preprocess_rgba(&vec![7u8; 16 * 12 * 4], 4, 4).unwrap_err();
        assert!(matches!(
            err,
            InputError::RawBuffer {
                len: 768,
                width: 4,
                height: 4
            }
        ));
    }

    #[test]
    fn test_transpose_keeps_channels_apart() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            4,
            4,
            image::Rgba([255, 0, 0, 255]),
        ));
        let tensor = CanvasPreprocessor::default()
            .with_size(4)
            .preprocess(&image)
            .unwrap();

        let red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let green = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((tensor[[0, 0, 2, 3]] - red).abs() < 1e-6);
        assert!((tensor[[0, 1, 2, 3]] - green).abs() < 1e-6);
    }
}
