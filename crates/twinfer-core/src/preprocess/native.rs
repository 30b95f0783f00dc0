//! Variant A: native-framework preprocessing.

use image::DynamicImage;
use ndarray::Array4;
use tracing::trace;

use super::{INPUT_SIZE, Normalization, ResizeFilter, coerce_rgb};
use crate::error::InputError;

/// Resize without cropping, scale to [0, 1] and normalize straight into NCHW.
#[derive(Debug, Clone)]
pub struct NativePreprocessor {
    normalization: Normalization,
    filter: ResizeFilter,
    size: u32,
}

impl NativePreprocessor {
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
        let rgb = DynamicImage::ImageRgb8(coerce_rgb(image)?);
        let resized = rgb
            .resize_exact(self.size, self.size, self.filter.into())
            .to_rgb8();
        trace!(
            "native resize {}x{} -> {}x{}",
            image.width(),
            image.height(),
            self.size,
            self.size
        );

        let side = self.size as usize;
        let norm = self.normalization;
        let tensor = Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let value = resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            norm.apply(c, value)
        });

        Ok(tensor)
    }
}

impl Default for NativePreprocessor {
    fn default() -> Self {
        Self::new(Normalization::default(), ResizeFilter::Triangle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::test_images::gradient;

    #[test]
    fn test_output_is_channel_first() {
        let tensor = NativePreprocessor::default()
            .preprocess(&gradient(224, 224))
            .unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);

        // Red ramps along x, green along y.
        assert!(tensor[[0, 0, 0, 200]] > tensor[[0, 0, 0, 10]]);
        assert!(tensor[[0, 1, 200, 0]] > tensor[[0, 1, 10, 0]]);
    }

    #[test]
    fn test_custom_size() {
        let tensor = NativePreprocessor::default()
            .with_size(32)
            .preprocess(&gradient(64, 48))
            .unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);
    }
}
