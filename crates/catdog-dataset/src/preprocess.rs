//! Resizing, CHW layout and backbone-specific pixel normalisation.

use catdog_core::{ImageDimensions, ImageConfig, Normalization};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

/// ImageNet channel means on the 0-255 scale, BGR order
pub const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];
/// ImageNet channel means on the 0-1 scale, RGB order
pub const TORCH_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const TORCH_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// In-place pixel normalisation on CHW buffers of 0-255 RGB values
pub trait NormalizationExt {
    fn apply(&self, chw: &mut [f32], plane: usize);
    /// Back to 0-255 RGB, for inspecting model inputs
    fn invert(&self, chw: &mut [f32], plane: usize);
}

impl NormalizationExt for Normalization {
    fn apply(&self, chw: &mut [f32], plane: usize) {
        match self {
            Normalization::None => {}
            Normalization::Caffe => {
                // RGB -> BGR, then subtract the per-channel mean.
                let (r, rest) = chw.split_at_mut(plane);
                let b = &mut rest[plane..2 * plane];
                r.swap_with_slice(b);
                for (c, mean) in CAFFE_MEAN_BGR.iter().enumerate() {
                    for v in &mut chw[c * plane..(c + 1) * plane] {
                        *v -= mean;
                    }
                }
            }
            Normalization::Torch => {
                for c in 0..3 {
                    for v in &mut chw[c * plane..(c + 1) * plane] {
                        *v = (*v / 255.0 - TORCH_MEAN[c]) / TORCH_STD[c];
                    }
                }
            }
        }
    }

    fn invert(&self, chw: &mut [f32], plane: usize) {
        match self {
            Normalization::None => {}
            Normalization::Caffe => {
                for (c, mean) in CAFFE_MEAN_BGR.iter().enumerate() {
                    for v in &mut chw[c * plane..(c + 1) * plane] {
                        *v += mean;
                    }
                }
                let (b, rest) = chw.split_at_mut(plane);
                let r = &mut rest[plane..2 * plane];
                b.swap_with_slice(r);
            }
            Normalization::Torch => {
                for c in 0..3 {
                    for v in &mut chw[c * plane..(c + 1) * plane] {
                        *v = (*v * TORCH_STD[c] + TORCH_MEAN[c]) * 255.0;
                    }
                }
            }
        }
    }
}

/// Turns decoded images into model-ready CHW float buffers
#[derive(Debug, Clone)]
pub struct Preprocessor {
    size: ImageDimensions,
    normalization: Normalization,
    rescale: Option<f32>,
}

impl Preprocessor {
    pub fn new(config: &ImageConfig, rescale: Option<f32>) -> Self {
        Self {
            size: config.size,
            normalization: config.normalization,
            rescale,
        }
    }

    pub fn dimensions(&self) -> ImageDimensions {
        self.size
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Exact resize to the target size
    pub fn resize(&self, img: &DynamicImage) -> RgbImage {
        let rgb = img.to_rgb8();
        if rgb.dimensions() == (self.size.width, self.size.height) {
            return rgb;
        }
        image::imageops::resize(&rgb, self.size.width, self.size.height, FilterType::Triangle)
    }

    /// CHW layout with 0-255 values
    pub fn to_chw(img: &RgbImage) -> Vec<f32> {
        let (width, height) = img.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for c in 0..3 {
                data[c * plane + offset] = pixel[c] as f32;
            }
        }

        data
    }

    /// Applies the backbone normalisation and then the optional rescale factor
    pub fn finish(&self, chw: &mut [f32]) {
        let plane = (self.size.width * self.size.height) as usize;
        self.normalization.apply(chw, plane);
        if let Some(scale) = self.rescale {
            for v in chw.iter_mut() {
                *v *= scale;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |_, _| Rgb(rgb)))
    }

    fn config(normalization: Normalization) -> ImageConfig {
        ImageConfig {
            normalization,
            size: ImageDimensions::new(8, 6, 3),
        }
    }

    #[test]
    fn test_resize_and_layout() {
        let pre = Preprocessor::new(&config(Normalization::None), None);
        let resized = pre.resize(&solid(20, 20, [10, 20, 30]));
        assert_eq!(resized.dimensions(), (8, 6));

        let chw = Preprocessor::to_chw(&resized);
        assert_eq!(chw.len(), 3 * 8 * 6);
        assert_eq!(chw[0], 10.0);
        assert_eq!(chw[48], 20.0);
        assert_eq!(chw[96], 30.0);
    }

    #[test]
    fn test_caffe_normalization() {
        let pre = Preprocessor::new(&config(Normalization::Caffe), None);
        let mut chw = Preprocessor::to_chw(&pre.resize(&solid(8, 6, [200, 100, 50])));
        pre.finish(&mut chw);

        // First plane is now blue minus the blue mean.
        assert!((chw[0] - (50.0 - 103.939)).abs() < 1e-4);
        assert!((chw[48] - (100.0 - 116.779)).abs() < 1e-4);
        assert!((chw[96] - (200.0 - 123.68)).abs() < 1e-4);
    }

    #[test]
    fn test_invert_restores_pixels() {
        for normalization in [Normalization::Caffe, Normalization::Torch] {
            let mut chw = Preprocessor::to_chw(&solid(8, 6, [200, 100, 50]).to_rgb8());
            let original = chw.clone();
            normalization.apply(&mut chw, 48);
            normalization.invert(&mut chw, 48);
            for (a, b) in chw.iter().zip(&original) {
                assert!((a - b).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_rescale_after_normalization() {
        let pre = Preprocessor::new(&config(Normalization::None), Some(1.0 / 255.0));
        let mut chw = Preprocessor::to_chw(&pre.resize(&solid(8, 6, [255, 0, 51])));
        pre.finish(&mut chw);
        assert!((chw[0] - 1.0).abs() < 1e-6);
        assert!((chw[96] - 0.2).abs() < 1e-6);
    }
}
