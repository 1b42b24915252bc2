//! Randomised label-preserving image transforms.
//!
//! Works on CHW float buffers with 0-255 values, before normalisation.
//! A single affine transform (rotation, shift, shear, zoom) is composed per
//! image and sampled bilinearly, then the channel shift and flips follow.
//!
//! # Augmentation Strategy
//!
//! - **Fine-tuning**: random transforms on the training stream
//! - **Feature extraction / evaluation**: no transforms, so repeated runs
//!   produce identical inputs

use catdog_core::{AugmentationConfig, FillMode};
use rand::Rng;

/// Parameters of one sampled transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    /// Rotation in radians
    pub theta: f32,
    /// Horizontal shift in pixels
    pub shift_x: f32,
    /// Vertical shift in pixels
    pub shift_y: f32,
    /// Shear angle in radians
    pub shear: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    /// Offset added to every value before clipping to the image's range
    pub channel_shift: f32,
}

impl TransformParams {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip_horizontal: false,
            flip_vertical: false,
            channel_shift: 0.0,
        }
    }

    fn has_affine(&self) -> bool {
        self.theta != 0.0
            || self.shift_x != 0.0
            || self.shift_y != 0.0
            || self.shear != 0.0
            || self.zoom_x != 1.0
            || self.zoom_y != 1.0
    }

    /// 2x2 matrix mapping centred output coordinates to input coordinates
    fn matrix(&self) -> [[f32; 2]; 2] {
        let (sin_t, cos_t) = self.theta.sin_cos();
        let (sin_s, cos_s) = self.shear.sin_cos();
        // rotation * shear
        let rs = [
            [cos_t, -cos_t * sin_s - sin_t * cos_s],
            [sin_t, -sin_t * sin_s + cos_t * cos_s],
        ];
        // * zoom
        [
            [rs[0][0] * self.zoom_x, rs[0][1] * self.zoom_y],
            [rs[1][0] * self.zoom_x, rs[1][1] * self.zoom_y],
        ]
    }
}

/// Applies [`AugmentationConfig`] transforms to images
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    /// Creates a new augmenter with the given configuration
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    /// Creates an augmenter that returns images unchanged
    pub fn no_augmentation() -> Self {
        Self::new(AugmentationConfig::none())
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Whether [`Augmenter::augment`] draws any randomness
    pub fn is_random(&self) -> bool {
        self.config.is_random()
    }

    /// Draws transform parameters. Disabled options consume no randomness.
    pub fn sample<R: Rng + ?Sized>(&self, width: u32, height: u32, rng: &mut R) -> TransformParams {
        let c = &self.config;
        let mut params = TransformParams::identity();

        if c.rotation_range > 0.0 {
            params.theta = rng
                .gen_range(-c.rotation_range..=c.rotation_range)
                .to_radians();
        }
        if c.width_shift_range > 0.0 {
            params.shift_x =
                rng.gen_range(-c.width_shift_range..=c.width_shift_range) * width as f32;
        }
        if c.height_shift_range > 0.0 {
            params.shift_y =
                rng.gen_range(-c.height_shift_range..=c.height_shift_range) * height as f32;
        }
        if c.shear_range > 0.0 {
            params.shear = rng.gen_range(-c.shear_range..=c.shear_range).to_radians();
        }
        if c.zoom_range > 0.0 {
            params.zoom_x = rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range);
            params.zoom_y = rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range);
        }
        if c.channel_shift_range > 0.0 {
            params.channel_shift =
                rng.gen_range(-c.channel_shift_range..=c.channel_shift_range);
        }
        if c.horizontal_flip {
            params.flip_horizontal = rng.gen::<f32>() < 0.5;
        }
        if c.vertical_flip {
            params.flip_vertical = rng.gen::<f32>() < 0.5;
        }

        params
    }

    /// Samples and applies a transform
    pub fn augment<R: Rng + ?Sized>(
        &self,
        chw: Vec<f32>,
        width: u32,
        height: u32,
        rng: &mut R,
    ) -> Vec<f32> {
        if !self.is_random() {
            return chw;
        }
        let params = self.sample(width, height, rng);
        self.apply(chw, width, height, &params)
    }

    /// Applies a fixed transform to a CHW buffer
    pub fn apply(&self, chw: Vec<f32>, width: u32, height: u32, params: &TransformParams) -> Vec<f32> {
        let (w, h) = (width as usize, height as usize);
        let plane = w * h;
        let channels = chw.len() / plane.max(1);

        let mut out = if params.has_affine() {
            self.warp(&chw, w, h, channels, params)
        } else {
            chw
        };

        if params.channel_shift != 0.0 {
            let (min, max) = out
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            for v in out.iter_mut() {
                *v = (*v + params.channel_shift).clamp(min, max);
            }
        }

        if params.flip_horizontal {
            flip_horizontal(&mut out, w);
        }
        if params.flip_vertical {
            flip_vertical(&mut out, w, h);
        }

        out
    }

    /// Resamples every channel through the inverse affine map around the
    /// image centre, filling outside pixels per [`FillMode`]
    fn warp(&self, chw: &[f32], w: usize, h: usize, channels: usize, params: &TransformParams) -> Vec<f32> {
        let plane = w * h;
        let m = params.matrix();
        let cx = (w as f32 - 1.0) / 2.0;
        let cy = (h as f32 - 1.0) / 2.0;
        let mut out = vec![0.0f32; chw.len()];

        for y in 0..h {
            for x in 0..w {
                let u = x as f32 - cx;
                let v = y as f32 - cy;
                let src_x = m[0][0] * u + m[0][1] * v + cx + params.shift_x;
                let src_y = m[1][0] * u + m[1][1] * v + cy + params.shift_y;

                for c in 0..channels {
                    let source = &chw[c * plane..(c + 1) * plane];
                    out[c * plane + y * w + x] = self.bilinear_sample(source, w, h, src_x, src_y);
                }
            }
        }

        out
    }

    /// Bilinear interpolation with out-of-bounds neighbours resolved by the fill mode
    fn bilinear_sample(&self, plane: &[f32], w: usize, h: usize, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let p00 = self.fetch(plane, w, h, x0, y0);
        let p10 = self.fetch(plane, w, h, x0 + 1, y0);
        let p01 = self.fetch(plane, w, h, x0, y0 + 1);
        let p11 = self.fetch(plane, w, h, x0 + 1, y0 + 1);

        p00 * (1.0 - fx) * (1.0 - fy) + p10 * fx * (1.0 - fy) + p01 * (1.0 - fx) * fy + p11 * fx * fy
    }

    fn fetch(&self, plane: &[f32], w: usize, h: usize, x: i64, y: i64) -> f32 {
        let inside = x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h;
        if inside {
            return plane[y as usize * w + x as usize];
        }
        match self.config.fill_mode {
            FillMode::Constant => self.config.fill_value,
            FillMode::Nearest => {
                let xi = x.clamp(0, w as i64 - 1) as usize;
                let yi = y.clamp(0, h as i64 - 1) as usize;
                plane[yi * w + xi]
            }
            FillMode::Reflect => {
                let xi = reflect_index(x, w);
                let yi = reflect_index(y, h);
                plane[yi * w + xi]
            }
        }
    }
}

/// Mirror an index into `[0, n)`: `d c b a | a b c d | d c b a`
fn reflect_index(i: i64, n: usize) -> usize {
    let n = n as i64;
    let period = 2 * n;
    let r = i.rem_euclid(period);
    (if r < n { r } else { period - 1 - r }) as usize
}

/// Mirrors every row of a CHW buffer in place, like `imageops::flip_horizontal`
pub fn flip_horizontal(chw: &mut [f32], width: usize) {
    for row in chw.chunks_exact_mut(width.max(1)) {
        row.reverse();
    }
}

/// Swaps rows top to bottom in each channel plane of a CHW buffer
pub fn flip_vertical(chw: &mut [f32], width: usize, height: usize) {
    let plane = width * height;
    if plane == 0 {
        return;
    }
    for channel in chw.chunks_exact_mut(plane) {
        for y in 0..height / 2 {
            let (top, bottom) = channel.split_at_mut((height - 1 - y) * width);
            top[y * width..(y + 1) * width].swap_with_slice(&mut bottom[..width]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const W: u32 = 8;
    const H: u32 = 6;

    /// Gradient image: value depends on channel, row and column
    fn gradient() -> Vec<f32> {
        let mut data = Vec::new();
        for c in 0..3 {
            for y in 0..H {
                for x in 0..W {
                    data.push((c * 60 + y * 10 + x) as f32);
                }
            }
        }
        data
    }

    #[test]
    fn test_no_augmentation_is_identity() {
        let aug = Augmenter::no_augmentation();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(aug.sample(W, H, &mut rng), TransformParams::identity());
        assert_eq!(aug.augment(gradient(), W, H, &mut rng), gradient());
    }

    #[test]
    fn test_identity_warp_preserves_pixels() {
        let aug = Augmenter::new(AugmentationConfig::default());
        let params = TransformParams::identity();
        let out = aug.warp(&gradient(), W as usize, H as usize, 3, &params);
        for (a, b) in out.iter().zip(gradient()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_horizontal_flip() {
        let aug = Augmenter::no_augmentation();
        let params = TransformParams {
            flip_horizontal: true,
            ..TransformParams::identity()
        };
        let out = aug.apply(gradient(), W, H, &params);
        assert_eq!(out[0], 7.0);
        assert_eq!(out[7], 0.0);
        assert_eq!(out[W as usize], 17.0);
    }

    #[test]
    fn test_vertical_flip() {
        let aug = Augmenter::no_augmentation();
        let params = TransformParams {
            flip_vertical: true,
            ..TransformParams::identity()
        };
        let out = aug.apply(gradient(), W, H, &params);
        assert_eq!(out[0], 50.0);
        assert_eq!(out[(5 * W) as usize], 0.0);
        // second channel flipped independently
        assert_eq!(out[(W * H) as usize], 110.0);
    }

    #[test]
    fn test_flips_match_imageops() {
        use crate::preprocess::Preprocessor;
        use image::{imageops, Rgb, RgbImage};

        let img = RgbImage::from_fn(W, H, |x, y| Rgb([(x * 30) as u8, (y * 40) as u8, (x + y) as u8]));

        let mut chw = Preprocessor::to_chw(&img);
        flip_horizontal(&mut chw, W as usize);
        assert_eq!(chw, Preprocessor::to_chw(&imageops::flip_horizontal(&img)));

        let mut chw = Preprocessor::to_chw(&img);
        flip_vertical(&mut chw, W as usize, H as usize);
        assert_eq!(chw, Preprocessor::to_chw(&imageops::flip_vertical(&img)));
    }

    #[test]
    fn test_nearest_fill_stays_in_range() {
        let aug = Augmenter::new(AugmentationConfig::default());
        let params = TransformParams {
            shift_x: 5.0,
            ..TransformParams::identity()
        };
        let out = aug.apply(gradient(), W, H, &params);
        // Columns beyond the right edge repeat the last column.
        assert!((out[W as usize - 1] - 7.0).abs() < 1e-4);
        assert!((out[0] - 5.0).abs() < 1e-4);
        assert!(out.iter().all(|v| (0.0..=177.0).contains(v)));
    }

    #[test]
    fn test_constant_fill() {
        let aug = Augmenter::new(AugmentationConfig {
            fill_mode: FillMode::Constant,
            fill_value: -1.0,
            ..AugmentationConfig::none()
        });
        let params = TransformParams {
            shift_x: 20.0,
            ..TransformParams::identity()
        };
        let out = aug.apply(gradient(), W, H, &params);
        assert!(out.iter().all(|v| *v == -1.0));
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(2, 4), 2);
    }

    #[test]
    fn test_channel_shift_clipped() {
        let aug = Augmenter::no_augmentation();
        let params = TransformParams {
            channel_shift: 30.0,
            ..TransformParams::identity()
        };
        let out = aug.apply(gradient(), W, H, &params);
        assert_eq!(out[0], 30.0);
        assert_eq!(*out.last().unwrap(), 177.0);
    }

    #[test]
    fn test_augment_is_seeded() {
        let aug = Augmenter::new(AugmentationConfig {
            rotation_range: 30.0,
            ..AugmentationConfig::default()
        });
        let a = aug.augment(gradient(), W, H, &mut ChaCha8Rng::seed_from_u64(7));
        let b = aug.augment(gradient(), W, H, &mut ChaCha8Rng::seed_from_u64(7));
        let c = aug.augment(gradient(), W, H, &mut ChaCha8Rng::seed_from_u64(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), gradient().len());
    }
}
