//! Data Augmentation Module for Lesion Classification
//!
//! On-the-fly augmentation applied to training images only. Every image is
//! first resized to the network resolution, then a random affine warp
//! (rotation, shift, shear, zoom) and an optional horizontal flip are
//! applied, followed by optional brightness/contrast jitter. Each parameter
//! is drawn independently per sample.
//!
//! Pixels that map outside the source image take the value of the nearest
//! edge pixel.

use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Configuration for data augmentation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Maximum rotation angle in degrees (applies ±rotation_degrees)
    pub rotation_degrees: f32,
    /// Horizontal shift as a fraction of the width (±)
    pub width_shift: f32,
    /// Vertical shift as a fraction of the height (±)
    pub height_shift: f32,
    /// Maximum shear angle in degrees (±)
    pub shear_degrees: f32,
    /// Zoom range: each axis scaled by a factor in [1 - zoom, 1 + zoom]
    pub zoom: f32,
    /// Probability of a horizontal flip
    pub horizontal_flip_prob: f32,
    /// Brightness adjustment range (±brightness_delta, fraction of 255)
    pub brightness_delta: f32,
    /// Contrast adjustment range (1.0 ± contrast_delta)
    pub contrast_delta: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self::keras_default()
    }
}

impl AugmentationConfig {
    /// The generator settings used for the single-backbone models
    pub fn keras_default() -> Self {
        Self {
            rotation_degrees: 40.0,
            width_shift: 0.2,
            height_shift: 0.2,
            shear_degrees: 0.2,
            zoom: 0.2,
            horizontal_flip_prob: 0.5,
            brightness_delta: 0.0,
            contrast_delta: 0.0,
        }
    }

    /// Flip + small rotation, used for the fusion model
    pub fn light() -> Self {
        Self {
            rotation_degrees: 10.0,
            horizontal_flip_prob: 0.5,
            ..Self::none()
        }
    }

    /// Disable all augmentations (for validation/inference)
    pub fn none() -> Self {
        Self {
            rotation_degrees: 0.0,
            width_shift: 0.0,
            height_shift: 0.0,
            shear_degrees: 0.0,
            zoom: 0.0,
            horizontal_flip_prob: 0.0,
            brightness_delta: 0.0,
            contrast_delta: 0.0,
        }
    }

    /// Whether any geometric transform is enabled
    fn has_affine(&self) -> bool {
        self.rotation_degrees > 0.0
            || self.width_shift > 0.0
            || self.height_shift > 0.0
            || self.shear_degrees > 0.0
            || self.zoom > 0.0
    }

    pub fn is_identity(&self) -> bool {
        !self.has_affine()
            && self.horizontal_flip_prob <= 0.0
            && self.brightness_delta <= 0.0
            && self.contrast_delta <= 0.0
    }
}

/// Parameters of one random affine warp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub rotation_deg: f32,
    /// Shift in pixels
    pub tx: f32,
    pub ty: f32,
    pub shear_deg: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            rotation_deg: 0.0,
            tx: 0.0,
            ty: 0.0,
            shear_deg: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
        }
    }

    /// 2x2 matrix mapping centered output coordinates to source coordinates
    fn matrix(&self) -> [[f32; 2]; 2] {
        let theta = self.rotation_deg.to_radians();
        let shear = self.shear_deg.to_radians();
        let (sin_t, cos_t) = theta.sin_cos();

        // rotation * shear
        let rs = [
            [cos_t, -cos_t * shear.sin() - sin_t * shear.cos()],
            [sin_t, -sin_t * shear.sin() + cos_t * shear.cos()],
        ];
        // ... * zoom
        [
            [rs[0][0] * self.zoom_x, rs[0][1] * self.zoom_y],
            [rs[1][0] * self.zoom_x, rs[1][1] * self.zoom_y],
        ]
    }
}

/// Image augmenter that applies random transformations
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
    image_size: u32,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig, image_size: u32) -> Self {
        Self { config, image_size }
    }

    /// Augmenter that only resizes (validation/inference)
    pub fn no_augmentation(image_size: u32) -> Self {
        Self::new(AugmentationConfig::none(), image_size)
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Draw one set of affine parameters for an image of `width` x `height`
    pub fn sample_affine(&self, width: u32, height: u32, rng: &mut ChaCha8Rng) -> AffineParams {
        let c = &self.config;
        let symmetric = |rng: &mut ChaCha8Rng, range: f32| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };

        AffineParams {
            rotation_deg: symmetric(rng, c.rotation_degrees),
            tx: symmetric(rng, c.width_shift) * width as f32,
            ty: symmetric(rng, c.height_shift) * height as f32,
            shear_deg: symmetric(rng, c.shear_degrees),
            zoom_x: 1.0 + symmetric(rng, c.zoom),
            zoom_y: 1.0 + symmetric(rng, c.zoom),
        }
    }

    /// Apply all configured augmentations to an already resized image
    pub fn augment(&self, img: DynamicImage, rng: &mut ChaCha8Rng) -> DynamicImage {
        let mut rgb = img.to_rgb8();

        if self.config.has_affine() {
            let (w, h) = rgb.dimensions();
            let params = self.sample_affine(w, h, rng);
            rgb = warp_affine(&rgb, &params);
        }

        if self.config.horizontal_flip_prob > 0.0
            && rng.gen::<f32>() < self.config.horizontal_flip_prob
        {
            rgb = image::imageops::flip_horizontal(&rgb);
        }

        if self.config.brightness_delta > 0.0 {
            let delta = rng.gen_range(-self.config.brightness_delta..=self.config.brightness_delta);
            adjust_brightness(&mut rgb, delta);
        }

        if self.config.contrast_delta > 0.0 {
            let factor =
                1.0 + rng.gen_range(-self.config.contrast_delta..=self.config.contrast_delta);
            adjust_contrast(&mut rgb, factor);
        }

        DynamicImage::ImageRgb8(rgb)
    }

    /// Resize image to target size (always applied, not random)
    pub fn resize(&self, img: &DynamicImage) -> DynamicImage {
        img.resize_exact(self.image_size, self.image_size, FilterType::Triangle)
    }

    /// Convert image to CHW float data rescaled to [0, 1]
    pub fn to_tensor_data(img: &RgbImage) -> Vec<f32> {
        let (width, height) = img.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for c in 0..3 {
                data[c * plane + offset] = pixel[c] as f32 / 255.0;
            }
        }

        data
    }

    /// Full preprocessing: resize, augment when an RNG is given, convert to CHW
    pub fn preprocess(&self, img: &DynamicImage, rng: Option<&mut ChaCha8Rng>) -> Vec<f32> {
        let mut result = self.resize(img);

        if let Some(rng) = rng {
            if !self.config.is_identity() {
                result = self.augment(result, rng);
            }
        }

        Self::to_tensor_data(&result.to_rgb8())
    }
}

/// Warp an image with an affine transform around its center
pub fn warp_affine(img: &RgbImage, params: &AffineParams) -> RgbImage {
    let (width, height) = img.dimensions();
    let m = params.matrix();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let mut output: RgbImage = ImageBuffer::new(width, height);
    for (x, y, pixel) in output.enumerate_pixels_mut() {
        let u = x as f32 - cx;
        let v = y as f32 - cy;
        let src_x = m[0][0] * u + m[0][1] * v + cx + params.tx;
        let src_y = m[1][0] * u + m[1][1] * v + cy + params.ty;
        *pixel = bilinear_sample_nearest_fill(img, src_x, src_y);
    }
    output
}

/// Bilinear sample; coordinates outside the image are clamped to the edge
fn bilinear_sample_nearest_fill(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        result[c] = v.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}

fn adjust_brightness(img: &mut RgbImage, delta: f32) {
    let delta = delta * 255.0;
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            pixel[c] = (pixel[c] as f32 + delta).clamp(0.0, 255.0) as u8;
        }
    }
}

/// Scale pixel values around the mean luminance
fn adjust_contrast(img: &mut RgbImage, factor: f32) {
    let count = (img.width() * img.height()).max(1) as f64;
    let mean = (img
        .pixels()
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .sum::<f64>()
        / count) as f32;

    for pixel in img.pixels_mut() {
        for c in 0..3 {
            pixel[c] = (mean + factor * (pixel[c] as f32 - mean)).clamp(0.0, 255.0) as u8;
        }
    }
}
