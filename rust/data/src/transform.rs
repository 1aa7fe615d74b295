//! Image preprocessing.
//!
//! Training images get a random resized crop, a random quarter-turn and random
//! flips. Evaluation images are resized on the shorter side and center cropped.
//! Both end in a normalized `[3, size, size]` buffer in channel-major order.

use std::path::Path;

use image::{
    DynamicImage, RgbImage,
    imageops::{self, FilterType},
};
use rand::RngExt;
use resnet_config::{ConfigError, DataConfig};

use crate::dataset::{DataError, Split};

/// Area fraction range sampled by the random resized crop.
pub const CROP_SCALE: (f64, f64) = (0.08, 1.0);
/// Aspect ratio range sampled by the random resized crop.
pub const CROP_RATIO: (f64, f64) = (3.0 / 4.0, 4.0 / 3.0);
const CROP_ATTEMPTS: usize = 10;
const FILTER: FilterType = FilterType::Triangle;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Normalize {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalize {
    #[must_use]
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { mean, std }
    }

    /// Scale to [0, 1], normalize per channel and lay out as CHW.
    #[must_use]
    pub fn to_chw(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = image.dimensions();
        let plane = (width * height) as usize;
        let mut out = vec![0.0; 3 * plane];

        for (i, pixel) in image.pixels().enumerate() {
            for c in 0..3 {
                let value = f32::from(pixel[c]) / 255.0;
                out[c * plane + i] = (value - self.mean[c]) / self.std[c];
            }
        }
        out
    }
}

impl Default for Normalize {
    fn default() -> Self {
        Self::new([0.485, 0.456, 0.406], [0.229, 0.224, 0.225])
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageTransform {
    pub split: Split,
    pub image_size: u32,
    pub resize_size: u32,
    pub normalize: Normalize,
}

impl ImageTransform {
    #[must_use]
    pub fn new(split: Split, image_size: u32, resize_size: u32, normalize: Normalize) -> Self {
        Self {
            split,
            image_size,
            resize_size,
            normalize,
        }
    }

    pub fn from_config(config: &DataConfig, split: Split) -> Result<Self, ConfigError> {
        let (mean, std) = config.normalization()?;
        Ok(Self::new(
            split,
            config.image_size as u32,
            config.resize_size as u32,
            Normalize::new(mean, std),
        ))
    }

    /// Same sizes and normalization, different pipeline.
    #[must_use]
    pub fn for_split(&self, split: Split) -> Self {
        Self {
            split,
            ..self.clone()
        }
    }

    /// Number of floats produced per image.
    #[must_use]
    pub fn output_len(&self) -> usize {
        3 * (self.image_size * self.image_size) as usize
    }

    /// Geometric part of the pipeline, before normalization.
    pub fn augment<R: RngExt>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        if self.split.is_train() {
            let crop = random_resized_crop(image, self.image_size, CROP_SCALE, CROP_RATIO, rng);
            let mut crop = random_quarter_turn(crop, rng);
            if rng.random_bool(0.5) {
                imageops::flip_horizontal_in_place(&mut crop);
            }
            if rng.random_bool(0.5) {
                imageops::flip_vertical_in_place(&mut crop);
            }
            crop
        } else {
            let resized = resize_shorter_side(image, self.resize_size);
            center_crop(&resized, self.image_size)
        }
    }

    pub fn apply<R: RngExt>(&self, image: &DynamicImage, rng: &mut R) -> Vec<f32> {
        let augmented = self.augment(&image.to_rgb8(), rng);
        self.normalize.to_chw(&augmented)
    }

    /// Decode `path` and run the pipeline on it.
    pub fn load<R: RngExt>(&self, path: &Path, rng: &mut R) -> Result<Vec<f32>, DataError> {
        let image =
            image::open(path).map_err(|e| DataError::Decode(path.display().to_string(), e))?;
        Ok(self.apply(&image, rng))
    }
}

/// Crop a random region of random area and aspect ratio, then resize it to `size`.
///
/// Falls back to a center crop clamped to the ratio range when no sampled
/// region fits inside the image.
pub fn random_resized_crop<R: RngExt>(
    image: &RgbImage,
    size: u32,
    scale: (f64, f64),
    ratio: (f64, f64),
    rng: &mut R,
) -> RgbImage {
    let (width, height) = image.dimensions();
    let area = f64::from(width) * f64::from(height);
    let log_ratio = (ratio.0.ln(), ratio.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.random_range(scale.0..=scale.1);
        let aspect = rng.random_range(log_ratio.0..=log_ratio.1).exp();

        let crop_w = (target_area * aspect).sqrt().round() as u32;
        let crop_h = (target_area / aspect).sqrt().round() as u32;

        if crop_w > 0 && crop_w <= width && crop_h > 0 && crop_h <= height {
            let x = rng.random_range(0..=width - crop_w);
            let y = rng.random_range(0..=height - crop_h);
            let crop = imageops::crop_imm(image, x, y, crop_w, crop_h).to_image();
            return imageops::resize(&crop, size, size, FILTER);
        }
    }

    let in_ratio = f64::from(width) / f64::from(height);
    let (crop_w, crop_h) = if in_ratio < ratio.0 {
        (width, (f64::from(width) / ratio.0).round() as u32)
    } else if in_ratio > ratio.1 {
        ((f64::from(height) * ratio.1).round() as u32, height)
    } else {
        (width, height)
    };
    let crop_w = crop_w.clamp(1, width);
    let crop_h = crop_h.clamp(1, height);
    let crop = imageops::crop_imm(
        image,
        (width - crop_w) / 2,
        (height - crop_h) / 2,
        crop_w,
        crop_h,
    )
    .to_image();
    imageops::resize(&crop, size, size, FILTER)
}

/// Rotate by 0, 90, 180 or 270 degrees, chosen uniformly.
pub fn random_quarter_turn<R: RngExt>(image: RgbImage, rng: &mut R) -> RgbImage {
    match rng.random_range(0..4u8) {
        1 => imageops::rotate90(&image),
        2 => imageops::rotate180(&image),
        3 => imageops::rotate270(&image),
        _ => image,
    }
}

/// Resize so the shorter side equals `size`, keeping the aspect ratio.
#[must_use]
pub fn resize_shorter_side(image: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (new_w, new_h) = if width <= height {
        let h = (u64::from(size) * u64::from(height) / u64::from(width)) as u32;
        (size, h)
    } else {
        let w = (u64::from(size) * u64::from(width) / u64::from(height)) as u32;
        (w, size)
    };
    if (new_w, new_h) == (width, height) {
        return image.clone();
    }
    imageops::resize(image, new_w, new_h, FILTER)
}

/// Take the central `size` x `size` square, upscaling first if the image is smaller.
#[must_use]
pub fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width < size || height < size {
        return center_crop(&resize_shorter_side(image, size), size);
    }

    let x = ((f64::from(width - size)) / 2.0).round() as u32;
    let y = ((f64::from(height - size)) / 2.0).round() as u32;
    imageops::crop_imm(image, x, y, size, size).to_image()
}
