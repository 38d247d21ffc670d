//! Random scaling, cropping and resizing of annotated images.
//!
//! Every transform moves the polygons with the pixels and re-validates them against the
//! new frame, so the records always describe what is visible in the image.

use std::path::PathBuf;

use image::{
    imageops::{self, FilterType},
    RgbImage,
};
use ndarray::Array3;
use rand::Rng;
use tracing::instrument;

use crate::{
    annotation::{check_and_validate, AnnotationRecord, ImageSample},
    util::{subtract_mean_normalize, PixelNormalization},
};

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentOptions {
    /// Side of the square network input.
    pub input_size: u32,
    /// Images with a longer side than this are downscaled before anything else.
    pub max_image_large_side: u32,
    /// After random scaling, no polygon may have a side longer than this.
    pub max_text_size: u32,
    pub random_scales: Vec<f32>,
    /// Independent per-axis jitter added to the chosen scale, drawn from `[-j, j)`.
    pub scale_jitter: f32,
    pub crop_probability: f32,
    /// Share of crops that look for a text-free window.
    pub background_ratio: f32,
    pub min_crop_side_ratio: f32,
    pub max_crop_tries: usize,
    pub normalization: PixelNormalization,
}

impl AugmentOptions {
    /// Deterministic resize-only pipeline, used for evaluation and tests.
    pub fn resize_only(input_size: u32) -> Self {
        Self {
            input_size,
            random_scales: vec![1.0],
            scale_jitter: 0.0,
            crop_probability: 0.0,
            ..Self::default()
        }
    }
}

impl Default for AugmentOptions {
    fn default() -> Self {
        Self {
            input_size: 512,
            max_image_large_side: 1280,
            max_text_size: 800,
            random_scales: vec![0.5, 1.0, 2.0, 3.0],
            scale_jitter: 0.1,
            crop_probability: 1.0,
            background_ratio: 3.0 / 8.0,
            min_crop_side_ratio: 0.1,
            max_crop_tries: 50,
            normalization: PixelNormalization::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropKind {
    /// The full frame was used, either by choice or after running out of tries.
    Full,
    Text,
    Background,
}

/// An image at the network input resolution and its remapped annotations.
#[derive(Debug, Clone)]
pub struct AugmentedSample {
    pub path: PathBuf,
    pub image: RgbImage,
    pub records: Vec<AnnotationRecord>,
    pub crop: CropKind,
}

impl AugmentedSample {
    /// `(input_size, input_size, 3)` tensor in the network's value range.
    pub fn to_tensor(&self, normalization: &PixelNormalization) -> Array3<f32> {
        subtract_mean_normalize(&self.image, normalization)
    }
}

/// Runs the full augmentation chain: size caps, random scale, random crop and the final
/// pad-and-resize to `input_size`.
#[instrument(level = "debug", skip_all, fields(path = %sample.path.display()))]
pub fn augment<R: Rng + ?Sized>(
    sample: ImageSample,
    options: &AugmentOptions,
    rng: &mut R,
) -> AugmentedSample {
    let sample = cap_image_size(sample, options.max_image_large_side);

    let (factor_x, factor_y) = random_scale_factors(options, rng);
    let sample = rescale(sample, factor_x, factor_y);
    let sample = cap_text_size(sample, options.max_text_size);

    let (sample, crop) = if rng.random::<f32>() < options.crop_probability {
        let background = rng.random::<f32>() < options.background_ratio;
        random_crop(sample, options, background, rng)
    } else {
        (sample, CropKind::Full)
    };

    let ImageSample {
        path,
        image,
        records,
    } = sample;
    let (image, records) = pad_and_resize(image, records, options.input_size);
    AugmentedSample {
        path,
        image,
        records,
        crop,
    }
}

fn random_scale_factors<R: Rng + ?Sized>(options: &AugmentOptions, rng: &mut R) -> (f32, f32) {
    let base = if options.random_scales.is_empty() {
        1.0
    } else {
        options.random_scales[rng.random_range(0..options.random_scales.len())]
    };
    let jitter = options.scale_jitter.abs();
    let mut draw = || {
        if jitter > 0.0 {
            rng.random_range(-jitter..jitter)
        } else {
            0.0
        }
    };
    let factor_x = (base + draw()).max(0.05);
    let factor_y = (base + draw()).max(0.05);
    (factor_x, factor_y)
}

/// Resizes the image by the given factors and moves the polygons along. The factors
/// applied to the polygons are the ones realised by the integer output size.
pub fn rescale(sample: ImageSample, factor_x: f32, factor_y: f32) -> ImageSample {
    let (width, height) = sample.image.dimensions();
    let new_width = ((width as f32 * factor_x).round() as u32).max(1);
    let new_height = ((height as f32 * factor_y).round() as u32).max(1);
    if (new_width, new_height) == (width, height) {
        return sample;
    }
    log::trace!("Rescaling ({width}, {height}) -> ({new_width}, {new_height})");
    let image = imageops::resize(&sample.image, new_width, new_height, FilterType::Triangle);
    let sx = new_width as f32 / width as f32;
    let sy = new_height as f32 / height as f32;
    let records = sample
        .records
        .into_iter()
        .map(|record| AnnotationRecord {
            quad: record.quad.scale(sx, sy),
            ..record
        })
        .collect();
    ImageSample {
        path: sample.path,
        records: check_and_validate(records, new_width, new_height),
        image,
    }
}

fn cap_image_size(sample: ImageSample, max_side: u32) -> ImageSample {
    let long_side = sample.image.width().max(sample.image.height());
    if max_side == 0 || long_side <= max_side {
        return sample;
    }
    let factor = max_side as f32 / long_side as f32;
    log::debug!("Image side {long_side} exceeds {max_side}, scaling by {factor}");
    rescale(sample, factor, factor)
}

fn cap_text_size(sample: ImageSample, max_text_size: u32) -> ImageSample {
    let longest = sample
        .records
        .iter()
        .map(|record| record.quad.max_side())
        .fold(0.0f32, f32::max);
    if max_text_size == 0 || longest <= max_text_size as f32 {
        return sample;
    }
    let factor = max_text_size as f32 / longest;
    log::debug!("Text side {longest} exceeds {max_text_size}, scaling by {factor}");
    rescale(sample, factor, factor)
}

/// Marks the pixel columns/rows covered by any polygon. Crop edges are only placed on
/// unmarked positions, so a window never cuts through a polygon.
fn free_positions(spans: impl Iterator<Item = (f32, f32)>, len: u32, pad: u32) -> Vec<i64> {
    let mut covered = vec![false; (len + 2 * pad) as usize];
    for (min, max) in spans {
        let start = (min.round().max(0.0) as usize + pad as usize).min(covered.len());
        let end = (max.round().max(0.0) as usize + pad as usize + 1).min(covered.len());
        if start < end {
            covered[start..end].fill(true);
        }
    }
    covered
        .iter()
        .enumerate()
        .filter(|(_, covered)| !**covered)
        .map(|(i, _)| i as i64 - pad as i64)
        .collect()
}

fn pick_span<R: Rng + ?Sized>(free: &[i64], len: u32, rng: &mut R) -> (u32, u32) {
    let a = free[rng.random_range(0..free.len())];
    let b = free[rng.random_range(0..free.len())];
    let max = len as i64 - 1;
    (a.min(b).clamp(0, max) as u32, a.max(b).clamp(0, max) as u32)
}

/// Tries up to `max_crop_tries` random windows. A text crop must fully contain at
/// least one non-ignored polygon whose shorter side exceeds `min_crop_side_ratio`
/// times the shorter image side; a background crop must contain none. Falls back to
/// the untouched frame.
#[instrument(level = "trace", skip(sample, options, rng))]
pub fn random_crop<R: Rng + ?Sized>(
    sample: ImageSample,
    options: &AugmentOptions,
    background: bool,
    rng: &mut R,
) -> (ImageSample, CropKind) {
    let (width, height) = sample.image.dimensions();
    let pad_w = width / 10;
    let pad_h = height / 10;
    let bounds = sample
        .records
        .iter()
        .map(|record| record.quad.bounds())
        .collect::<Vec<_>>();
    let min_text_side = options.min_crop_side_ratio * width.min(height) as f32;
    let qualifies =
        |record: &AnnotationRecord| !record.ignored && record.quad.min_side() > min_text_side;
    if !background && !sample.records.iter().any(qualifies) {
        log::trace!("No polygon with a shorter side above {min_text_side} px, keeping the full frame");
        return (sample, CropKind::Full);
    }
    let free_x = free_positions(bounds.iter().map(|(min, max)| (min.x, max.x)), width, pad_w);
    let free_y = free_positions(bounds.iter().map(|(min, max)| (min.y, max.y)), height, pad_h);
    if free_x.is_empty() || free_y.is_empty() {
        return (sample, CropKind::Full);
    }

    let min_w = options.min_crop_side_ratio * width as f32;
    let min_h = options.min_crop_side_ratio * height as f32;
    for _ in 0..options.max_crop_tries {
        let (x_min, x_max) = pick_span(&free_x, width, rng);
        let (y_min, y_max) = pick_span(&free_y, height, rng);
        if ((x_max - x_min) as f32) < min_w || ((y_max - y_min) as f32) < min_h {
            continue;
        }

        let lo = geo::Coord {
            x: x_min as f32,
            y: y_min as f32,
        };
        let hi = geo::Coord {
            x: x_max as f32,
            y: y_max as f32,
        };
        let inside = sample
            .records
            .iter()
            .filter(|record| record.quad.is_within(lo, hi))
            .collect::<Vec<_>>();
        let acceptable = if background {
            inside.is_empty()
        } else {
            inside.iter().any(|record| qualifies(*record))
        };
        if !acceptable {
            continue;
        }

        let crop_width = x_max - x_min + 1;
        let crop_height = y_max - y_min + 1;
        let records = inside
            .into_iter()
            .map(|record| AnnotationRecord {
                quad: record.quad.translate(-lo.x, -lo.y),
                ..record.clone()
            })
            .collect();
        let image = imageops::crop_imm(&sample.image, x_min, y_min, crop_width, crop_height)
            .to_image();
        let kind = if background {
            CropKind::Background
        } else {
            CropKind::Text
        };
        log::trace!("{kind:?} crop ({x_min}, {y_min}) {crop_width}x{crop_height}");
        return (
            ImageSample {
                path: sample.path,
                image,
                records: check_and_validate(records, crop_width, crop_height),
            },
            kind,
        );
    }

    log::debug!(
        "No acceptable crop for {} after {} tries, using the full frame",
        sample.path.display(),
        options.max_crop_tries
    );
    (sample, CropKind::Full)
}

/// Pads the image at the bottom/right to a square of side `max(w, h, input_size)` and
/// resizes that square to `input_size`.
pub fn pad_and_resize(
    image: RgbImage,
    records: Vec<AnnotationRecord>,
    input_size: u32,
) -> (RgbImage, Vec<AnnotationRecord>) {
    let (width, height) = image.dimensions();
    let side = width.max(height).max(input_size);
    let padded = if (width, height) == (side, side) {
        image
    } else {
        let mut canvas = RgbImage::new(side, side);
        imageops::replace(&mut canvas, &image, 0, 0);
        canvas
    };
    let resized = if side == input_size {
        padded
    } else {
        imageops::resize(&padded, input_size, input_size, FilterType::Triangle)
    };
    let factor = input_size as f32 / side as f32;
    let records = records
        .into_iter()
        .map(|record| AnnotationRecord {
            quad: record.quad.scale(factor, factor),
            ..record
        })
        .collect();
    (resized, check_and_validate(records, input_size, input_size))
}
