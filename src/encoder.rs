//! RBOX ground truth: score map, geometry map and the two loss masks.
//!
//! Polygons are rasterized at input resolution and the maps are sampled every
//! `stride` pixels, which matches the output resolution of the detection network.
//! Geometry distances stay in input-pixel units.

use geo::Coord;
use image::{GrayImage, ImageBuffer, Luma};
use ndarray::{Array2, Array3};
use tracing::instrument;

use crate::{
    annotation::AnnotationRecord,
    augment::AugmentedSample,
    geometry::{fit_min_area_rect, shrink_polygon, validate_quad, RotatedRect, SHRINK_RATIO},
    result::TrainingSample,
    util::{fill_quad, PixelNormalization},
};

/// Number of geometry channels: top, right, bottom, left, angle.
pub const GEO_CHANNELS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderOptions {
    /// Polygons whose fitted rectangle has a side shorter than this (input pixels) only
    /// mark the small-text mask.
    pub min_text_size: f32,
    pub shrink_ratio: f32,
    /// Output stride of the network.
    pub stride: u32,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            min_text_size: 10.0,
            shrink_ratio: SHRINK_RATIO,
            stride: 4,
        }
    }
}

/// What happened to each polygon of a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolygonStats {
    pub encoded: usize,
    pub ignored: usize,
    pub small: usize,
    pub dropped: usize,
}

/// Dense targets at output resolution `(input_size / stride)²`.
///
/// Masks are 1 where the loss is suppressed.
#[derive(Debug, Clone)]
pub struct EncodedMaps {
    pub score_map: Array2<f32>,
    /// `(h, w, 5)`: distances to the top, right, bottom and left edges, then the angle.
    pub geo_map: Array3<f32>,
    pub small_text_mask: Array2<f32>,
    pub boundary_mask: Array2<f32>,
    pub stats: PolygonStats,
}

/// Full-resolution rasterization layers of one sample.
struct Layers {
    score: GrayImage,
    outline: GrayImage,
    ignored: GrayImage,
    small: GrayImage,
    owner: ImageBuffer<Luma<u16>, Vec<u16>>,
}

impl Layers {
    fn new(size: u32) -> Self {
        Self {
            score: GrayImage::new(size, size),
            outline: GrayImage::new(size, size),
            ignored: GrayImage::new(size, size),
            small: GrayImage::new(size, size),
            owner: ImageBuffer::new(size, size),
        }
    }
}

#[instrument(level = "debug", skip(records, options), fields(polygons = records.len()))]
pub fn encode(
    records: &[AnnotationRecord],
    input_size: u32,
    options: &EncoderOptions,
) -> EncodedMaps {
    let mut layers = Layers::new(input_size);
    let mut rects: Vec<RotatedRect> = Vec::new();
    let mut stats = PolygonStats::default();

    for record in records {
        let quad = match validate_quad(record.quad) {
            Ok(quad) => quad,
            Err(err) => {
                log::debug!("Skipping polygon {:?}: {err}", record.text);
                stats.dropped += 1;
                continue;
            }
        };

        if record.ignored {
            fill_quad(&mut layers.ignored, &quad, Luma([1]));
            stats.ignored += 1;
            continue;
        }

        let rect = match fit_min_area_rect(&quad) {
            Ok(rect) => rect,
            Err(err) => {
                log::debug!("Skipping polygon {:?}: {err}", record.text);
                stats.dropped += 1;
                continue;
            }
        };

        if rect.width.min(rect.height) < options.min_text_size {
            fill_quad(&mut layers.small, &quad, Luma([1]));
            stats.small += 1;
            continue;
        }

        let shrunk = match shrink_polygon(&quad, options.shrink_ratio) {
            Ok(shrunk) => shrunk,
            Err(err) => {
                log::debug!("Treating {:?} as small text: {err}", record.text);
                fill_quad(&mut layers.small, &quad, Luma([1]));
                stats.small += 1;
                continue;
            }
        };
        log::trace!(
            "Polygon {:?} fitted to {rect:?}, residual {}",
            record.text,
            rect.residual(&quad)
        );

        if rects.len() >= u16::MAX as usize {
            log::debug!("Too many polygons in one sample, dropping {:?}", record.text);
            stats.dropped += 1;
            continue;
        }
        rects.push(rect);
        let owner = rects.len() as u16;
        fill_quad(&mut layers.outline, &quad, Luma([1]));
        fill_quad(&mut layers.score, &shrunk, Luma([1]));
        fill_quad(&mut layers.owner, &shrunk, Luma([owner]));
        stats.encoded += 1;
    }

    sample_layers(&layers, &rects, input_size, options.stride, stats)
}

fn sample_layers(
    layers: &Layers,
    rects: &[RotatedRect],
    input_size: u32,
    stride: u32,
    stats: PolygonStats,
) -> EncodedMaps {
    let stride = stride.max(1);
    let size = (input_size / stride) as usize;
    let mut score_map = Array2::<f32>::zeros((size, size));
    let mut geo_map = Array3::<f32>::zeros((size, size, GEO_CHANNELS));
    let mut small_text_mask = Array2::<f32>::zeros((size, size));
    let mut boundary_mask = Array2::<f32>::zeros((size, size));

    for oy in 0..size {
        for ox in 0..size {
            let (x, y) = (ox as u32 * stride, oy as u32 * stride);
            let inside = layers.score.get_pixel(x, y).0[0] != 0;
            let outline = layers.outline.get_pixel(x, y).0[0] != 0;
            let ignored = layers.ignored.get_pixel(x, y).0[0] != 0;

            if inside {
                score_map[[oy, ox]] = 1.0;
            }
            if ignored || (outline && !inside) {
                boundary_mask[[oy, ox]] = 1.0;
            }
            if layers.small.get_pixel(x, y).0[0] != 0 {
                small_text_mask[[oy, ox]] = 1.0;
            }

            let owner = layers.owner.get_pixel(x, y).0[0] as usize;
            if let Some(rect) = owner.checked_sub(1).and_then(|i| rects.get(i)) {
                let distances = rect.edge_distances(Coord {
                    x: x as f32,
                    y: y as f32,
                });
                for (ch, distance) in distances.into_iter().enumerate() {
                    geo_map[[oy, ox, ch]] = distance;
                }
                geo_map[[oy, ox, 4]] = rect.angle;
            }
        }
    }

    EncodedMaps {
        score_map,
        geo_map,
        small_text_mask,
        boundary_mask,
        stats,
    }
}

/// Normalizes the image and encodes the targets of one augmented sample.
#[instrument(level = "debug", skip_all)]
pub fn encode_sample(
    sample: &AugmentedSample,
    options: &EncoderOptions,
    normalization: &PixelNormalization,
) -> TrainingSample {
    let input_size = sample.image.width();
    let maps = encode(&sample.records, input_size, options);
    TrainingSample {
        path: sample.path.clone(),
        image: sample.to_tensor(normalization),
        small_text_mask: maps.small_text_mask,
        boundary_mask: maps.boundary_mask,
        score_map: maps.score_map,
        geo_map: maps.geo_map,
        stats: maps.stats,
    }
}
