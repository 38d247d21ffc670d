use image::{ImageBuffer, Pixel, Rgb, RgbImage};
use imageproc::{definitions::Image, drawing::draw_polygon_mut};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};
use tracing::instrument;

use crate::geometry::Quad;

/// Channel-wise `(pixel / 255 - mean) * norm`, and its inverse for visualization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelNormalization {
    pub mean: [f32; 3],
    pub norm: [f32; 3],
}

impl PixelNormalization {
    /// Maps `[0, 255]` onto `[-1, 1]`.
    pub const SYMMETRIC: Self = Self {
        mean: [0.5, 0.5, 0.5],
        norm: [2.0, 2.0, 2.0],
    };

    pub const IMAGENET: Self = Self {
        mean: [0.485, 0.456, 0.406],
        norm: [1.0 / 0.229, 1.0 / 0.224, 1.0 / 0.225],
    };
}

impl Default for PixelNormalization {
    fn default() -> Self {
        Self::SYMMETRIC
    }
}

#[instrument(level = "trace", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &RgbImage,
    normalization: &PixelNormalization,
) -> Array3<f32> {
    let norm = Rgb::<f32>(normalization.norm);
    let mean = Rgb::<f32>(normalization.mean);
    Array3::<f32>::from_shape_fn(
        (image.height() as usize, image.width() as usize, 3),
        |(y, x, ch)| {
            let pixel = image.get_pixel(x as u32, y as u32).channels()[ch] as f32 / 255.0;
            (pixel - mean.0[ch]) * norm.0[ch]
        },
    )
}

/// Inverse of the input normalization, clamped back into 8-bit RGB.
pub fn denormalize(data: ArrayView3<f32>, normalization: &PixelNormalization) -> RgbImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        Rgb(std::array::from_fn(|ch| {
            let value = data[[y as usize, x as usize, ch]] / normalization.norm[ch]
                + normalization.mean[ch];
            (value * 255.0).round().clamp(0.0, 255.0) as u8
        }))
    })
}

/// Converts a single-channel map into a grayscale image, `value * scale` per pixel.
pub(crate) fn to_luma_image(data: ArrayView2<f32>, scale: f32, offset: f32) -> image::GrayImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    let pixel_data = data
        .axis_iter(Axis(0))
        .flat_map(|it| it.into_iter())
        .map(|p| ((p + offset) * scale).clamp(0.0, 255.0) as u8)
        .collect::<Vec<u8>>();
    ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
        .unwrap_or_else(|| image::GrayImage::new(width as u32, height as u32))
}

/// Rasterizes the quad (edges included) onto `canvas`. Quads that collapse to fewer
/// than three pixel corners paint nothing.
pub(crate) fn fill_quad<P: Pixel>(canvas: &mut Image<P>, quad: &Quad, color: P) -> bool {
    let points = quad.to_pixel_points();
    if points.len() < 3 {
        return false;
    }
    draw_polygon_mut(canvas, &points, color);
    true
}
