//! PNG dumps of batch tensors for eyeballing the ground truth.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ndarray::{s, Axis};
use tracing::instrument;

use crate::{
    error::Result,
    result::Batch,
    util::{denormalize, to_luma_image, PixelNormalization},
};

const GEO_CHANNEL_NAMES: [&str; 4] = ["top", "right", "bottom", "left"];

/// Writes the first `max_samples` samples of `batch` into `dir`, one PNG per tensor:
/// the de-normalized input, both masks, the score map and every geometry channel.
/// Distances are scaled by `255 / input_size`, the angle by `(θ + 1) · 127.5`.
#[instrument(skip(batch, normalization), fields(batch = batch.len()))]
pub fn write_batch_summaries(
    batch: &Batch,
    dir: &Path,
    prefix: &str,
    max_samples: usize,
    normalization: &PixelNormalization,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let input_size = batch.images.len_of(Axis(2)).max(1) as f32;
    let mut written = Vec::new();

    for i in 0..batch.len().min(max_samples) {
        let path = dir.join(format!("{prefix}_{i}_input.png"));
        denormalize(batch.images.slice(s![i, .., .., ..]), normalization).save(&path)?;
        written.push(path);

        let maps = [
            ("small_text_mask", &batch.small_text_masks),
            ("boundary_mask", &batch.boundary_masks),
            ("score_map", &batch.score_maps),
        ];
        for (name, map) in maps {
            let path = dir.join(format!("{prefix}_{i}_{name}.png"));
            to_luma_image(map.slice(s![i, .., .., 0]), 255.0, 0.0).save(&path)?;
            written.push(path);
        }

        for (ch, name) in GEO_CHANNEL_NAMES.iter().enumerate() {
            let path = dir.join(format!("{prefix}_{i}_geo_{name}.png"));
            to_luma_image(batch.geo_maps.slice(s![i, .., .., ch]), 255.0 / input_size, 0.0)
                .save(&path)?;
            written.push(path);
        }
        let path = dir.join(format!("{prefix}_{i}_geo_angle.png"));
        to_luma_image(batch.geo_maps.slice(s![i, .., .., 4]), 127.5, 1.0).save(&path)?;
        written.push(path);
    }

    log::debug!("Wrote {} summary images to {}", written.len(), dir.display());
    Ok(written)
}
