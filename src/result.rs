use std::path::PathBuf;

use ndarray::{s, Array2, Array3, Array4, Axis};
use tracing::instrument;

use crate::encoder::{PolygonStats, GEO_CHANNELS};

/// Everything the training loop needs for one image.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub path: PathBuf,
    /// `(input_size, input_size, 3)`, normalized.
    pub image: Array3<f32>,
    pub small_text_mask: Array2<f32>,
    pub boundary_mask: Array2<f32>,
    pub score_map: Array2<f32>,
    pub geo_map: Array3<f32>,
    pub stats: PolygonStats,
}

/// A stack of samples in NHWC layout. Maps are at output resolution.
#[derive(Debug, Clone)]
pub struct Batch {
    pub paths: Vec<PathBuf>,
    pub images: Array4<f32>,
    pub small_text_masks: Array4<f32>,
    pub boundary_masks: Array4<f32>,
    pub score_maps: Array4<f32>,
    pub geo_maps: Array4<f32>,
}

impl Batch {
    /// Copies the samples into batch-sized arrays. All samples must share one input size.
    #[instrument(level = "trace", skip_all, fields(samples = samples.len()))]
    pub fn from_samples(samples: Vec<TrainingSample>) -> Self {
        let len = samples.len();
        let (input_h, input_w) = samples
            .first()
            .map(|it| (it.image.len_of(Axis(0)), it.image.len_of(Axis(1))))
            .unwrap_or((0, 0));
        let (map_h, map_w) = samples
            .first()
            .map(|it| it.score_map.dim())
            .unwrap_or((0, 0));

        let mut batch = Self {
            paths: Vec::with_capacity(len),
            images: Array4::zeros((len, input_h, input_w, 3)),
            small_text_masks: Array4::zeros((len, map_h, map_w, 1)),
            boundary_masks: Array4::zeros((len, map_h, map_w, 1)),
            score_maps: Array4::zeros((len, map_h, map_w, 1)),
            geo_maps: Array4::zeros((len, map_h, map_w, GEO_CHANNELS)),
        };
        for (i, sample) in samples.into_iter().enumerate() {
            batch.images.slice_mut(s![i, .., .., ..]).assign(&sample.image);
            batch
                .small_text_masks
                .slice_mut(s![i, .., .., 0])
                .assign(&sample.small_text_mask);
            batch
                .boundary_masks
                .slice_mut(s![i, .., .., 0])
                .assign(&sample.boundary_mask);
            batch
                .score_maps
                .slice_mut(s![i, .., .., 0])
                .assign(&sample.score_map);
            batch.geo_maps.slice_mut(s![i, .., .., ..]).assign(&sample.geo_map);
            batch.paths.push(sample.path);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Running counters of a batch generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    pub encoded: usize,
    pub missing_annotation: usize,
    pub unreadable: usize,
    pub failed: usize,
}

impl SampleStats {
    pub fn skipped(&self) -> usize {
        self.missing_annotation + self.unreadable + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fill: f32) -> TrainingSample {
        TrainingSample {
            path: PathBuf::from(format!("{fill}.png")),
            image: Array3::from_elem((8, 8, 3), fill),
            small_text_mask: Array2::from_elem((2, 2), fill),
            boundary_mask: Array2::zeros((2, 2)),
            score_map: Array2::from_elem((2, 2), 1.0),
            geo_map: Array3::from_elem((2, 2, GEO_CHANNELS), fill),
            stats: PolygonStats::default(),
        }
    }

    #[test]
    fn stacks_samples_in_order() {
        let batch = Batch::from_samples(vec![sample(0.25), sample(0.5), sample(0.75)]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.images.shape(), &[3, 8, 8, 3]);
        assert_eq!(batch.score_maps.shape(), &[3, 2, 2, 1]);
        assert_eq!(batch.geo_maps.shape(), &[3, 2, 2, 5]);
        assert_eq!(batch.images[[1, 7, 7, 2]], 0.5);
        assert_eq!(batch.small_text_masks[[2, 1, 0, 0]], 0.75);
        assert_eq!(batch.geo_maps[[0, 0, 1, 4]], 0.25);
        assert_eq!(batch.paths[2], PathBuf::from("0.75.png"));
    }
}
