//! Reference loss terms over the encoder's output layout.
//!
//! Masks follow the encoder convention (1 = suppressed) and are turned into a
//! per-pixel training weight `min((1 - small) + small_text_weight, 1) * (1 - boundary)`.

use ndarray::{Array4, ArrayView4, Zip};
use tracing::instrument;

use crate::{result::Batch, training::TrainingConfig};

const DICE_EPSILON: f32 = 1e-5;
const ANGLE_LOSS_WEIGHT: f32 = 20.0;

/// Network outputs at output resolution. `score` holds probabilities in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Predictions {
    /// `(b, h, w, 1)`
    pub score: Array4<f32>,
    /// `(b, h, w, 5)`
    pub geometry: Array4<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossTerms {
    pub score_map: f32,
    pub geo_map: f32,
}

impl LossTerms {
    pub fn total(&self) -> f32 {
        self.score_map + self.geo_map
    }
}

pub fn training_weight(
    small_text_mask: ArrayView4<f32>,
    boundary_mask: ArrayView4<f32>,
    small_text_weight: f32,
) -> Array4<f32> {
    Zip::from(&small_text_mask)
        .and(&boundary_mask)
        .map_collect(|small, boundary| {
            ((1.0 - small) + small_text_weight).min(1.0) * (1.0 - boundary)
        })
}

/// `(1 - 2·|P∩G| / (|P| + |G|)) · score_map_loss_weight`
pub fn dice_loss(
    predicted: ArrayView4<f32>,
    target: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    score_map_loss_weight: f32,
) -> f32 {
    let mut intersection = 0.0;
    let mut union = DICE_EPSILON;
    Zip::from(&predicted)
        .and(&target)
        .and(&weight)
        .for_each(|p, t, w| {
            intersection += p * t * w;
            union += p * w + t * w;
        });
    (1.0 - 2.0 * intersection / union) * score_map_loss_weight
}

/// Mean over all pixels of `(-ln((A∩+1)/(A∪+1)) + 20·(1 - cos Δθ)) · score · weight`.
pub fn rbox_loss(
    predicted: ArrayView4<f32>,
    target: ArrayView4<f32>,
    target_score: ArrayView4<f32>,
    weight: ArrayView4<f32>,
) -> f32 {
    let (batch, height, width, _) = target_score.dim();
    let pixels = batch * height * width;
    if pixels == 0 {
        return 0.0;
    }

    let mut total = 0.0;
    for ((b, y, x, _), score) in target_score.indexed_iter() {
        let w = score * weight[[b, y, x, 0]];
        if w == 0.0 {
            continue;
        }
        let gt = |ch: usize| target[[b, y, x, ch]];
        let pr = |ch: usize| predicted[[b, y, x, ch]];

        let area_gt = (gt(0) + gt(2)) * (gt(1) + gt(3));
        let area_pred = (pr(0) + pr(2)) * (pr(1) + pr(3));
        let w_intersect = gt(1).min(pr(1)) + gt(3).min(pr(3));
        let h_intersect = gt(0).min(pr(0)) + gt(2).min(pr(2));
        let intersection = w_intersect * h_intersect;
        let union = area_gt + area_pred - intersection;

        let aabb = -((intersection + 1.0) / (union + 1.0)).ln();
        let angle = 1.0 - (pr(4) - gt(4)).cos();
        total += (aabb + ANGLE_LOSS_WEIGHT * angle) * w;
    }
    total / pixels as f32
}

/// Both loss terms of one batch, weighted by the current training configuration.
#[instrument(level = "trace", skip_all, fields(batch = batch.len()))]
pub fn compute_loss(predictions: &Predictions, batch: &Batch, config: &TrainingConfig) -> LossTerms {
    let weight = training_weight(
        batch.small_text_masks.view(),
        batch.boundary_masks.view(),
        config.small_text_weight,
    );
    LossTerms {
        score_map: dice_loss(
            predictions.score.view(),
            batch.score_maps.view(),
            weight.view(),
            config.score_map_loss_weight,
        ),
        geo_map: rbox_loss(
            predictions.geometry.view(),
            batch.geo_maps.view(),
            batch.score_maps.view(),
            weight.view(),
        ),
    }
}
