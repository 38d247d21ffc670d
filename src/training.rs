//! Training-loop plumbing: configuration, the network seam and lifecycle hooks.
//!
//! The loop owns the [`TrainingConfig`]; hooks receive it by reference at fixed points
//! (epoch start, batch end, epoch end) and may adjust the loss weights or the learning
//! rate there.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ndarray::ArrayView4;
use tracing::instrument;

use crate::{
    error::Result,
    loss::{compute_loss, LossTerms, Predictions},
    result::Batch,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub init_learning_rate: f32,
    pub lr_decay_rate: f32,
    pub lr_decay_steps: usize,
    pub max_epochs: usize,
    pub steps_per_epoch: usize,
    pub save_checkpoint_epochs: usize,
    pub checkpoint_dir: PathBuf,
    pub score_map_loss_weight: f32,
    pub small_text_weight: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            init_learning_rate: 1e-4,
            lr_decay_rate: 0.94,
            lr_decay_steps: 130,
            max_epochs: 800,
            steps_per_epoch: 100,
            save_checkpoint_epochs: 10,
            checkpoint_dir: PathBuf::from("checkpoints"),
            score_map_loss_weight: 0.01,
            small_text_weight: 0.0,
        }
    }
}

impl TrainingConfig {
    /// Staircase decay: `init · rate^⌊epoch / steps⌋`.
    pub fn learning_rate(&self, epoch: usize) -> f32 {
        let exponent = epoch / self.lr_decay_steps.max(1);
        self.init_learning_rate * self.lr_decay_rate.powi(exponent as i32)
    }
}

/// The detection network as the training loop sees it.
pub trait Network {
    /// `images` is `(b, input_size, input_size, 3)`.
    fn forward(&mut self, images: ArrayView4<f32>) -> Result<Predictions>;

    fn save_weights(&self, path: &Path) -> Result<()>;

    fn set_learning_rate(&mut self, _learning_rate: f32) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    pub batches: usize,
    pub loss: f32,
    pub score_map_loss: f32,
    pub geo_map_loss: f32,
}

impl EpochMetrics {
    fn add(&mut self, terms: &LossTerms) {
        let n = self.batches as f32;
        let mean = |old: f32, new: f32| (old * n + new) / (n + 1.0);
        self.loss = mean(self.loss, terms.total());
        self.score_map_loss = mean(self.score_map_loss, terms.score_map);
        self.geo_map_loss = mean(self.geo_map_loss, terms.geo_map);
        self.batches += 1;
    }
}

/// Epochs are 0-based.
pub trait TrainingHook {
    fn on_epoch_start(
        &mut self,
        _epoch: usize,
        _network: &mut dyn Network,
        _config: &mut TrainingConfig,
    ) -> Result<()> {
        Ok(())
    }

    fn on_batch_end(&mut self, _epoch: usize, _batch: usize, _loss: &LossTerms) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        _metrics: &EpochMetrics,
        _network: &mut dyn Network,
        _config: &mut TrainingConfig,
    ) -> Result<()> {
        Ok(())
    }
}

/// Saves weights every `period` epochs as `model-{epoch:02}.weights` (1-based epoch).
pub struct CheckpointHook {
    dir: PathBuf,
    period: usize,
    since_last_save: usize,
}

impl CheckpointHook {
    pub fn new(dir: impl Into<PathBuf>, period: usize) -> Self {
        Self {
            dir: dir.into(),
            period: period.max(1),
            since_last_save: 0,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(&config.checkpoint_dir, config.save_checkpoint_epochs)
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("model-{:02}.weights", epoch + 1))
    }
}

impl TrainingHook for CheckpointHook {
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        _metrics: &EpochMetrics,
        network: &mut dyn Network,
        _config: &mut TrainingConfig,
    ) -> Result<()> {
        self.since_last_save += 1;
        if self.since_last_save < self.period {
            return Ok(());
        }
        self.since_last_save = 0;
        fs::create_dir_all(&self.dir)?;
        let path = self.checkpoint_path(epoch);
        log::info!("Saving checkpoint to {}", path.display());
        network.save_weights(&path)
    }
}

pub struct LearningRateHook;

impl TrainingHook for LearningRateHook {
    fn on_epoch_start(
        &mut self,
        epoch: usize,
        network: &mut dyn Network,
        config: &mut TrainingConfig,
    ) -> Result<()> {
        let learning_rate = config.learning_rate(epoch);
        log::debug!("Epoch {}: learning rate {learning_rate:e}", epoch + 1);
        network.set_learning_rate(learning_rate);
        Ok(())
    }
}

/// Holds the small-text weight at a constant value.
pub struct SmallTextWeightHook {
    pub weight: f32,
}

impl Default for SmallTextWeightHook {
    fn default() -> Self {
        Self { weight: 0.0 }
    }
}

impl TrainingHook for SmallTextWeightHook {
    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        _metrics: &EpochMetrics,
        _network: &mut dyn Network,
        config: &mut TrainingConfig,
    ) -> Result<()> {
        config.small_text_weight = self.weight;
        Ok(())
    }
}

/// Runs `config.max_epochs` epochs of `config.steps_per_epoch` batches each.
///
/// Stops early if `batches` runs dry. Returns the metrics of every finished epoch.
#[instrument(skip_all, fields(epochs = config.max_epochs))]
pub fn train(
    network: &mut dyn Network,
    batches: &mut dyn Iterator<Item = Batch>,
    config: &mut TrainingConfig,
    hooks: &mut [Box<dyn TrainingHook>],
) -> Result<Vec<EpochMetrics>> {
    let mut history = Vec::with_capacity(config.max_epochs);
    for epoch in 0..config.max_epochs {
        for hook in hooks.iter_mut() {
            hook.on_epoch_start(epoch, network, config)?;
        }

        let mut metrics = EpochMetrics::default();
        for (step, batch) in (&mut *batches).take(config.steps_per_epoch).enumerate() {
            let predictions = network.forward(batch.images.view())?;
            let terms = compute_loss(&predictions, &batch, config);
            metrics.add(&terms);
            for hook in hooks.iter_mut() {
                hook.on_batch_end(epoch, step, &terms)?;
            }
        }
        if metrics.batches == 0 {
            log::warn!("No batches left, stopping after {epoch} epochs");
            break;
        }

        log::info!(
            "Epoch {}: loss {:.4}, score map {:.4}, geo map {:.4}",
            epoch + 1,
            metrics.loss,
            metrics.score_map_loss,
            metrics.geo_map_loss
        );
        for hook in hooks.iter_mut() {
            hook.on_epoch_end(epoch, &metrics, network, config)?;
        }
        history.push(metrics);
    }
    Ok(history)
}

/// Mean loss over every batch of `batches`, typically one validation pass.
#[instrument(skip_all)]
pub fn evaluate(
    network: &mut dyn Network,
    batches: impl IntoIterator<Item = Batch>,
    config: &TrainingConfig,
) -> Result<EpochMetrics> {
    let mut metrics = EpochMetrics::default();
    for batch in batches {
        let predictions = network.forward(batch.images.view())?;
        metrics.add(&compute_loss(&predictions, &batch, config));
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array3, Array4};

    use super::*;
    use crate::{encoder::PolygonStats, result::TrainingSample};

    /// Predicts the all-zero map and records what the loop asked of it.
    #[derive(Default)]
    struct MockNetwork {
        forwards: usize,
        learning_rates: Vec<f32>,
    }

    impl Network for MockNetwork {
        fn forward(&mut self, images: ArrayView4<f32>) -> Result<Predictions> {
            self.forwards += 1;
            let (b, h, w, _) = images.dim();
            Ok(Predictions {
                score: Array4::zeros((b, h / 4, w / 4, 1)),
                geometry: Array4::zeros((b, h / 4, w / 4, 5)),
            })
        }

        fn save_weights(&self, path: &Path) -> Result<()> {
            fs::write(path, self.forwards.to_string())?;
            Ok(())
        }

        fn set_learning_rate(&mut self, learning_rate: f32) {
            self.learning_rates.push(learning_rate);
        }
    }

    fn batch() -> Batch {
        let mut score_map = Array2::zeros((2, 2));
        score_map[[0, 0]] = 1.0;
        Batch::from_samples(vec![TrainingSample {
            path: PathBuf::from("a.png"),
            image: Array3::zeros((8, 8, 3)),
            small_text_mask: Array2::zeros((2, 2)),
            boundary_mask: Array2::zeros((2, 2)),
            score_map,
            geo_map: Array3::from_elem((2, 2, 5), 2.0),
            stats: PolygonStats::default(),
        }])
    }

    #[test]
    fn learning_rate_decays_in_steps() {
        let config = TrainingConfig::default();
        assert_eq!(config.learning_rate(0), 1e-4);
        assert_eq!(config.learning_rate(129), 1e-4);
        assert!((config.learning_rate(130) - 0.94e-4).abs() < 1e-10);
        assert!((config.learning_rate(260) - 0.94 * 0.94 * 1e-4).abs() < 1e-10);
    }

    #[test]
    fn hooks_run_at_lifecycle_points() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TrainingConfig {
            max_epochs: 4,
            steps_per_epoch: 3,
            lr_decay_steps: 2,
            save_checkpoint_epochs: 2,
            checkpoint_dir: dir.path().join("ckpt"),
            small_text_weight: 0.7,
            ..Default::default()
        };
        let mut hooks: Vec<Box<dyn TrainingHook>> = vec![
            Box::new(LearningRateHook),
            Box::new(CheckpointHook::from_config(&config)),
            Box::new(SmallTextWeightHook::default()),
        ];
        let mut network = MockNetwork::default();
        let mut batches = std::iter::repeat_with(batch);

        let history = train(&mut network, &mut batches, &mut config, &mut hooks).unwrap();

        assert_eq!(history.len(), 4);
        assert!(history.iter().all(|it| it.batches == 3));
        assert_eq!(network.forwards, 12);
        assert_eq!(network.learning_rates.len(), 4);
        assert_eq!(network.learning_rates[0], network.learning_rates[1]);
        assert!(network.learning_rates[2] < network.learning_rates[1]);
        assert_eq!(config.small_text_weight, 0.0);

        let ckpt = dir.path().join("ckpt");
        assert!(!ckpt.join("model-01.weights").exists());
        assert_eq!(fs::read_to_string(ckpt.join("model-02.weights")).unwrap(), "6");
        assert_eq!(fs::read_to_string(ckpt.join("model-04.weights")).unwrap(), "12");
    }

    #[test]
    fn stops_when_batches_run_out() {
        let mut config = TrainingConfig {
            max_epochs: 5,
            steps_per_epoch: 2,
            ..Default::default()
        };
        let mut network = MockNetwork::default();
        let mut batches = std::iter::repeat_with(batch).take(3);
        let history = train(&mut network, &mut batches, &mut config, &mut []).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].batches, 1);
    }

    #[test]
    fn evaluation_averages_losses() {
        let config = TrainingConfig::default();
        let mut network = MockNetwork::default();
        let metrics = evaluate(&mut network, vec![batch(), batch()], &config).unwrap();
        assert_eq!(metrics.batches, 2);
        // all-zero prediction: dice loss is the full weight
        assert!((metrics.score_map_loss - 0.01).abs() < 1e-6);
        assert!(metrics.geo_map_loss > 0.0);
        assert!((metrics.loss - metrics.score_map_loss - metrics.geo_map_loss).abs() < 1e-6);
    }
}
