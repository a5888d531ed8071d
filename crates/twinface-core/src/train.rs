//! Training loop: Adam over shuffled pair batches, per-epoch validation,
//! best-checkpoint saving and early stopping on validation accuracy.

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::model::{SiameseModel, StepStats};
use crate::network::NetworkError;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use twinface_data::{Augmentation, BatchError, ImageStore, PairBatch, PairBatches, PairSet};

pub const DEFAULT_EPOCHS: usize = 20;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_LEARNING_RATE: f32 = 1e-3;
pub const DEFAULT_PATIENCE: usize = 3;
pub const ADAM_BETA_1: f32 = 0.9;
pub const ADAM_BETA_2: f32 = 0.999;
pub const ADAM_EPSILON: f32 = 1e-7;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no full training batch: {pairs} pairs with batch size {batch_size}")]
    NoBatches { pairs: usize, batch_size: usize },
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    /// Visit training batches in a random order each epoch.
    pub shuffle_batches: bool,
    pub augmentation: Augmentation,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            learning_rate: DEFAULT_LEARNING_RATE,
            patience: DEFAULT_PATIENCE,
            shuffle_batches: true,
            augmentation: Augmentation::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Improved,
    Stalled,
    Stop,
}

/// Tracks the best metric seen; higher is better, ties do not count.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f32>,
    stalled: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            stalled: 0,
        }
    }

    pub fn observe(&mut self, metric: f32) -> Progress {
        match self.best {
            Some(best) if metric <= best => {
                self.stalled += 1;
                if self.stalled >= self.patience {
                    Progress::Stop
                } else {
                    Progress::Stalled
                }
            }
            _ => {
                self.best = Some(metric);
                self.stalled = 0;
                Progress::Improved
            }
        }
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochStats {
    /// 1-based.
    pub epoch: usize,
    pub train: StepStats,
    /// `None` when the test split has no pairs.
    pub validation: Option<StepStats>,
}

impl EpochStats {
    /// Metric driving checkpointing and early stopping.
    pub fn monitored(&self) -> f32 {
        self.validation.map_or(self.train.accuracy, |v| v.accuracy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub history: Vec<EpochStats>,
    /// 0 when no epoch ran.
    pub best_epoch: usize,
    pub best_accuracy: f32,
    pub stopped_early: bool,
}

fn validate<B: Backend, R: Rng + ?Sized>(
    model: &SiameseModel<B>,
    batches: &PairBatches<'_>,
    rng: &mut R,
) -> Result<Option<StepStats>, TrainError> {
    if batches.is_empty() {
        return Ok(None);
    }
    let mut stats = StepStats::default();
    for index in 0..batches.len() {
        let batch = batches.get(index, rng)?;
        stats = stats.combine(model.evaluate(&batch)?);
    }
    Ok(Some(stats))
}

pub fn adam() -> AdamConfig {
    AdamConfig::new()
        .with_beta_1(ADAM_BETA_1)
        .with_beta_2(ADAM_BETA_2)
        .with_epsilon(ADAM_EPSILON)
}

/// One optimiser step on `batch`. Returns the updated model and the batch
/// statistics measured before the update.
pub fn train_step<B, O>(
    model: SiameseModel<B>,
    batch: &PairBatch,
    optimizer: &mut O,
    learning_rate: f32,
) -> Result<(SiameseModel<B>, StepStats), NetworkError>
where
    B: AutodiffBackend,
    O: Optimizer<SiameseModel<B>, B>,
{
    let (loss, probabilities) = model.batch_loss(batch)?;
    let stats = StepStats::from_tensors(loss.clone(), probabilities, &batch.labels)?;
    let grads = GradientsParams::from_grads(loss.backward(), &model);
    let model = optimizer.step(f64::from(learning_rate), model, grads);
    Ok((model, stats))
}

/// Train `model` and return the best weights seen, which are also written
/// to `checkpoint_path` each time they improve.
pub fn fit<B: AutodiffBackend, R: Rng + ?Sized>(
    model: SiameseModel<B>,
    train: &PairSet,
    test: &PairSet,
    images: &ImageStore,
    config: &TrainConfig,
    checkpoint_path: Option<&Path>,
    rng: &mut R,
) -> Result<(SiameseModel<B>, TrainReport), TrainError> {
    let train_batches = PairBatches::new(train, images, config.batch_size, config.augmentation)?;
    if train_batches.is_empty() {
        return Err(TrainError::NoBatches {
            pairs: train.len(),
            batch_size: config.batch_size,
        });
    }
    // Shrink the validation batch so a small test split still yields one.
    let val_batch_size = config.batch_size.min(test.len()).max(1);
    let val_batches = PairBatches::new(test, images, val_batch_size, Augmentation::none())?;

    tracing::info!(
        train_pairs = train.len(),
        test_pairs = test.len(),
        train_batches = train_batches.len(),
        val_batches = val_batches.len(),
        epochs = config.epochs,
        parameters = model.num_params(),
        "starting training"
    );

    // Dropout masks follow the caller's seed.
    B::seed(rng.gen());
    let mut optimizer = adam().init();
    let mut model = model;
    let mut stopper = EarlyStopping::new(config.patience);
    let mut history = Vec::with_capacity(config.epochs);
    let mut best: Option<(usize, SiameseModel<B>)> = None;
    let mut stopped_early = false;

    for epoch in 1..=config.epochs {
        let mut train_stats = StepStats::default();
        for index in train_batches.epoch_order(config.shuffle_batches, rng) {
            let batch = train_batches.get(index, rng)?;
            let (next, stats) = train_step(model, &batch, &mut optimizer, config.learning_rate)?;
            model = next;
            train_stats = train_stats.combine(stats);
        }

        let frozen = model.valid();
        let stats = EpochStats {
            epoch,
            train: train_stats,
            validation: validate(&frozen, &val_batches, rng)?,
        };
        let monitored = stats.monitored();

        tracing::info!(
            epoch,
            loss = stats.train.loss,
            accuracy = stats.train.accuracy,
            val_loss = stats.validation.map(|v| v.loss),
            val_accuracy = stats.validation.map(|v| v.accuracy),
            "epoch finished"
        );
        history.push(stats);

        match stopper.observe(monitored) {
            Progress::Improved => {
                tracing::info!(epoch, val_accuracy = monitored, "validation accuracy improved");
                if let Some(path) = checkpoint_path {
                    Checkpoint::new(model.config().clone(), epoch, monitored, *images.config()).save(path, &frozen)?;
                }
                best = Some((epoch, model.clone()));
            }
            Progress::Stalled => {}
            Progress::Stop => {
                tracing::info!(epoch, patience = config.patience, "early stopping");
                stopped_early = true;
                break;
            }
        }
    }

    let best_accuracy = stopper.best().unwrap_or(0.0);
    let best_epoch = match best {
        Some((epoch, weights)) => {
            model = weights;
            epoch
        }
        None => 0,
    };

    tracing::info!(best_epoch, best_accuracy, stopped_early, "training finished");
    let report = TrainReport {
        history,
        best_epoch,
        best_accuracy,
        stopped_early,
    };
    Ok((model, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{device, InferenceBackend, TrainBackend};
    use crate::network::NetworkConfig;
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;
    use tempfile::TempDir;
    use twinface_data::ImageConfig;

    #[rstest]
    #[case(&[0.5, 0.6, 0.6, 0.6, 0.7], 3, vec![Progress::Improved, Progress::Improved, Progress::Stalled, Progress::Stalled, Progress::Improved])]
    #[case(&[0.5, 0.4, 0.5, 0.3], 3, vec![Progress::Improved, Progress::Stalled, Progress::Stalled, Progress::Stop])]
    #[case(&[0.5, 0.5], 1, vec![Progress::Improved, Progress::Stop])]
    fn test_early_stopping(#[case] metrics: &[f32], #[case] patience: usize, #[case] expected: Vec<Progress>) {
        let mut stopper = EarlyStopping::new(patience);
        let got: Vec<_> = metrics.iter().map(|&m| stopper.observe(m)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_early_stopping_resets_after_improvement() {
        let mut stopper = EarlyStopping::new(2);
        stopper.observe(0.5);
        assert_eq!(stopper.observe(0.4), Progress::Stalled);
        assert_eq!(stopper.observe(0.6), Progress::Improved);
        assert_eq!(stopper.observe(0.6), Progress::Stalled);
        assert_eq!(stopper.observe(0.1), Progress::Stop);
        assert_eq!(stopper.best(), Some(0.6));
    }

    /// Images of identity `k` are filled with `k / n`; pairs alternate positive/negative.
    fn fixture(images: usize, pairs: usize) -> (ImageStore, PairSet) {
        let pixels = Array4::from_shape_fn((images, 3, 8, 8), |(i, c, y, x)| {
            ((i / 2) as f32 + 0.1 * c as f32 + 0.01 * (y * x) as f32) / images as f32
        });
        let store = ImageStore::from_pixels(pixels, ImageConfig { resize: 8, crop: 8 });
        let mut set = PairSet::default();
        for p in 0..pairs {
            let a = (2 * p) % images;
            if p % 2 == 0 {
                set.push((a, a + 1), 1.0);
            } else {
                set.push((a, (a + 2) % images), 0.0);
            }
        }
        (store, set)
    }

    fn model() -> SiameseModel<TrainBackend> {
        let config = NetworkConfig {
            input_size: 8,
            channels: vec![2, 4],
            convs_per_block: 1,
            embedding_dim: 4,
            dropout: 0.0,
            ..NetworkConfig::default()
        };
        SiameseModel::new(config, &device()).unwrap()
    }

    fn config(epochs: usize, patience: usize) -> TrainConfig {
        TrainConfig {
            epochs,
            batch_size: 4,
            learning_rate: 1e-2,
            patience,
            shuffle_batches: true,
            augmentation: Augmentation::none(),
        }
    }

    #[test]
    fn test_train_step_reduces_loss_on_fixed_batch() {
        let (store, pairs) = fixture(12, 4);
        let batches = PairBatches::new(&pairs, &store, 4, Augmentation::none()).unwrap();
        let batch = batches.get(0, &mut StdRng::seed_from_u64(0)).unwrap();
        let mut m = model();
        let mut optimizer = adam().init();

        let before = m.valid().evaluate(&batch).unwrap().loss;
        for _ in 0..40 {
            let (next, stats) = train_step(m, &batch, &mut optimizer, 1e-2).unwrap();
            assert_eq!(stats.samples, 4);
            m = next;
        }
        let after = m.valid().evaluate(&batch).unwrap().loss;
        assert!(after < before, "loss went from {before} to {after}");
    }

    #[test]
    fn test_fit_records_history_and_checkpoints() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("best.json");
        let (store, train) = fixture(12, 12);
        let (_, test) = fixture(12, 6);
        let mut rng = StdRng::seed_from_u64(1);

        let (m, report) = fit(model(), &train, &test, &store, &config(3, 10), Some(&path), &mut rng).unwrap();

        assert_eq!(report.history.len(), 3);
        assert!(!report.stopped_early);
        assert!(report.best_epoch >= 1 && report.best_epoch <= 3);
        for (i, epoch) in report.history.iter().enumerate() {
            assert_eq!(epoch.epoch, i + 1);
            assert_eq!(epoch.train.samples, 12);
            // Six test pairs at batch size 4 leave one full validation batch.
            assert_eq!(epoch.validation.map(|v| v.samples), Some(4));
        }

        let (saved, loaded) = Checkpoint::load::<InferenceBackend>(&path, &device()).unwrap();
        assert_eq!(saved.epoch, report.best_epoch);
        assert_eq!(saved.val_accuracy, report.best_accuracy);
        assert_eq!(loaded.config(), m.config());
    }

    #[test]
    fn test_fit_restores_best_weights() {
        let (store, train) = fixture(12, 12);
        let (_, test) = fixture(12, 6);
        let mut rng = StdRng::seed_from_u64(2);

        let (m, report) = fit(model(), &train, &test, &store, &config(4, 10), None, &mut rng).unwrap();

        // Re-evaluating the returned model reproduces the best recorded accuracy.
        let batches = PairBatches::new(&test, &store, 4usize.min(test.len()), Augmentation::none()).unwrap();
        let stats = validate(&m.valid(), &batches, &mut rng).unwrap().unwrap();
        approx::assert_relative_eq!(stats.accuracy, report.best_accuracy, epsilon = 1e-6);
    }

    #[test]
    fn test_fit_stops_early_with_zero_learning_rate() {
        let (store, train) = fixture(12, 12);
        let (_, test) = fixture(12, 6);
        let mut rng = StdRng::seed_from_u64(3);
        let config = TrainConfig {
            learning_rate: 0.0,
            ..config(10, 2)
        };

        let (_, report) = fit(model(), &train, &test, &store, &config, None, &mut rng).unwrap();

        // Frozen weights never improve after the first epoch.
        assert!(report.stopped_early);
        assert_eq!(report.history.len(), 3);
        assert_eq!(report.best_epoch, 1);
    }

    #[test]
    fn test_fit_without_full_batch_fails() {
        let (store, train) = fixture(12, 3);
        let err = fit(
            model(),
            &train,
            &PairSet::default(),
            &store,
            &config(1, 1),
            None,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::NoBatches { pairs: 3, batch_size: 4 }));
    }

    #[test]
    fn test_empty_test_split_monitors_training_accuracy() {
        let (store, train) = fixture(12, 8);
        let (_, report) = fit(
            model(),
            &train,
            &PairSet::default(),
            &store,
            &config(1, 1),
            None,
            &mut StdRng::seed_from_u64(4),
        )
        .unwrap();
        let epoch = &report.history[0];
        assert!(epoch.validation.is_none());
        assert_eq!(report.best_accuracy, epoch.train.accuracy);
    }
}
