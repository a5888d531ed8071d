//! Pair batch generator.
//!
//! Slices a [`PairSet`] into fixed-size, non-wrapping batches, gathers the
//! pixels of both sides from the [`ImageStore`] and augments each side
//! independently. A trailing partial batch is dropped.

use crate::augment::Augmentation;
use crate::images::{ImageLoadError, ImageStore};
use crate::pairs::PairSet;
use ndarray::{Array1, Array4};
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch size must be positive")]
    ZeroBatchSize,
    #[error("batch {index} out of range ({len} batches)")]
    OutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Image(#[from] ImageLoadError),
}

/// One training or validation batch: `([left, right], labels)`.
#[derive(Debug, Clone)]
pub struct PairBatch {
    pub left: Array4<f32>,
    pub right: Array4<f32>,
    pub labels: Array1<f32>,
}

impl PairBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Indexable sequence of batches over a pair set.
pub struct PairBatches<'a> {
    pairs: &'a PairSet,
    images: &'a ImageStore,
    batch_size: usize,
    augmentation: Augmentation,
}

impl<'a> PairBatches<'a> {
    pub fn new(
        pairs: &'a PairSet,
        images: &'a ImageStore,
        batch_size: usize,
        augmentation: Augmentation,
    ) -> Result<Self, BatchError> {
        if batch_size == 0 {
            return Err(BatchError::ZeroBatchSize);
        }
        Ok(Self {
            pairs,
            images,
            batch_size,
            augmentation,
        })
    }

    /// Number of full batches: `floor(pairs / batch_size)`.
    pub fn len(&self) -> usize {
        self.pairs.len() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Build batch `index`, covering pairs `[index * bs, (index + 1) * bs)`.
    pub fn get<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<PairBatch, BatchError> {
        if index >= self.len() {
            return Err(BatchError::OutOfRange {
                index,
                len: self.len(),
            });
        }

        let low = index * self.batch_size;
        let high = low + self.batch_size;

        let mut left = self.images.gather(&self.pairs.left[low..high])?;
        let mut right = self.images.gather(&self.pairs.right[low..high])?;
        self.augmentation.apply(&mut left, rng);
        self.augmentation.apply(&mut right, rng);

        Ok(PairBatch {
            left,
            right,
            labels: Array1::from(self.pairs.labels[low..high].to_vec()),
        })
    }

    /// Batch indices for one epoch, optionally in random order.
    pub fn epoch_order<R: Rng + ?Sized>(&self, shuffle: bool, rng: &mut R) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            order.shuffle(rng);
        }
        order
    }
}
