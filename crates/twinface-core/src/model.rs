//! Siamese model: one shared [`EmbeddingNet`] plus a single-unit sigmoid head
//! over `|embed(a) - embed(b)|`.

use crate::backend::{images_to_tensor, labels_to_tensor, tensor_to_vec};
use crate::network::{linear, EmbeddingNet, NetworkConfig, NetworkError};
use burn::module::Module;
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::nn::Linear;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use ndarray::{Array1, ArrayView4};
use serde::Serialize;
use twinface_data::PairBatch;

/// Probabilities are clamped to `[BCE_EPSILON, 1 - BCE_EPSILON]` before the log.
pub const BCE_EPSILON: f32 = 1e-7;
pub const DECISION_THRESHOLD: f32 = 0.5;

/// Loss and accuracy over a number of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StepStats {
    pub loss: f32,
    pub accuracy: f32,
    pub samples: usize,
}

impl StepStats {
    /// Sample-weighted mean of two runs.
    pub fn combine(self, other: StepStats) -> StepStats {
        let samples = self.samples + other.samples;
        if samples == 0 {
            return StepStats::default();
        }
        let (wa, wb) = (self.samples as f32, other.samples as f32);
        let total = samples as f32;
        StepStats {
            loss: (self.loss * wa + other.loss * wb) / total,
            accuracy: (self.accuracy * wa + other.accuracy * wb) / total,
            samples,
        }
    }

    /// Read back a batch loss and its probabilities.
    pub fn from_tensors<B: Backend>(
        loss: Tensor<B, 1>,
        probabilities: Tensor<B, 1>,
        labels: &Array1<f32>,
    ) -> Result<StepStats, NetworkError> {
        let loss = tensor_to_vec(loss)?.first().copied().unwrap_or(0.0);
        let probabilities = Array1::from(tensor_to_vec(probabilities)?);
        Ok(StepStats {
            loss,
            accuracy: accuracy(&probabilities, labels),
            samples: labels.len(),
        })
    }
}

/// Mean binary cross-entropy of probabilities against 0/1 targets.
pub fn binary_cross_entropy<B: Backend>(probabilities: Tensor<B, 1>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let device = probabilities.device();
    BinaryCrossEntropyLossConfig::new()
        .init::<B>(&device)
        .forward(probabilities.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON), targets)
}

/// Fraction of samples where `(p > 0.5) == label`.
pub fn accuracy(probabilities: &Array1<f32>, labels: &Array1<f32>) -> f32 {
    if probabilities.is_empty() {
        return 0.0;
    }
    let correct = probabilities
        .iter()
        .zip(labels.iter())
        .filter(|(&p, &y)| (p > DECISION_THRESHOLD) == (y > DECISION_THRESHOLD))
        .count();
    correct as f32 / probabilities.len() as f32
}

#[derive(Module, Debug)]
pub struct SiameseModel<B: Backend> {
    net: EmbeddingNet<B>,
    head: Linear<B>,
}

impl<B: Backend> SiameseModel<B> {
    pub fn new(config: NetworkConfig, device: &B::Device) -> Result<Self, NetworkError> {
        let net = config.init(device)?;
        let head = linear(net.embedding_dim(), 1, device);
        Ok(Self { net, head })
    }

    pub fn network(&self) -> &EmbeddingNet<B> {
        &self.net
    }

    pub fn config(&self) -> &NetworkConfig {
        self.net.config()
    }

    pub fn validate(&self) -> Result<(), NetworkError> {
        self.net.validate()?;
        let dims = self.head.weight.val().dims();
        if dims != [self.net.embedding_dim(), 1] {
            return Err(NetworkError::Inconsistent(format!(
                "head weight is {dims:?}, expected [{}, 1]",
                self.net.embedding_dim()
            )));
        }
        Ok(())
    }

    /// Similarity probability per pair. Both branches share every weight, so
    /// backpropagating through this accumulates both branches' gradients.
    pub fn forward(&self, left: Tensor<B, 4>, right: Tensor<B, 4>) -> Tensor<B, 1> {
        let distance = (self.net.forward(left) - self.net.forward(right)).abs();
        sigmoid(self.head.forward(distance)).flatten::<1>(0, 1)
    }

    fn check_pair(&self, left: &ArrayView4<'_, f32>, right: &ArrayView4<'_, f32>) -> Result<(), NetworkError> {
        if left.dim() != right.dim() {
            return Err(NetworkError::PairShape {
                left: left.dim(),
                right: right.dim(),
            });
        }
        self.net.check_input(left.dim())
    }

    /// Batch loss and per-pair probabilities, with dropout on autodiff backends.
    pub fn batch_loss(&self, batch: &PairBatch) -> Result<(Tensor<B, 1>, Tensor<B, 1>), NetworkError> {
        self.check_pair(&batch.left.view(), &batch.right.view())?;
        let device = self.net.device();
        let probabilities = self.forward(
            images_to_tensor(batch.left.view(), &device),
            images_to_tensor(batch.right.view(), &device),
        );
        let loss = binary_cross_entropy(probabilities.clone(), labels_to_tensor(&batch.labels, &device));
        Ok((loss, probabilities))
    }

    /// Similarity probability for each `(left[i], right[i])`.
    pub fn predict(&self, left: ArrayView4<'_, f32>, right: ArrayView4<'_, f32>) -> Result<Array1<f32>, NetworkError> {
        self.check_pair(&left, &right)?;
        let device = self.net.device();
        let probabilities = self.forward(images_to_tensor(left, &device), images_to_tensor(right, &device));
        Ok(Array1::from(tensor_to_vec(probabilities)?))
    }

    /// Loss and accuracy on a batch. Call on an inference backend (or a
    /// `valid()` copy) to keep dropout off.
    pub fn evaluate(&self, batch: &PairBatch) -> Result<StepStats, NetworkError> {
        let (loss, probabilities) = self.batch_loss(batch)?;
        StepStats::from_tensors(loss, probabilities, &batch.labels)
    }
}
