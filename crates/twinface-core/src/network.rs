//! Convolutional embedding network shared by both Siamese branches.
//!
//! Layout: `[conv3x3 + ReLU] x convs_per_block -> maxpool2x2` per block,
//! then flatten, dropout (training only) and a `tanh` dense projection.

use crate::backend::{images_to_tensor, tensor_to_array2};
use burn::module::{Ignored, Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::{relu, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{s, Array2, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_INPUT_SIZE: usize = 60;
pub const DEFAULT_CHANNELS: [usize; 3] = [16, 32, 64];
pub const DEFAULT_CONVS_PER_BLOCK: usize = 2;
pub const DEFAULT_KERNEL_SIZE: usize = 3;
pub const DEFAULT_EMBEDDING_DIM: usize = 50;
pub const DEFAULT_DROPOUT: f32 = 0.2;

#[derive(Error, Debug, PartialEq)]
pub enum NetworkError {
    #[error("network needs at least one convolution block")]
    NoBlocks,
    #[error("{0} must be positive")]
    Zero(&'static str),
    #[error("kernel size {0} must be odd for same padding")]
    EvenKernel(usize),
    #[error("input side {input} collapses to zero after {blocks} pooling steps")]
    InputTooSmall { input: usize, blocks: usize },
    #[error("dropout rate {0} outside [0, 1)")]
    InvalidDropout(f32),
    #[error("expected input C x H x W = {expected:?}, got {got:?}")]
    InputShape {
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },
    #[error("left and right batches differ: {left:?} vs {right:?}")]
    PairShape {
        left: (usize, usize, usize, usize),
        right: (usize, usize, usize, usize),
    },
    #[error("weights do not match configuration: {0}")]
    Inconsistent(String),
    #[error("tensor conversion failed: {0}")]
    Tensor(String),
}

/// Architecture hyper-parameters. Stored with every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Side of the square input crop.
    pub input_size: usize,
    pub in_channels: usize,
    /// Output channels of each block.
    pub channels: Vec<usize>,
    pub convs_per_block: usize,
    pub kernel_size: usize,
    pub embedding_dim: usize,
    pub dropout: f32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            in_channels: 3,
            channels: DEFAULT_CHANNELS.to_vec(),
            convs_per_block: DEFAULT_CONVS_PER_BLOCK,
            kernel_size: DEFAULT_KERNEL_SIZE,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            dropout: DEFAULT_DROPOUT,
        }
    }
}

impl NetworkConfig {
    /// Spatial side after all pooling steps (each one floors).
    pub fn feature_side(&self) -> usize {
        self.channels
            .iter()
            .fold(self.input_size, |side, _| side / 2)
    }

    /// Length of the flattened feature map fed to the projection.
    pub fn flat_dim(&self) -> usize {
        let side = self.feature_side();
        self.channels.last().copied().unwrap_or(0) * side * side
    }

    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.channels.is_empty() {
            return Err(NetworkError::NoBlocks);
        }
        for (value, name) in [
            (self.input_size, "input_size"),
            (self.in_channels, "in_channels"),
            (self.convs_per_block, "convs_per_block"),
            (self.kernel_size, "kernel_size"),
            (self.embedding_dim, "embedding_dim"),
        ] {
            if value == 0 {
                return Err(NetworkError::Zero(name));
            }
        }
        if self.channels.contains(&0) {
            return Err(NetworkError::Zero("channels"));
        }
        if self.kernel_size % 2 == 0 {
            return Err(NetworkError::EvenKernel(self.kernel_size));
        }
        if self.feature_side() == 0 {
            return Err(NetworkError::InputTooSmall {
                input: self.input_size,
                blocks: self.channels.len(),
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(NetworkError::InvalidDropout(self.dropout));
        }
        Ok(())
    }
}

/// Glorot-uniform weights; biases are zeroed separately.
pub(crate) fn glorot() -> Initializer {
    Initializer::XavierUniform { gain: 1.0 }
}

pub(crate) fn zeroed<B: Backend>(bias: Option<Param<Tensor<B, 1>>>) -> Option<Param<Tensor<B, 1>>> {
    bias.map(|b| Param::from_tensor(b.val().zeros_like()))
}

pub(crate) fn linear<B: Backend>(inputs: usize, outputs: usize, device: &B::Device) -> Linear<B> {
    let mut layer = LinearConfig::new(inputs, outputs)
        .with_initializer(glorot())
        .init(device);
    layer.bias = zeroed(layer.bias);
    layer
}

impl NetworkConfig {
    /// Build a freshly initialised network on `device`. Draws from the
    /// backend RNG, see [`crate::backend::seed`].
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EmbeddingNet<B>, NetworkError> {
        self.validate()?;

        let mut blocks = Vec::with_capacity(self.channels.len());
        let mut in_channels = self.in_channels;
        for &out_channels in &self.channels {
            let mut convs = Vec::with_capacity(self.convs_per_block);
            for _ in 0..self.convs_per_block {
                let mut conv = Conv2dConfig::new([in_channels, out_channels], [self.kernel_size; 2])
                    .with_padding(PaddingConfig2d::Same)
                    .with_initializer(glorot())
                    .init(device);
                conv.bias = zeroed(conv.bias);
                convs.push(conv);
                in_channels = out_channels;
            }
            let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
            blocks.push(ConvBlock { convs, pool });
        }

        tracing::debug!(
            blocks = blocks.len(),
            flat_dim = self.flat_dim(),
            embedding_dim = self.embedding_dim,
            "built embedding network"
        );

        Ok(EmbeddingNet {
            config: Ignored(self.clone()),
            blocks,
            dropout: DropoutConfig::new(f64::from(self.dropout)).init(),
            projection: linear(self.flat_dim(), self.embedding_dim, device),
        })
    }
}

/// `convs_per_block` same-padded convolutions with ReLU, then 2x2 pooling.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.convs.iter().fold(input, |x, conv| relu(conv.forward(x)));
        self.pool.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct EmbeddingNet<B: Backend> {
    config: Ignored<NetworkConfig>,
    blocks: Vec<ConvBlock<B>>,
    dropout: Dropout,
    projection: Linear<B>,
}

impl<B: Backend> EmbeddingNet<B> {
    pub fn config(&self) -> &NetworkConfig {
        &self.config.0
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.0.embedding_dim
    }

    pub fn device(&self) -> B::Device {
        self.projection.weight.val().device()
    }

    /// `N x C x H x W` images to `N x embedding_dim`. Dropout is active only
    /// on autodiff backends.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.blocks.iter().fold(images, |x, block| block.forward(x));
        let flat = self.dropout.forward(features.flatten::<2>(1, 3));
        tanh(self.projection.forward(flat))
    }

    pub fn check_input(&self, dim: (usize, usize, usize, usize)) -> Result<(), NetworkError> {
        let (_, c, h, w) = dim;
        let side = self.config.0.input_size;
        let expected = (self.config.0.in_channels, side, side);
        if (c, h, w) != expected {
            return Err(NetworkError::InputShape {
                expected,
                got: (c, h, w),
            });
        }
        Ok(())
    }

    /// Embed an array batch.
    pub fn embed(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, NetworkError> {
        self.check_input(images.dim())?;
        let input = images_to_tensor::<B>(images, &self.device());
        tensor_to_array2(self.forward(input))
    }

    /// Embed a large tensor in chunks of `batch_size`.
    pub fn embed_all(&self, images: ArrayView4<'_, f32>, batch_size: usize) -> Result<Array2<f32>, NetworkError> {
        let n = images.len_of(Axis(0));
        let mut out = Array2::zeros((n, self.embedding_dim()));
        let step = batch_size.max(1);
        for (i, chunk) in images.axis_chunks_iter(Axis(0), step).enumerate() {
            let low = i * step;
            let high = low + chunk.len_of(Axis(0));
            out.slice_mut(s![low..high, ..]).assign(&self.embed(chunk)?);
        }
        Ok(out)
    }

    /// Check that loaded weights agree with the stored configuration.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let config = &self.config.0;
        config.validate()?;
        if self.blocks.len() != config.channels.len() {
            return Err(NetworkError::Inconsistent(format!(
                "{} blocks for {} channel entries",
                self.blocks.len(),
                config.channels.len()
            )));
        }

        let k = config.kernel_size;
        let mut in_channels = config.in_channels;
        for (i, (block, &out)) in self.blocks.iter().zip(&config.channels).enumerate() {
            if block.convs.len() != config.convs_per_block {
                return Err(NetworkError::Inconsistent(format!(
                    "block {i} has {} convolutions",
                    block.convs.len()
                )));
            }
            for conv in &block.convs {
                let dims = conv.weight.val().dims();
                if dims != [out, in_channels, k, k] {
                    return Err(NetworkError::Inconsistent(format!(
                        "block {i} convolution weight is {dims:?}, expected {:?}",
                        [out, in_channels, k, k]
                    )));
                }
                in_channels = out;
            }
        }

        let dims = self.projection.weight.val().dims();
        if dims != [config.flat_dim(), config.embedding_dim] {
            return Err(NetworkError::Inconsistent(format!(
                "projection weight is {dims:?}, expected {:?}",
                [config.flat_dim(), config.embedding_dim]
            )));
        }
        Ok(())
    }
}
