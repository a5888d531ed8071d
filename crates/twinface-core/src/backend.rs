//! Tensor backends and conversions between `ndarray` arrays and burn tensors.

use crate::network::NetworkError;
use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use ndarray::{Array1, Array2, ArrayView4};

/// CPU backend used for inference, validation and checkpoint loading.
pub type InferenceBackend = NdArray<f32>;
/// [`InferenceBackend`] with gradient tracking, used by `fit`.
pub type TrainBackend = Autodiff<InferenceBackend>;
pub type Device = <InferenceBackend as Backend>::Device;

pub fn device() -> Device {
    Device::default()
}

/// Seed the backend RNG that drives weight initialisation and dropout.
pub fn seed(seed: u64) {
    TrainBackend::seed(seed);
}

/// Copy an `N x C x H x W` view onto `device`.
pub fn images_to_tensor<B: Backend>(images: ArrayView4<'_, f32>, device: &B::Device) -> Tensor<B, 4> {
    let (n, c, h, w) = images.dim();
    let values: Vec<f32> = images.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, [n, c, h, w]), device)
}

/// 0/1 labels as an integer tensor.
pub fn labels_to_tensor<B: Backend>(labels: &Array1<f32>, device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = labels.iter().map(|&y| i64::from(y > 0.5)).collect();
    Tensor::from_data(TensorData::new(values, [labels.len()]), device)
}

pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, NetworkError> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| NetworkError::Tensor(format!("{e:?}")))
}

pub fn tensor_to_array2<B: Backend>(tensor: Tensor<B, 2>) -> Result<Array2<f32>, NetworkError> {
    let [rows, cols] = tensor.dims();
    let values = tensor_to_vec(tensor)?;
    Array2::from_shape_vec((rows, cols), values).map_err(|e| NetworkError::Tensor(e.to_string()))
}
