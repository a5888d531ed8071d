//! Pretrained ArcFace-style embedder via ONNX Runtime.
//!
//! Each cached crop is upsampled to the model's 112x112 input, rescaled to
//! the 0-255 range and normalised with mean/std 127.5. The model output is
//! L2-normalised.

use crate::embedder::{EmbedError, Embedder};
use image::imageops::{self, FilterType};
use image::{Rgb, Rgb32FImage};
use ndarray::{Array2, Array4, ArrayView3, ArrayView4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ONNX_INPUT_SIZE: u32 = 112;
const ONNX_MEAN: f32 = 127.5;
const ONNX_STD: f32 = 127.5;

pub struct OnnxEmbedder {
    session: Session,
    model_version: String,
}

impl OnnxEmbedder {
    /// Load an ONNX face-recognition model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, EmbedError> {
        if !model_path.exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX embedder"
        );

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        Ok(Self { session, model_version })
    }

    /// `3 x S x S` crop in `[0, 1]` -> `1 x 3 x 112 x 112` model input.
    fn preprocess(image: ArrayView3<'_, f32>) -> Array4<f32> {
        let (_, h, w) = image.dim();
        let crop = Rgb32FImage::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Rgb([image[[0, y, x]], image[[1, y, x]], image[[2, y, x]]])
        });
        let resized = imageops::resize(&crop, ONNX_INPUT_SIZE, ONNX_INPUT_SIZE, FilterType::Triangle);

        let size = ONNX_INPUT_SIZE as usize;
        Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            let value = resized.get_pixel(x as u32, y as u32).0[c] * 255.0;
            (value - ONNX_MEAN) / ONNX_STD
        })
    }

    fn run(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, EmbedError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;
        Ok(raw.to_vec())
    }
}

fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
}

impl Embedder for OnnxEmbedder {
    fn model_version(&self) -> String {
        self.model_version.clone()
    }

    /// Runs one image per call, so fixed-batch models work too.
    fn embed_batch(&mut self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, EmbedError> {
        let n = images.len_of(Axis(0));
        let mut rows = Vec::new();
        let mut dim = None;

        for image in images.axis_iter(Axis(0)) {
            let mut raw = self.run(&Self::preprocess(image))?;
            match dim {
                None => dim = Some(raw.len()),
                Some(d) if d != raw.len() => {
                    return Err(EmbedError::InferenceFailed(format!(
                        "embedding size changed from {d} to {}",
                        raw.len()
                    )));
                }
                Some(_) => {}
            }
            l2_normalize(&mut raw);
            rows.extend(raw);
        }

        Array2::from_shape_vec((n, dim.unwrap_or(0)), rows)
            .map_err(|e| EmbedError::InferenceFailed(format!("reshaping embeddings: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load(Path::new("/nonexistent/w600k_r50.onnx")).err().unwrap();
        assert!(matches!(err, EmbedError::ModelNotFound(_)));
    }

    #[test]
    fn test_preprocess_output_shape() {
        let crop = Array3::<f32>::zeros((3, 60, 60));
        let tensor = OnnxEmbedder::preprocess(crop.view());
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization() {
        // Uniform 0.5 maps to 127.5, which normalises to 0.
        let crop = Array3::<f32>::from_elem((3, 8, 8), 0.5);
        let tensor = OnnxEmbedder::preprocess(crop.view());
        assert!(tensor.iter().all(|v| v.abs() < 1e-4));

        let white = Array3::<f32>::ones((3, 8, 8));
        let tensor = OnnxEmbedder::preprocess(white.view());
        assert!(tensor.iter().all(|v| (v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_preprocess_keeps_channels_apart() {
        let crop = Array3::from_shape_fn((3, 6, 6), |(c, _, _)| c as f32 / 2.0);
        let tensor = OnnxEmbedder::preprocess(crop.view());
        assert!((tensor[[0, 0, 50, 50]] + 1.0).abs() < 1e-4);
        assert!(tensor[[0, 1, 50, 50]].abs() < 1e-4);
        assert!((tensor[[0, 2, 50, 50]] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
