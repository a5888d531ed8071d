//! Embedding backends behind one trait: the trained Siamese branch or a
//! pretrained ONNX model.

use crate::network::{EmbeddingNet, NetworkError};
use crate::retrieval::EmbeddingTable;
use crate::types::Embedding;
use burn::tensor::backend::Backend;
use ndarray::{concatenate, Array2, ArrayView3, ArrayView4, Axis};
use std::path::PathBuf;
use thiserror::Error;
use twinface_data::ImageStore;

pub const DEFAULT_EMBED_BATCH: usize = 32;
pub const SIAMESE_MODEL_VERSION: &str = "twinface-siamese";

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a batch of cached `N x 3 x S x S` crops to an `N x D` matrix.
pub trait Embedder {
    fn model_version(&self) -> String;

    fn embed_batch(&mut self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, EmbedError>;
}

/// Embeds with the trained branch. Use an inference backend so dropout stays off.
impl<B: Backend> Embedder for EmbeddingNet<B> {
    fn model_version(&self) -> String {
        SIAMESE_MODEL_VERSION.to_string()
    }

    fn embed_batch(&mut self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, EmbedError> {
        Ok(self.embed(images)?)
    }
}

/// Embed every cached image and build a normalised retrieval table.
pub fn embed_store<E: Embedder + ?Sized>(
    embedder: &mut E,
    store: &ImageStore,
    batch_size: usize,
) -> Result<EmbeddingTable, EmbedError> {
    let pixels = store.pixels();
    let total = store.len();
    let mut chunks = Vec::new();

    for chunk in pixels.axis_chunks_iter(Axis(0), batch_size.max(1)) {
        chunks.push(embedder.embed_batch(chunk)?);
        tracing::debug!(
            embedded = chunks.iter().map(|c| c.nrows()).sum::<usize>(),
            total,
            "embedding images"
        );
    }

    let vectors = if chunks.is_empty() {
        Array2::zeros((0, 0))
    } else {
        let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| EmbedError::InferenceFailed(format!("stacking embeddings: {e}")))?
    };

    tracing::info!(
        images = vectors.nrows(),
        dim = vectors.ncols(),
        model = %embedder.model_version(),
        "embedded image store"
    );
    Ok(EmbeddingTable::new(vectors, Some(embedder.model_version())))
}

/// Embed a single `3 x S x S` image.
pub fn embed_one<E: Embedder + ?Sized>(embedder: &mut E, image: ArrayView3<'_, f32>) -> Result<Embedding, EmbedError> {
    let batch = image.insert_axis(Axis(0));
    let out = embedder.embed_batch(batch)?;
    if out.nrows() != 1 {
        return Err(EmbedError::InferenceFailed(format!(
            "expected one embedding, got {}",
            out.nrows()
        )));
    }
    Ok(Embedding::new(out.row(0), Some(embedder.model_version())))
}
