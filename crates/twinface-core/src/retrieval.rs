//! Nearest-neighbour retrieval over L2-normalised embeddings.
//!
//! Similarity is the dot product of unit vectors (cosine similarity).
//! Rankings are by descending similarity, ties broken by ascending image id.

use crate::types::{Embedding, MatchResult, Neighbor};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;
use twinface_data::{DatasetIndex, ImageId};

#[derive(Error, Debug, PartialEq)]
pub enum RetrievalError {
    #[error("query has {got} dimensions, table has {expected}")]
    Dimension { expected: usize, got: usize },
    #[error("unknown image id {0}")]
    UnknownImage(ImageId),
}

/// Scale every row to unit length. Zero rows stay zero.
pub fn normalize_rows(mut vectors: Array2<f32>) -> Array2<f32> {
    for mut row in vectors.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
    vectors
}

pub(crate) fn normalize(vector: ArrayView1<'_, f32>) -> Array1<f32> {
    let norm = vector.dot(&vector).sqrt();
    if norm > 0.0 {
        vector.mapv(|v| v / norm)
    } else {
        vector.to_owned()
    }
}

/// Row `i` is the unit embedding of image id `i`.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    vectors: Array2<f32>,
    model_version: Option<String>,
}

impl EmbeddingTable {
    pub fn new(vectors: Array2<f32>, model_version: Option<String>) -> Self {
        Self {
            vectors: normalize_rows(vectors),
            model_version,
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn vectors(&self) -> ArrayView2<'_, f32> {
        self.vectors.view()
    }

    pub fn embedding(&self, id: ImageId) -> Option<Embedding> {
        (id < self.len()).then(|| Embedding::new(self.vectors.row(id), self.model_version.clone()))
    }

    /// Cosine similarity of two stored images.
    pub fn similarity(&self, a: ImageId, b: ImageId) -> Result<f32, RetrievalError> {
        let row = |id: ImageId| {
            (id < self.len())
                .then(|| self.vectors.row(id))
                .ok_or(RetrievalError::UnknownImage(id))
        };
        Ok(row(a)?.dot(&row(b)?))
    }

    /// Every stored image ranked against `query`, truncated to `top_n`.
    pub fn most_similar(&self, query: ArrayView1<'_, f32>, top_n: usize) -> Result<Vec<Neighbor>, RetrievalError> {
        if query.len() != self.dim() {
            return Err(RetrievalError::Dimension {
                expected: self.dim(),
                got: query.len(),
            });
        }
        let scores = self.vectors.dot(&normalize(query));

        let mut ranked: Vec<Neighbor> = scores
            .iter()
            .enumerate()
            .map(|(image_id, &similarity)| Neighbor { image_id, similarity })
            .collect();
        ranked.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.image_id.cmp(&b.image_id))
        });
        ranked.truncate(top_n);
        Ok(ranked)
    }

    /// Neighbours of a stored image. The image itself ranks first.
    pub fn most_similar_to(&self, id: ImageId, top_n: usize) -> Result<Vec<Neighbor>, RetrievalError> {
        if id >= self.len() {
            return Err(RetrievalError::UnknownImage(id));
        }
        self.most_similar(self.vectors.row(id), top_n)
    }

    /// Best hit for `query` among images not in `exclude`, resolved to its identity.
    pub fn best_match(
        &self,
        query: ArrayView1<'_, f32>,
        index: &DatasetIndex,
        exclude: &[ImageId],
        threshold: f32,
    ) -> Result<MatchResult, RetrievalError> {
        let best = self
            .most_similar(query, self.len())?
            .into_iter()
            .find(|n| !exclude.contains(&n.image_id));

        Ok(match best {
            Some(hit) if hit.similarity >= threshold => MatchResult {
                matched: true,
                similarity: hit.similarity,
                image_id: Some(hit.image_id),
                identity: index.name_of(hit.image_id).map(str::to_string),
            },
            Some(hit) => MatchResult {
                matched: false,
                similarity: hit.similarity,
                image_id: Some(hit.image_id),
                identity: None,
            },
            None => MatchResult {
                matched: false,
                similarity: 0.0,
                image_id: None,
                identity: None,
            },
        })
    }
}
