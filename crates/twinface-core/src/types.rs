use crate::retrieval::normalize;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use twinface_data::ImageId;

/// Embedding vector for one image (50-dimensional for the default network,
/// 512 for ArcFace models).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g. "twinface-siamese").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: ArrayView1<'_, f32>, model_version: Option<String>) -> Self {
        Self {
            values: values.to_vec(),
            model_version,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    fn view(&self) -> ArrayView1<'_, f32> {
        ArrayView1::from(&self.values)
    }

    /// Cosine similarity in [-1, 1]: the dot product of the unit vectors,
    /// the same score [`crate::EmbeddingTable`] ranks by. Zero vectors and
    /// mismatched dimensions score 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.dim() != other.dim() {
            return 0.0;
        }
        normalize(self.view()).dot(&normalize(other.view()))
    }

    /// NaN for mismatched dimensions.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.dim() != other.dim() {
            return f32::NAN;
        }
        let delta = &self.view() - &other.view();
        delta.dot(&delta).sqrt()
    }

    /// Unit-length copy. A zero vector stays zero.
    pub fn normalized(&self) -> Embedding {
        Embedding {
            values: normalize(self.view()).to_vec(),
            model_version: self.model_version.clone(),
        }
    }
}

/// A ranked retrieval hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    pub image_id: ImageId,
    pub similarity: f32,
}

/// Result of matching a query embedding against the indexed gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best hit, 0 for an empty gallery.
    pub similarity: f32,
    pub image_id: Option<ImageId>,
    /// Identity name of the best hit, set only when `matched`.
    pub identity: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn emb(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
            model_version: None,
        }
    }

    #[rstest]
    #[case(&[1.0, 0.0, 0.0], &[2.0, 0.0, 0.0], 1.0)]
    #[case(&[1.0, 0.0], &[0.0, 1.0], 0.0)]
    #[case(&[1.0, 0.0], &[-1.0, 0.0], -1.0)]
    #[case(&[0.0, 0.0], &[1.0, 0.0], 0.0)]
    fn test_cosine_similarity(#[case] a: &[f32], #[case] b: &[f32], #[case] expected: f32) {
        assert!((emb(a).similarity(&emb(b)) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_matches_table_score() {
        let a = emb(&[0.3, -1.2, 2.0]);
        let b = emb(&[1.5, 0.4, -0.7]);
        let table = crate::EmbeddingTable::new(
            ndarray::Array2::from_shape_vec((2, 3), [a.values.clone(), b.values.clone()].concat()).unwrap(),
            None,
        );
        assert!((table.similarity(0, 1).unwrap() - a.similarity(&b)).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance() {
        assert!((emb(&[0.0, 0.0]).euclidean_distance(&emb(&[3.0, 4.0])) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_dimensions() {
        let (a, b) = (emb(&[1.0, 0.0]), emb(&[1.0, 0.0, 0.0]));
        assert_eq!(a.similarity(&b), 0.0);
        assert!(a.euclidean_distance(&b).is_nan());
    }

    #[test]
    fn test_normalized() {
        let n = emb(&[3.0, 4.0]).normalized();
        assert!((n.values[0] - 0.6).abs() < 1e-6);
        assert!((n.values[1] - 0.8).abs() < 1e-6);
        assert_eq!(emb(&[0.0, 0.0]).normalized().values, vec![0.0, 0.0]);
    }
}
