//! Positive/negative pair sampling and train/test pair sets.

use crate::dataset::{DatasetIndex, IdentityId, ImageId};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MAX_POSITIVE: usize = 50;
pub const DEFAULT_MAX_NEGATIVE: usize = 20;
pub const DEFAULT_TRAIN_SPLIT: f32 = 0.8;

#[derive(Error, Debug, PartialEq)]
pub enum PairError {
    #[error("cannot draw {requested} negative identities from {available} candidates")]
    NotEnoughIdentities { requested: usize, available: usize },
    #[error("identity {0} has no images")]
    NoImages(IdentityId),
    #[error("train split must be in (0, 1), got {0}")]
    InvalidSplit(f32),
}

/// Limits for pair generation.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PairConfig {
    /// Maximum positive pairs per identity.
    pub max_positive: usize,
    /// Negative pairs per identity.
    pub max_negative: usize,
    /// Fraction of identities assigned to the training set.
    pub train_split: f32,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            max_positive: DEFAULT_MAX_POSITIVE,
            max_negative: DEFAULT_MAX_NEGATIVE,
            train_split: DEFAULT_TRAIN_SPLIT,
        }
    }
}

/// Parallel arrays of left ids, right ids and labels (1.0 = same identity).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairSet {
    pub left: Vec<ImageId>,
    pub right: Vec<ImageId>,
    pub labels: Vec<f32>,
}

impl PairSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn push(&mut self, (a, b): (ImageId, ImageId), label: f32) {
        self.left.push(a);
        self.right.push(b);
        self.labels.push(label);
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&l| l > 0.5).count()
    }

    /// Apply one random permutation to all three arrays.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.left = order.iter().map(|&i| self.left[i]).collect();
        self.right = order.iter().map(|&i| self.right[i]).collect();
        self.labels = order.iter().map(|&i| self.labels[i]).collect();
    }
}

/// All unordered pairs of `identity`'s images, shuffled and capped at `max_num`.
///
/// Identities with fewer than two images yield nothing.
pub fn positive_pairs<R: Rng + ?Sized>(
    index: &DatasetIndex,
    identity: IdentityId,
    max_num: usize,
    rng: &mut R,
) -> Vec<(ImageId, ImageId)> {
    let images = index.images_of(identity);
    if images.len() < 2 {
        return Vec::new();
    }

    let mut pairs = Vec::with_capacity(images.len() * (images.len() - 1) / 2);
    for (i, &a) in images.iter().enumerate() {
        for &b in &images[i + 1..] {
            pairs.push((a, b));
        }
    }
    pairs.shuffle(rng);
    pairs.truncate(max_num);
    pairs
}

/// `max_num` pairs of (random image of `identity`, random image of another identity).
///
/// Draws `max_num + 1` distinct identities from `candidates`, drops `identity`
/// if it was drawn, and pairs against the first `max_num` of the rest. The
/// extra draw keeps the count at `max_num` whether or not `identity` came up;
/// if it did not, the last drawn candidate goes unused.
pub fn negative_pairs<R: Rng + ?Sized>(
    index: &DatasetIndex,
    identity: IdentityId,
    candidates: &[IdentityId],
    max_num: usize,
    rng: &mut R,
) -> Result<Vec<(ImageId, ImageId)>, PairError> {
    let source = index.images_of(identity);
    if source.is_empty() {
        return Err(PairError::NoImages(identity));
    }

    let requested = max_num + 1;
    if candidates.len() < requested {
        return Err(PairError::NotEnoughIdentities {
            requested,
            available: candidates.len(),
        });
    }

    let mut drawn: Vec<IdentityId> = candidates.choose_multiple(rng, requested).copied().collect();
    if let Some(pos) = drawn.iter().position(|&c| c == identity) {
        drawn.remove(pos);
    }

    let mut pairs = Vec::with_capacity(max_num);
    for &other in drawn.iter().take(max_num) {
        let others = index.images_of(other);
        let (Some(&a), Some(&b)) = (source.choose(rng), others.choose(rng)) else {
            return Err(PairError::NoImages(other));
        };
        pairs.push((a, b));
    }

    Ok(pairs)
}

/// Positive and negative pairs for every identity in `identities`, which also
/// serve as the negative candidates. The result is shuffled.
pub fn build_pair_set<R: Rng + ?Sized>(
    index: &DatasetIndex,
    identities: &[IdentityId],
    config: &PairConfig,
    rng: &mut R,
) -> Result<PairSet, PairError> {
    let mut set = PairSet::default();

    for &identity in identities {
        for pair in positive_pairs(index, identity, config.max_positive, rng) {
            set.push(pair, 1.0);
        }
        for pair in negative_pairs(index, identity, identities, config.max_negative, rng)? {
            set.push(pair, 0.0);
        }
    }

    set.shuffle(rng);
    Ok(set)
}

/// Split identities at `floor(n * train_split)` and build a pair set for each side.
pub fn train_test_pairs<R: Rng + ?Sized>(
    index: &DatasetIndex,
    config: &PairConfig,
    rng: &mut R,
) -> Result<(PairSet, PairSet), PairError> {
    if !(config.train_split > 0.0 && config.train_split < 1.0) {
        return Err(PairError::InvalidSplit(config.train_split));
    }

    let n = index.num_identities();
    let split = (n as f32 * config.train_split) as usize;
    let train_ids: Vec<IdentityId> = (0..split).collect();
    let test_ids: Vec<IdentityId> = (split..n).collect();

    let train = build_pair_set(index, &train_ids, config, rng)?;
    let test = build_pair_set(index, &test_ids, config, rng)?;

    tracing::info!(
        train_identities = train_ids.len(),
        test_identities = test_ids.len(),
        train_pairs = train.len(),
        train_positives = train.positives(),
        test_pairs = test.len(),
        test_positives = test.positives(),
        "built pair sets"
    );

    Ok((train, test))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;
    use std::path::PathBuf;

    /// Identities named `id0..` with the given image counts.
    fn index_with(counts: &[usize]) -> DatasetIndex {
        DatasetIndex::from_groups(counts.iter().enumerate().map(|(i, &n)| {
            let name = format!("id{i}");
            let paths = (0..n).map(|j| PathBuf::from(format!("{name}/{j}.jpg"))).collect();
            (name, paths)
        }))
    }

    #[test]
    fn test_positive_pairs_same_identity() {
        let index = index_with(&[3, 1, 2]);
        let mut rng = StdRng::seed_from_u64(7);

        let pairs = positive_pairs(&index, 0, 50, &mut rng);
        assert_eq!(pairs.len(), 3);
        for (a, b) in &pairs {
            assert_ne!(a, b);
            assert_eq!(index.identity_of(*a), Some(0));
            assert_eq!(index.identity_of(*b), Some(0));
        }

        let pairs = positive_pairs(&index, 2, 50, &mut rng);
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_positive_pairs_single_image_is_empty() {
        let index = index_with(&[3, 1, 2]);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(positive_pairs(&index, 1, 50, &mut rng).is_empty());
    }

    #[rstest]
    #[case(10, 0, 0)]
    #[case(10, 5, 5)]
    #[case(10, 45, 45)]
    #[case(10, 100, 45)]
    fn test_positive_pairs_capped(#[case] images: usize, #[case] max: usize, #[case] expected: usize) {
        let index = index_with(&[images]);
        let mut rng = StdRng::seed_from_u64(1);
        let pairs = positive_pairs(&index, 0, max, &mut rng);
        assert_eq!(pairs.len(), expected);
    }

    #[test]
    fn test_positive_pairs_unique_unordered() {
        let index = index_with(&[6]);
        let mut rng = StdRng::seed_from_u64(3);
        let mut pairs: Vec<_> = positive_pairs(&index, 0, 100, &mut rng)
            .into_iter()
            .map(|(a, b)| (a.min(b), a.max(b)))
            .collect();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), 15);
    }

    #[test]
    fn test_negative_pairs_three_identities_max_one() {
        let index = index_with(&[3, 1, 2]);
        let candidates = [0, 1, 2];

        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            for identity in 0..3 {
                let pairs = negative_pairs(&index, identity, &candidates, 1, &mut rng).unwrap();
                assert_eq!(pairs.len(), 1);
                let (a, b) = pairs[0];
                assert_eq!(index.identity_of(a), Some(identity));
                assert_ne!(index.identity_of(a), index.identity_of(b));
            }
        }
    }

    #[test]
    fn test_negative_pairs_count_is_exact() {
        let index = index_with(&[2; 30]);
        let candidates: Vec<_> = (0..30).collect();
        let mut rng = StdRng::seed_from_u64(11);
        for identity in 0..30 {
            let pairs = negative_pairs(&index, identity, &candidates, 20, &mut rng).unwrap();
            assert_eq!(pairs.len(), 20);
            for (a, b) in pairs {
                assert_ne!(index.identity_of(a), index.identity_of(b));
            }
        }
    }

    #[test]
    fn test_negative_pairs_too_few_candidates() {
        let index = index_with(&[1, 1]);
        let mut rng = StdRng::seed_from_u64(0);
        let err = negative_pairs(&index, 0, &[0, 1], 2, &mut rng).unwrap_err();
        assert_eq!(
            err,
            PairError::NotEnoughIdentities {
                requested: 3,
                available: 2
            }
        );
    }

    #[test]
    fn test_build_pair_set_end_to_end() {
        let index = index_with(&[3, 1, 2]);
        let config = PairConfig {
            max_positive: 50,
            max_negative: 1,
            train_split: 0.8,
        };
        let mut rng = StdRng::seed_from_u64(5);
        let set = build_pair_set(&index, &[0, 1, 2], &config, &mut rng).unwrap();

        // 3 positives from identity 0, 1 from identity 2, one negative each
        assert_eq!(set.positives(), 4);
        assert_eq!(set.len(), 7);

        let mut positive_owners = Vec::new();
        for i in 0..set.len() {
            let a = index.identity_of(set.left[i]).unwrap();
            let b = index.identity_of(set.right[i]).unwrap();
            if set.labels[i] > 0.5 {
                assert_eq!(a, b);
                positive_owners.push(a);
            } else {
                assert_ne!(a, b);
            }
        }
        positive_owners.sort();
        positive_owners.dedup();
        assert_eq!(positive_owners, vec![0, 2]);
    }

    #[test]
    fn test_train_test_pairs_disjoint_identities() {
        let index = index_with(&[3; 10]);
        let config = PairConfig {
            max_positive: 2,
            max_negative: 1,
            train_split: 0.8,
        };
        let mut rng = StdRng::seed_from_u64(9);
        let (train, test) = train_test_pairs(&index, &config, &mut rng).unwrap();

        let owner = |img| index.identity_of(img).unwrap();
        assert!(train.left.iter().chain(&train.right).all(|&i| owner(i) < 8));
        assert!(test.left.iter().chain(&test.right).all(|&i| owner(i) >= 8));
        assert_eq!(train.len(), 8 * 3);
        assert_eq!(test.len(), 2 * 3);
    }

    #[rstest]
    #[case(0.0)]
    #[case(1.0)]
    #[case(-0.5)]
    fn test_train_test_pairs_rejects_bad_split(#[case] split: f32) {
        let index = index_with(&[2, 2]);
        let config = PairConfig {
            train_split: split,
            ..PairConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            train_test_pairs(&index, &config, &mut rng).unwrap_err(),
            PairError::InvalidSplit(split)
        );
    }

    #[test]
    fn test_shuffle_keeps_rows_aligned() {
        let mut set = PairSet::default();
        for i in 0..20 {
            set.push((i, i + 100), (i % 2) as f32);
        }
        let mut rng = StdRng::seed_from_u64(2);
        set.shuffle(&mut rng);
        for i in 0..set.len() {
            assert_eq!(set.right[i], set.left[i] + 100);
            assert_eq!(set.labels[i], (set.left[i] % 2) as f32);
        }
    }
}
