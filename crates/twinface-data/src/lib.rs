//! twinface-data: LFW data pipeline.
//!
//! Downloads and indexes the dataset, samples positive/negative pairs,
//! decodes every image once into an in-memory cache, and serves augmented
//! pair batches for training.

pub mod augment;
pub mod batches;
pub mod dataset;
pub mod fetch;
pub mod images;
pub mod pairs;

pub use augment::Augmentation;
pub use batches::{BatchError, PairBatch, PairBatches};
pub use dataset::{DatasetError, DatasetIndex, DatasetStats, IdentityId, ImageId};
pub use fetch::{ensure_dataset, FetchError};
pub use images::{ImageConfig, ImageLoadError, ImageStore};
pub use pairs::{PairConfig, PairError, PairSet};
