//! twinface-core: Siamese face verification engine.
//!
//! A small convolutional network, trained with burn on LFW pairs, embeds
//! face crops; a sigmoid head over the absolute embedding difference scores
//! whether two crops show the same person. Embeddings, from the trained
//! network or from a pretrained ONNX model, feed cosine-similarity retrieval.

pub mod backend;
pub mod checkpoint;
pub mod embedder;
pub mod model;
pub mod network;
pub mod onnx;
pub mod retrieval;
pub mod train;
pub mod types;

pub use backend::{InferenceBackend, TrainBackend};
pub use checkpoint::{Checkpoint, CheckpointError};
pub use embedder::{embed_one, embed_store, EmbedError, Embedder};
pub use model::{SiameseModel, StepStats};
pub use network::{EmbeddingNet, NetworkConfig, NetworkError};
pub use onnx::OnnxEmbedder;
pub use retrieval::{EmbeddingTable, RetrievalError};
pub use train::{fit, train_step, EarlyStopping, TrainConfig, TrainError, TrainReport};
pub use types::{Embedding, MatchResult, Neighbor};
