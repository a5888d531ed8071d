//! Best-model checkpoint: a JSON metadata file (architecture, preprocessing,
//! epoch, accuracy) next to a burn record holding the weights.

use crate::model::SiameseModel;
use crate::network::{NetworkConfig, NetworkError};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use twinface_data::ImageConfig;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 2;
pub const DEFAULT_CHECKPOINT_PATH: &str = "siamese_checkpoint.json";
/// Weights live at the checkpoint path with this extension.
pub const WEIGHTS_EXTENSION: &str = "mpk";

type WeightsRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed checkpoint {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("weights record {path}: {message}")]
    Record { path: PathBuf, message: String },
    #[error("checkpoint format version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("checkpoint crop {crop} does not match network input {input}")]
    InputMismatch { crop: u32, input: usize },
    #[error(transparent)]
    Network(#[from] NetworkError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// 1-based epoch that produced these weights.
    pub epoch: usize,
    pub val_accuracy: f32,
    /// Preprocessing the model was trained with.
    pub image: ImageConfig,
    pub network: NetworkConfig,
}

/// Write `bytes` to `<path>.part`, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".part");
    let temp_path = PathBuf::from(temp_name);

    fs::write(&temp_path, bytes).map_err(|source| CheckpointError::Write {
        path: temp_path.clone(),
        source,
    })?;
    fs::rename(&temp_path, path).map_err(|source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    })
}

impl Checkpoint {
    pub fn new(network: NetworkConfig, epoch: usize, val_accuracy: f32, image: ImageConfig) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            created_at: Utc::now(),
            epoch,
            val_accuracy,
            image,
            network,
        }
    }

    pub fn weights_path(path: &Path) -> PathBuf {
        path.with_extension(WEIGHTS_EXTENSION)
    }

    /// Write the weights, then the metadata, each atomically. A reader never
    /// sees metadata without the weights it describes.
    pub fn save<B: Backend>(&self, path: &Path, model: &SiameseModel<B>) -> Result<(), CheckpointError> {
        let weights_path = Self::weights_path(path);
        let recorder = WeightsRecorder::default();
        let weights = <WeightsRecorder as Recorder<B>>::record(&recorder, model.clone().into_record(), ())
            .map_err(|e| CheckpointError::Record {
                path: weights_path.clone(),
                message: format!("{e:?}"),
            })?;
        let json = serde_json::to_vec_pretty(self).map_err(|source| CheckpointError::Format {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_atomic(&weights_path, &weights)?;
        write_atomic(path, &json)?;

        tracing::info!(
            path = %path.display(),
            epoch = self.epoch,
            val_accuracy = self.val_accuracy,
            weight_bytes = weights.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Read the metadata, rebuild the network it describes on `device` and
    /// load the recorded weights into it.
    pub fn load<B: Backend>(path: &Path, device: &B::Device) -> Result<(Self, SiameseModel<B>), CheckpointError> {
        let bytes = fs::read(path).map_err(|source| CheckpointError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Format {
            path: path.to_path_buf(),
            source,
        })?;

        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.format_version,
                expected: CHECKPOINT_FORMAT_VERSION,
            });
        }
        let input = checkpoint.network.input_size;
        if checkpoint.image.crop as usize != input {
            return Err(CheckpointError::InputMismatch {
                crop: checkpoint.image.crop,
                input,
            });
        }

        let weights_path = Self::weights_path(path);
        let weights = fs::read(&weights_path).map_err(|source| CheckpointError::Read {
            path: weights_path.clone(),
            source,
        })?;
        let recorder = WeightsRecorder::default();
        let record = <WeightsRecorder as Recorder<B>>::load(&recorder, weights, device).map_err(|e| {
            CheckpointError::Record {
                path: weights_path.clone(),
                message: format!("{e:?}"),
            }
        })?;
        let model = SiameseModel::<B>::new(checkpoint.network.clone(), device)?.load_record(record);
        model.validate()?;

        tracing::info!(
            path = %path.display(),
            epoch = checkpoint.epoch,
            val_accuracy = checkpoint.val_accuracy,
            created_at = %checkpoint.created_at,
            "checkpoint loaded"
        );
        Ok((checkpoint, model))
    }
}
