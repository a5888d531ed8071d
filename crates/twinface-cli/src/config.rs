use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use twinface_core::checkpoint::DEFAULT_CHECKPOINT_PATH;
use twinface_core::{NetworkConfig, TrainConfig};
use twinface_data::fetch::{default_data_dir, DEFAULT_DATASET_DIR, DEFAULT_DATASET_URL};
use twinface_data::{ImageConfig, PairConfig};

/// Identities kept by default to bound memory and training time.
pub const DEFAULT_SUBSET: usize = 500;

/// CLI configuration: defaults, then an optional TOML file, then
/// `TWINFACE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the dataset archive is downloaded and extracted.
    pub data_dir: PathBuf,
    pub dataset_url: String,
    /// Directory name the archive extracts to.
    pub dataset_dir: String,
    /// Keep only the first N identities (sorted by name). `None` keeps all.
    pub subset: Option<usize>,
    /// Seed for pair sampling, weight init, dropout and augmentation.
    pub seed: u64,
    pub checkpoint: PathBuf,
    pub top_n: usize,
    /// Cosine similarity needed to report an identity match.
    pub match_threshold: f32,
    pub pairs: PairConfig,
    pub image: ImageConfig,
    pub network: NetworkConfig,
    pub train: TrainConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().unwrap_or_else(|_| PathBuf::from("data")),
            dataset_url: DEFAULT_DATASET_URL.to_string(),
            dataset_dir: DEFAULT_DATASET_DIR.to_string(),
            subset: Some(DEFAULT_SUBSET),
            seed: 42,
            checkpoint: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
            top_n: 5,
            match_threshold: 0.5,
            pairs: PairConfig::default(),
            image: ImageConfig::default(),
            network: NetworkConfig::default(),
            train: TrainConfig::default(),
        }
    }
}

impl Config {
    /// Load the TOML file (if any), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Apply `TWINFACE_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("TWINFACE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("TWINFACE_DATASET_URL") {
            self.dataset_url = url;
        }
        if let Some(path) = lookup("TWINFACE_CHECKPOINT") {
            self.checkpoint = PathBuf::from(path);
        }
        // 0 keeps every identity.
        if let Some(subset) = parse::<usize>(&lookup, "TWINFACE_SUBSET") {
            self.subset = (subset > 0).then_some(subset);
        }

        self.seed = env_u64(&lookup, "TWINFACE_SEED", self.seed);
        self.top_n = env_usize(&lookup, "TWINFACE_TOP_N", self.top_n);
        self.match_threshold = env_f32(&lookup, "TWINFACE_MATCH_THRESHOLD", self.match_threshold);
        self.train.epochs = env_usize(&lookup, "TWINFACE_EPOCHS", self.train.epochs);
        self.train.batch_size = env_usize(&lookup, "TWINFACE_BATCH_SIZE", self.train.batch_size);
        self.train.learning_rate = env_f32(&lookup, "TWINFACE_LEARNING_RATE", self.train.learning_rate);
        self.train.patience = env_usize(&lookup, "TWINFACE_PATIENCE", self.train.patience);
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.parse().ok())
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    parse(lookup, key).unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    parse(lookup, key).unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    parse(lookup, key).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.subset, Some(DEFAULT_SUBSET));
        assert_eq!(config.checkpoint, PathBuf::from("siamese_checkpoint.json"));
        assert_eq!(config.image.crop as usize, config.network.input_size);
        assert_eq!(config.pairs.max_positive, 50);
        assert_eq!(config.pairs.max_negative, 20);
        assert_eq!(config.train.batch_size, 32);
    }

    #[test]
    fn test_toml_overlays_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("twinface.toml");
        std::fs::write(
            &path,
            r#"
seed = 7
subset = 50

[train]
epochs = 2

[train.augmentation]
flip_probability = 0.0

[network]
channels = [8, 16]
"#,
        )
        .unwrap();

        let mut config: Config = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        config.apply_overrides(env(&[]));
        assert_eq!(config.seed, 7);
        assert_eq!(config.subset, Some(50));
        assert_eq!(config.train.epochs, 2);
        assert_eq!(config.train.batch_size, 32);
        assert_eq!(config.train.augmentation.flip_probability, 0.0);
        assert_eq!(config.network.channels, vec![8, 16]);
        assert_eq!(config.network.embedding_dim, 50);
        assert_eq!(config.dataset_dir, DEFAULT_DATASET_DIR);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("TWINFACE_SUBSET", "0"),
            ("TWINFACE_EPOCHS", "3"),
            ("TWINFACE_LEARNING_RATE", "0.01"),
            ("TWINFACE_CHECKPOINT", "/tmp/best.json"),
            ("TWINFACE_TOP_N", "not-a-number"),
        ]));
        assert_eq!(config.subset, None);
        assert_eq!(config.train.epochs, 3);
        assert!((config.train.learning_rate - 0.01).abs() < 1e-9);
        assert_eq!(config.checkpoint, PathBuf::from("/tmp/best.json"));
        assert_eq!(config.top_n, 5);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(Config::load(Some(&tmp.path().join("absent.toml"))).is_err());
    }
}
