mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use ndarray::{Array1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use twinface_core::embedder::DEFAULT_EMBED_BATCH;
use twinface_core::model::DECISION_THRESHOLD;
use twinface_core::backend::{self, device};
use twinface_core::{
    embed_one, embed_store, fit, Checkpoint, Embedder, InferenceBackend, Neighbor, OnnxEmbedder, SiameseModel,
    TrainBackend,
};
use twinface_data::fetch::ensure_dataset;
use twinface_data::images::load_image;
use twinface_data::pairs::train_test_pairs;
use twinface_data::{DatasetIndex, ImageConfig, ImageStore};

#[derive(Parser)]
#[command(name = "twinface", about = "Siamese face verification on LFW")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and extract the dataset if it is missing
    Fetch,
    /// Print dataset and pair statistics
    Stats,
    /// Train the Siamese network and keep the best checkpoint
    Train {
        /// Override the configured number of epochs
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Rank dataset images by similarity to a query image
    Query {
        /// Query by dataset image id
        #[arg(long, conflicts_with = "image", required_unless_present = "image")]
        id: Option<usize>,
        /// Query by an image file
        #[arg(long)]
        image: Option<PathBuf>,
        /// Number of results
        #[arg(short, long)]
        top: Option<usize>,
        /// Embed with a pretrained ONNX model instead of the checkpoint
        #[arg(long)]
        onnx: Option<PathBuf>,
    },
    /// Compare two image files with the trained checkpoint
    Verify { a: PathBuf, b: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch => {
            let root = fetch(&config)?;
            println!("dataset ready at {}", root.display());
        }
        Commands::Stats => stats(&config)?,
        Commands::Train { epochs } => {
            let mut config = config;
            if let Some(epochs) = epochs {
                config.train.epochs = epochs;
            }
            train(&config)?;
        }
        Commands::Query { id, image, top, onnx } => {
            query(&config, id, image.as_deref(), top.unwrap_or(config.top_n), onnx.as_deref())?;
        }
        Commands::Verify { a, b } => verify(&config, &a, &b)?,
    }

    Ok(())
}

fn fetch(config: &Config) -> Result<PathBuf> {
    ensure_dataset(&config.data_dir, &config.dataset_url, &config.dataset_dir)
        .with_context(|| format!("fetching dataset into {}", config.data_dir.display()))
}

fn load_index(config: &Config) -> Result<DatasetIndex> {
    let root = fetch(config)?;
    DatasetIndex::scan(&root, config.subset).with_context(|| format!("indexing {}", root.display()))
}

fn stats(config: &Config) -> Result<()> {
    let index = load_index(config)?;
    let stats = index.stats();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (train, test) = train_test_pairs(&index, &config.pairs, &mut rng)?;

    println!("identities:              {}", stats.identities);
    println!("images:                  {}", stats.images);
    println!("identities with pairs:   {}", stats.identities_with_pairs);
    println!(
        "train pairs:             {} ({} positive, {} negative)",
        train.len(),
        train.positives(),
        train.len() - train.positives()
    );
    println!(
        "test pairs:              {} ({} positive, {} negative)",
        test.len(),
        test.positives(),
        test.len() - test.positives()
    );
    Ok(())
}

fn train(config: &Config) -> Result<()> {
    if config.image.crop as usize != config.network.input_size {
        bail!(
            "image crop {} does not match network input size {}",
            config.image.crop,
            config.network.input_size
        );
    }

    let index = load_index(config)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (train_pairs, test_pairs) = train_test_pairs(&index, &config.pairs, &mut rng)?;
    let store = ImageStore::load(&index, &config.image).context("loading images")?;
    backend::seed(config.seed);
    let model = SiameseModel::<TrainBackend>::new(config.network.clone(), &device())?;

    let (_, report) = fit(
        model,
        &train_pairs,
        &test_pairs,
        &store,
        &config.train,
        Some(config.checkpoint.as_path()),
        &mut rng,
    )?;

    println!("epoch  loss    acc     val_loss  val_acc");
    for epoch in &report.history {
        let (val_loss, val_acc) = epoch
            .validation
            .map_or(("-".to_string(), "-".to_string()), |v| {
                (format!("{:.4}", v.loss), format!("{:.4}", v.accuracy))
            });
        println!(
            "{:>5}  {:.4}  {:.4}  {:>8}  {:>7}",
            epoch.epoch, epoch.train.loss, epoch.train.accuracy, val_loss, val_acc
        );
    }
    println!(
        "best epoch {} (val accuracy {:.4}){}, checkpoint: {}",
        report.best_epoch,
        report.best_accuracy,
        if report.stopped_early { ", stopped early" } else { "" },
        config.checkpoint.display()
    );
    Ok(())
}

fn load_checkpoint(config: &Config) -> Result<(Checkpoint, SiameseModel<InferenceBackend>)> {
    Checkpoint::load(&config.checkpoint, &device())
        .with_context(|| format!("loading checkpoint {} (run `twinface train` first)", config.checkpoint.display()))
}

fn query(config: &Config, id: Option<usize>, image: Option<&Path>, top: usize, onnx: Option<&Path>) -> Result<()> {
    // The checkpoint fixes the preprocessing its network was trained with.
    let (mut embedder, image_config): (Box<dyn Embedder>, ImageConfig) = match onnx {
        Some(path) => (Box::new(OnnxEmbedder::load(path)?) as Box<dyn Embedder>, config.image),
        None => {
            let (checkpoint, model) = load_checkpoint(config)?;
            (Box::new(model.network().clone()) as Box<dyn Embedder>, checkpoint.image)
        }
    };

    let index = load_index(config)?;
    let store = ImageStore::load(&index, &image_config).context("loading images")?;
    let table = embed_store(embedder.as_mut(), &store, DEFAULT_EMBED_BATCH)?;

    let (query, exclude) = match (id, image) {
        (Some(id), _) => {
            let name = index
                .name_of(id)
                .with_context(|| format!("image id {id} is not in the dataset"))?;
            println!("query: image {id} ({name})");
            (table.vectors().row(id).to_owned(), vec![id])
        }
        (None, Some(path)) => {
            println!("query: {}", path.display());
            let crop = load_image(path, &image_config)?;
            let embedding = embed_one(embedder.as_mut(), crop.view())?;
            (Array1::from(embedding.values), Vec::new())
        }
        (None, None) => bail!("either --id or --image is required"),
    };

    let hits = table.most_similar(query.view(), top)?;
    print_neighbors(&index, &hits);

    let best = table.best_match(query.view(), &index, &exclude, config.match_threshold)?;
    match best.identity {
        Some(name) if best.matched => println!("best match: {name} ({:.4})", best.similarity),
        _ => println!(
            "no match above {:.2} (best similarity {:.4})",
            config.match_threshold, best.similarity
        ),
    }
    Ok(())
}

fn print_neighbors(index: &DatasetIndex, hits: &[Neighbor]) {
    println!("rank  id      similarity  identity");
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{:>4}  {:<6}  {:>10.4}  {}",
            rank + 1,
            hit.image_id,
            hit.similarity,
            index.name_of(hit.image_id).unwrap_or("?")
        );
    }
}

fn verify(config: &Config, a: &Path, b: &Path) -> Result<()> {
    let (checkpoint, model) = load_checkpoint(config)?;
    let left = load_image(a, &checkpoint.image).with_context(|| format!("loading {}", a.display()))?;
    let right = load_image(b, &checkpoint.image).with_context(|| format!("loading {}", b.display()))?;

    let probability = model.predict(left.view().insert_axis(Axis(0)), right.view().insert_axis(Axis(0)))?[0];

    let mut net = model.network().clone();
    let ea = embed_one(&mut net, left.view())?;
    let eb = embed_one(&mut net, right.view())?;

    println!("similarity probability: {probability:.4}");
    println!("verdict:                {}", if probability > DECISION_THRESHOLD { "same person" } else { "different people" });
    println!("embedding cosine:       {:.4}", ea.similarity(&eb));
    println!("embedding distance:     {:.4}", ea.euclidean_distance(&eb));
    Ok(())
}
