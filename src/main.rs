//! NICE Flow CLI
//!
//! Train NICE normalizing flows on MNIST-style datasets and sample from
//! saved checkpoints.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nice_flow::data::{ImageDataset, Preprocessor, Split};
use nice_flow::report::{make_grid, GRID_ROW};
use nice_flow::utils::setup_logging;
use nice_flow::{
    run_training, CouplingKind, DatasetKind, Flow, LatentKind, MaskParity, Mode, Nice, TrainConfig,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "nice-flow")]
#[command(about = "NICE normalizing flows for greyscale image datasets")]
struct Cli {
    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and write checkpoints, sample grids and loss curves
    Train(TrainArgs),

    /// Draw samples from a checkpoint into one image grid
    Sample {
        /// Checkpoint written by `train`
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Dataset the checkpoint was trained on; read from the checkpoint
        /// when omitted, and must match it when given
        #[arg(long)]
        dataset: Option<DatasetKind>,

        /// Root directory holding one sub-directory per dataset
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Number of samples
        #[arg(short = 'n', long, default_value = "64")]
        count: usize,

        /// Output PNG
        #[arg(short, long, default_value = "samples.png")]
        output: PathBuf,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Load every setting from a JSON file instead of the flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective configuration to this JSON file
    #[arg(long)]
    save_config: Option<PathBuf>,

    #[arg(long, default_value = "mnist")]
    dataset: DatasetKind,

    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Root of the models/, samples/ and loss/ directories
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    #[arg(long, default_value = "200")]
    batch_size: usize,

    /// Latent prior: normal or logistic
    #[arg(long, default_value = "logistic")]
    latent: LatentKind,

    /// Number of epochs
    #[arg(long, default_value = "50")]
    max_iter: usize,

    /// Images per evaluation sample grid
    #[arg(long, default_value = "64")]
    sample_size: usize,

    #[arg(long, default_value = "1e-3")]
    lr: f64,

    /// First Adam beta
    #[arg(long, default_value = "0.9")]
    momentum: f64,

    /// Second Adam beta
    #[arg(long, default_value = "0.999")]
    decay: f64,

    /// Number of coupling layers
    #[arg(long, default_value = "4")]
    coupling: usize,

    /// Checkpoint cadence in epochs
    #[arg(long, default_value = "10")]
    save_every: f64,

    /// Coupling type: additive or affine
    #[arg(long, default_value = "additive")]
    coup_type: CouplingKind,

    /// Hidden width of the coupling networks
    #[arg(long, default_value = "1000")]
    mid_dim: usize,

    /// Hidden depth of the coupling networks
    #[arg(long, default_value = "5")]
    hidden: usize,

    /// Positions transformed by the first coupling layer: even or odd
    #[arg(long, default_value = "even")]
    mask: MaskParity,

    /// Use bin centres instead of uniform dequantization noise
    #[arg(long)]
    no_dequantize: bool,

    #[arg(long, default_value = "0.0")]
    dropout: f64,

    #[arg(long)]
    seed: Option<u64>,
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainConfig> {
        if let Some(path) = &self.config {
            return TrainConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display()));
        }

        Ok(TrainConfig {
            dataset: self.dataset,
            data_dir: self.data_dir,
            output_dir: self.output_dir,
            batch_size: self.batch_size,
            latent: self.latent,
            max_epochs: self.max_iter,
            sample_size: self.sample_size,
            learning_rate: self.lr,
            beta1: self.momentum,
            beta2: self.decay,
            coupling: self.coupling,
            save_every: self.save_every,
            coupling_kind: self.coup_type,
            mid_dim: self.mid_dim,
            hidden: self.hidden,
            mask: self.mask,
            dequantize: !self.no_dequantize,
            dropout: self.dropout,
            seed: self.seed,
            ..TrainConfig::default()
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Sample {
            checkpoint,
            dataset,
            data_dir,
            count,
            output,
            seed,
        } => sample(&checkpoint, dataset, &data_dir, count, &output, seed),
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let save_config = args.save_config.clone();
    let config = args.into_config()?;
    config.validate()?;

    if let Some(path) = save_config {
        config.save(&path)?;
        info!("Saved configuration to {}", path.display());
    }

    info!("Training NICE on {}", config.dataset);
    let summary = run_training(&config, true)?;

    info!(
        "Done: {} epochs, checkpoints at {:?} in {}",
        summary.history.len(),
        summary.checkpoints,
        summary.checkpoint_path.display()
    );
    Ok(())
}

fn sample(
    checkpoint: &Path,
    dataset: Option<DatasetKind>,
    data_dir: &Path,
    count: usize,
    output: &Path,
    seed: Option<u64>,
) -> Result<()> {
    let mut flow = Nice::load(checkpoint, seed)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    flow.set_mode(Mode::Inference);
    let dataset = flow
        .config()
        .sampling_dataset(dataset)
        .with_context(|| format!("checking {} against its dataset", checkpoint.display()))?;

    info!("Refitting {} preprocessor from the training split", dataset);
    let train = ImageDataset::load(dataset, &data_dir.join(dataset.as_str()), Split::Train)?;
    let preprocessor = Preprocessor::fit(dataset, train.images())?;

    let images = preprocessor.reverse(&flow.sample(count)?)?;
    let grid = make_grid(&images, dataset.image_shape(), GRID_ROW)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    grid.save(output)
        .with_context(|| format!("writing {}", output.display()))?;

    info!("Wrote {} samples to {}", count, output.display());
    Ok(())
}
