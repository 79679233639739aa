//! Training and evaluation loops

mod loops;
mod trainer;

use std::fmt;

use tracing::info;

use crate::config::{RandomStream, TrainConfig};
use crate::data::{ImageDataset, Preprocessor, Split};
use crate::error::Result;
use crate::flow::{parameter_count, Nice, NiceConfig};
use crate::optim::Adam;
use crate::report::GridWriter;

pub use loops::{EpochRunner, RunningLoss};
pub use trainer::{RunSummary, Trainer};

/// Stage of an epoch, used to locate failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
    Checkpoint,
    Report,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Train => "train",
            Phase::Eval => "eval",
            Phase::Checkpoint => "checkpoint",
            Phase::Report => "report",
        })
    }
}

/// Load both splits, fit the preprocessor on the training images
pub fn load_datasets(config: &TrainConfig) -> Result<(ImageDataset, ImageDataset, Preprocessor)> {
    let dir = config.dataset_dir();
    let train = ImageDataset::load(config.dataset, &dir, Split::Train)?;
    let test = ImageDataset::load(config.dataset, &dir, Split::Test)?;
    let preprocessor = Preprocessor::fit(config.dataset, train.images())?;
    Ok((train, test, preprocessor))
}

/// Train a NICE model end to end with the given configuration
pub fn run_training(config: &TrainConfig, show_progress: bool) -> Result<RunSummary> {
    config.validate()?;
    let (train, test, preprocessor) = load_datasets(config)?;

    let model_seed = config.stream_seed(RandomStream::Model);
    let mut flow = Nice::new(NiceConfig::from_train_config(config), model_seed)?;
    let mut optimizer = Adam::from_config(config);
    let mut sink = GridWriter::new(
        config.samples_dir(),
        config.sample_prefix(),
        config.dataset.image_shape(),
    );

    info!(
        "NICE on {}: {} {} couplings, {} prior, {} parameters",
        config.dataset,
        config.coupling,
        config.coupling_kind,
        config.latent,
        parameter_count(&mut flow)
    );

    Trainer::new(config)
        .with_progress(show_progress)
        .run(&mut flow, &mut optimizer, &train, &test, preprocessor, &mut sink)
}
