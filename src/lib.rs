//! # NICE Flow
//!
//! Maximum-likelihood training of NICE normalizing flows on MNIST-style
//! greyscale image datasets.
//!
//! ## Modules
//!
//! - `config` - Run configuration and dataset identifiers
//! - `data` - IDX loading, batching and the invertible preprocessor
//! - `flow` - The `Flow` contract, latent priors and the NICE model
//! - `optim` - Gradient-based optimizers
//! - `training` - Training and evaluation loops, epoch orchestration
//! - `report` - Checkpoints, sample grids and loss charts
//! - `utils` - Logging setup
//!
//! ## Example
//!
//! ```no_run
//! use nice_flow::{run_training, TrainConfig};
//!
//! let config = TrainConfig {
//!     max_epochs: 5,
//!     ..TrainConfig::default()
//! };
//! let summary = run_training(&config, false)?;
//! println!("final test loss {:?}", summary.history.test.last());
//! # Ok::<(), nice_flow::Error>(())
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod flow;
pub mod optim;
pub mod report;
pub mod training;
pub mod utils;

pub use config::{
    CouplingKind, DatasetKind, ImageShape, LatentKind, MaskParity, RandomStream, TrainConfig,
};
pub use data::{Batch, BatchLoader, ImageDataset, Preprocessor, Split};
pub use error::{Error, Result};
pub use flow::{Flow, LatentPrior, Mode, Nice, NiceConfig, Parameters};
pub use optim::{Adam, Optimizer};
pub use report::{finalize_report, maybe_checkpoint, GridWriter, LossHistory, Reporter, SampleSink};
pub use training::{run_training, EpochRunner, Phase, RunSummary, Trainer};
