//! Run configuration
//!
//! One immutable [`TrainConfig`] describes a whole training run: dataset,
//! flow architecture, optimizer settings and where artifacts are written.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Supported image datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetKind {
    Mnist,
    FashionMnist,
}

/// Height and width of one greyscale image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    /// Number of pixels in one image
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

impl DatasetKind {
    /// Identifier used on the command line and in artifact names
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Mnist => "mnist",
            DatasetKind::FashionMnist => "fashion-mnist",
        }
    }

    /// Image shape of every example in this dataset
    pub fn image_shape(&self) -> ImageShape {
        match self {
            DatasetKind::Mnist | DatasetKind::FashionMnist => ImageShape {
                height: 28,
                width: 28,
            },
        }
    }

    /// Flattened example dimension
    pub fn dim(&self) -> usize {
        self.image_shape().pixels()
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mnist" => Ok(DatasetKind::Mnist),
            "fashion-mnist" | "fashion_mnist" | "fashionmnist" => Ok(DatasetKind::FashionMnist),
            other => Err(Error::UnsupportedDataset(other.to_string())),
        }
    }
}

/// Base distribution of the flow's latent space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatentKind {
    Normal,
    Logistic,
}

impl fmt::Display for LatentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LatentKind::Normal => "normal",
            LatentKind::Logistic => "logistic",
        })
    }
}

impl FromStr for LatentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "gaussian" => Ok(LatentKind::Normal),
            "logistic" => Ok(LatentKind::Logistic),
            other => Err(Error::Config(format!("unknown latent prior '{other}'"))),
        }
    }
}

/// Coupling-layer parameterization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CouplingKind {
    /// `y = x + m(x_off)`, volume preserving
    Additive,
    /// `y = x * exp(s) + t` with `(s, t)` from the coupling network
    Affine,
}

impl fmt::Display for CouplingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CouplingKind::Additive => "additive",
            CouplingKind::Affine => "affine",
        })
    }
}

impl FromStr for CouplingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "additive" => Ok(CouplingKind::Additive),
            "affine" => Ok(CouplingKind::Affine),
            other => Err(Error::Config(format!("unknown coupling type '{other}'"))),
        }
    }
}

/// Which positions the first coupling layer transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaskParity {
    Even,
    Odd,
}

impl MaskParity {
    /// Parity used by the coupling layer at `index`; layers alternate
    pub fn for_layer(self, index: usize) -> Self {
        match (self, index % 2) {
            (parity, 0) => parity,
            (MaskParity::Even, _) => MaskParity::Odd,
            (MaskParity::Odd, _) => MaskParity::Even,
        }
    }

    /// Whether position `i` is transformed under this parity
    pub fn transforms(self, i: usize) -> bool {
        match self {
            MaskParity::Even => i % 2 == 0,
            MaskParity::Odd => i % 2 == 1,
        }
    }
}

impl FromStr for MaskParity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "even" | "1" => Ok(MaskParity::Even),
            "odd" | "0" => Ok(MaskParity::Odd),
            other => Err(Error::Config(format!("unknown mask parity '{other}'"))),
        }
    }
}

/// Independent random streams of a training run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomStream {
    /// Weight initialization and coupling-network dropout
    Model,
    /// Training-set shuffling
    Shuffle,
    /// Dequantization noise
    Noise,
}

/// Configuration of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Dataset to model
    pub dataset: DatasetKind,
    /// Root directory holding `{dataset}/` IDX files
    pub data_dir: PathBuf,
    /// Root directory for models, samples and loss charts
    pub output_dir: PathBuf,
    /// Images per mini-batch
    pub batch_size: usize,
    /// Latent prior
    pub latent: LatentKind,
    /// Number of epochs to run
    pub max_epochs: usize,
    /// Images generated for the per-epoch sample grid
    pub sample_size: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Adam epsilon
    pub epsilon: f64,
    /// Number of coupling layers
    pub coupling: usize,
    /// Checkpoint cadence in epochs
    pub save_every: f64,
    /// Coupling parameterization
    pub coupling_kind: CouplingKind,
    /// Width of the coupling networks' hidden layers
    pub mid_dim: usize,
    /// Number of hidden layers per coupling network
    pub hidden: usize,
    /// Positions transformed by the first coupling layer
    pub mask: MaskParity,
    /// Add uniform dequantization noise to training batches
    pub dequantize: bool,
    /// Dropout rate inside coupling networks (training mode only)
    pub dropout: f64,
    /// Base seed of the run's random streams, entropy when unset
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Mnist,
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("."),
            batch_size: 200,
            latent: LatentKind::Logistic,
            max_epochs: 50,
            sample_size: 64,
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-4,
            coupling: 4,
            save_every: 10.0,
            coupling_kind: CouplingKind::Additive,
            mid_dim: 1000,
            hidden: 5,
            mask: MaskParity::Even,
            dequantize: true,
            dropout: 0.0,
            seed: None,
        }
    }
}

impl TrainConfig {
    /// Load configuration from a JSON file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject parameters no run can succeed with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("max_epochs", self.max_epochs),
            ("sample_size", self.sample_size),
            ("coupling", self.coupling),
            ("mid_dim", self.mid_dim),
            ("hidden", self.hidden),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(Error::Config(format!("{name} must lie in [0, 1), got {beta}")));
            }
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(Error::Config(format!("epsilon must be positive, got {}", self.epsilon)));
        }
        if !(self.save_every.is_finite() && self.save_every > 0.0) {
            return Err(Error::Config(format!(
                "save_every must be positive, got {}",
                self.save_every
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }

        Ok(())
    }

    /// Checkpoint file, derived from dataset and architecture
    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join("models").join(format!(
            "{}_batch{}_coupling{}_mid{}_hidden{}.bin",
            self.dataset, self.batch_size, self.coupling, self.mid_dim, self.hidden
        ))
    }

    /// Directory receiving per-epoch sample grids
    pub fn samples_dir(&self) -> PathBuf {
        self.output_dir.join("samples")
    }

    /// File name prefix of the sample grids
    pub fn sample_prefix(&self) -> String {
        format!("{}_sampled", self.dataset)
    }

    /// Final loss chart
    pub fn loss_chart_path(&self) -> PathBuf {
        self.output_dir.join("loss").join(format!("{}_loss.png", self.dataset))
    }

    /// Final loss table
    pub fn loss_table_path(&self) -> PathBuf {
        self.output_dir.join("loss").join(format!("{}_loss.csv", self.dataset))
    }

    /// Directory holding the dataset's IDX files
    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join(self.dataset.as_str())
    }

    /// Seed of one random stream, offset from `seed` so streams never share a sequence
    pub fn stream_seed(&self, stream: RandomStream) -> Option<u64> {
        let offset = match stream {
            RandomStream::Model => 0,
            RandomStream::Shuffle => 1,
            RandomStream::Noise => 2,
        };
        self.seed.map(|seed| seed.wrapping_add(offset))
    }
}
