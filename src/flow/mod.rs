//! Normalizing flow model
//!
//! The training core only talks to a flow through the [`Flow`] trait:
//! per-example log-density, a reverse-mode gradient pass, sampling, a
//! two-state mode switch and parameter-state export. [`Nice`] is the
//! concrete model: additive or affine coupling layers followed by a
//! learnable diagonal scaling.

mod coupling;
mod layer;
mod nice;
mod param;
mod prior;

use std::fmt;

use ndarray::{Array1, Array2};

use crate::error::Result;

pub use coupling::{Coupling, Scaling};
pub use layer::{Linear, Mlp};
pub use nice::{Nice, NiceConfig};
pub use param::{gradients, parameter_count, restore, snapshot, Param, ParamSlot, Parameters};
pub use prior::{LatentPrior, StandardLogistic, StandardNormal};

/// Operating mode of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Activations are cached for backward passes and dropout is active
    Training,
    /// No caching, no stochastic regularization; sampling is allowed
    Inference,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Training => "training",
            Mode::Inference => "inference",
        })
    }
}

/// Invertible density model consumed by the training and evaluation loops
pub trait Flow: Parameters {
    /// Change-of-variables log-likelihood of each row of `batch`
    fn log_density(&mut self, batch: &Array2<f64>) -> Result<Array1<f64>>;

    /// Accumulate parameter gradients of a loss, given the loss gradient with
    /// respect to each example's log-density from the latest
    /// [`Flow::log_density`] call. Training mode only.
    fn backward(&mut self, grad_log_density: &Array1<f64>) -> Result<()>;

    /// Draw `n` examples in the model's input domain. Inference mode only.
    fn sample(&mut self, n: usize) -> Result<Array2<f64>>;

    /// Switch between training and inference
    fn set_mode(&mut self, mode: Mode);

    /// Current mode
    fn mode(&self) -> Mode;

    /// Serialized learnable state
    fn export_state(&self) -> Result<Vec<u8>>;
}
