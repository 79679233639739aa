//! NICE: Non-linear Independent Components Estimation
//!
//! `x -> coupling_1 -> ... -> coupling_L -> scaling -> z` with
//! `log p(x) = sum_d log p_prior(z_d) + sum of layer log-determinants`.
//! Inputs live on a `1/levels` grid rescaling of the integer pixel range,
//! so `D * ln(levels)` is subtracted to report likelihoods of the
//! original intensities.

use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::coupling::{Coupling, Scaling};
use super::param::{ParamSlot, Parameters};
use super::prior::LatentPrior;
use super::{Flow, Mode};
use crate::config::{CouplingKind, DatasetKind, LatentKind, MaskParity, TrainConfig};
use crate::data::QUANTIZATION_LEVELS;
use crate::error::{Error, Result};

/// Architecture of a NICE model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NiceConfig {
    /// Dataset the model is trained on, `None` for free-standing flows
    pub dataset: Option<DatasetKind>,
    /// Flattened input dimension
    pub dim: usize,
    /// Number of coupling layers
    pub coupling: usize,
    /// Hidden width of the coupling networks
    pub mid_dim: usize,
    /// Hidden depth of the coupling networks
    pub hidden: usize,
    pub coupling_kind: CouplingKind,
    /// Positions transformed by the first coupling layer
    pub mask: MaskParity,
    pub latent: LatentKind,
    /// Dropout inside coupling networks, training mode only
    pub dropout: f64,
    /// Quantization levels of the modelled data; 1.0 disables the offset
    pub levels: f64,
}

impl NiceConfig {
    /// Architecture described by a run configuration
    pub fn from_train_config(config: &TrainConfig) -> Self {
        Self {
            dataset: Some(config.dataset),
            dim: config.dataset.dim(),
            coupling: config.coupling,
            mid_dim: config.mid_dim,
            hidden: config.hidden,
            coupling_kind: config.coupling_kind,
            mask: config.mask,
            latent: config.latent,
            dropout: config.dropout,
            levels: QUANTIZATION_LEVELS,
        }
    }

    /// Resolve the dataset to sample for. A requested dataset must agree
    /// with the recorded one; without either there is nothing to go on.
    pub fn sampling_dataset(&self, requested: Option<DatasetKind>) -> Result<DatasetKind> {
        let dataset = match (requested, self.dataset) {
            (Some(asked), Some(trained)) if asked != trained => {
                return Err(Error::Config(format!(
                    "model was trained on {trained}, not {asked}"
                )))
            }
            (Some(dataset), _) | (None, Some(dataset)) => dataset,
            (None, None) => {
                return Err(Error::Config("model does not record its dataset".into()))
            }
        };

        if dataset.dim() != self.dim {
            return Err(Error::ShapeMismatch {
                expected: self.dim,
                actual: dataset.dim(),
            });
        }
        Ok(dataset)
    }

    fn validate(&self) -> Result<()> {
        if let Some(dataset) = self.dataset.filter(|d| d.dim() != self.dim) {
            return Err(Error::Config(format!(
                "{} images have {} pixels, flow dimension is {}",
                dataset,
                dataset.dim(),
                self.dim
            )));
        }
        if self.dim < 2 {
            return Err(Error::Config(format!("flow dimension must be at least 2, got {}", self.dim)));
        }
        if self.coupling == 0 || self.mid_dim == 0 || self.hidden == 0 {
            return Err(Error::Config(
                "coupling count, mid_dim and hidden must be positive".into(),
            ));
        }
        if !(self.levels.is_finite() && self.levels >= 1.0) {
            return Err(Error::Config(format!("levels must be at least 1, got {}", self.levels)));
        }
        Ok(())
    }
}

/// Borrowed form written to checkpoints
#[derive(Serialize)]
struct NiceStateRef<'a> {
    config: &'a NiceConfig,
    couplings: &'a [Coupling],
    scaling: &'a Scaling,
}

/// Owned form read back from checkpoints
#[derive(Deserialize)]
struct NiceState {
    config: NiceConfig,
    couplings: Vec<Coupling>,
    scaling: Scaling,
}

impl NiceState {
    /// Decoded layers must match the recorded architecture
    fn check(&self) -> Result<()> {
        let config = &self.config;
        config.validate()?;
        if self.couplings.len() != config.coupling {
            return Err(Error::Flow(format!(
                "checkpoint holds {} couplings, config says {}",
                self.couplings.len(),
                config.coupling
            )));
        }
        for (i, coupling) in self.couplings.iter().enumerate() {
            coupling
                .check_shape(
                    config.dim,
                    config.mid_dim,
                    config.hidden,
                    config.coupling_kind,
                    config.mask.for_layer(i),
                )
                .map_err(|e| Error::Flow(format!("coupling {i}: {e}")))?;
        }
        if self.scaling.log_scale.value.len() != config.dim {
            return Err(Error::Flow(format!(
                "scaling has {} entries for {} dims",
                self.scaling.log_scale.value.len(),
                config.dim
            )));
        }
        Ok(())
    }
}

/// NICE normalizing flow
#[derive(Debug)]
pub struct Nice {
    config: NiceConfig,
    couplings: Vec<Coupling>,
    scaling: Scaling,
    prior: Box<dyn LatentPrior>,
    mode: Mode,
    rng: StdRng,
    /// Latent codes of the last training-mode forward pass
    last_latent: Option<Array2<f64>>,
}

impl Nice {
    /// Build a freshly initialized model
    pub fn new(config: NiceConfig, seed: Option<u64>) -> Result<Self> {
        config.validate()?;
        let mut rng = seeded(seed);

        let couplings = (0..config.coupling)
            .map(|i| {
                Coupling::new(
                    config.dim,
                    config.mid_dim,
                    config.hidden,
                    config.coupling_kind,
                    config.mask.for_layer(i),
                    config.dropout,
                    &mut rng,
                )
            })
            .collect();

        debug!(
            "Built NICE with {} {} couplings over {} dims, {} prior",
            config.coupling, config.coupling_kind, config.dim, config.latent
        );

        Ok(Self {
            prior: config.latent.build(),
            scaling: Scaling::new(config.dim),
            couplings,
            config,
            mode: Mode::Training,
            rng,
            last_latent: None,
        })
    }

    /// Rebuild a model from [`Flow::export_state`] bytes
    pub fn from_state(bytes: &[u8], seed: Option<u64>) -> Result<Self> {
        let state: NiceState =
            bincode::deserialize(bytes).map_err(|e| Error::Flow(format!("corrupt checkpoint: {e}")))?;
        state.check()?;

        Ok(Self {
            prior: state.config.latent.build(),
            config: state.config,
            couplings: state.couplings,
            scaling: state.scaling,
            mode: Mode::Inference,
            rng: seeded(seed),
            last_latent: None,
        })
    }

    /// Load a checkpoint file
    pub fn load<P: AsRef<Path>>(path: P, seed: Option<u64>) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_state(&bytes, seed)
    }

    pub fn config(&self) -> &NiceConfig {
        &self.config
    }

    /// Map data to latent codes; returns `(z, log_det)`
    pub fn encode(&mut self, x: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        if x.ncols() != self.config.dim {
            return Err(Error::ShapeMismatch {
                expected: self.config.dim,
                actual: x.ncols(),
            });
        }

        let mut h = x.clone();
        let mut log_det = Array1::zeros(x.nrows());
        for coupling in &mut self.couplings {
            let (next, ld) = coupling.forward(&h, self.mode, &mut self.rng)?;
            h = next;
            log_det += &ld;
        }
        let (z, ld) = self.scaling.forward(&h, self.mode);
        log_det += &ld;

        Ok((z, log_det))
    }

    /// Map latent codes back to data
    pub fn decode(&mut self, z: &Array2<f64>) -> Result<Array2<f64>> {
        if z.ncols() != self.config.dim {
            return Err(Error::ShapeMismatch {
                expected: self.config.dim,
                actual: z.ncols(),
            });
        }

        let mut x = self.scaling.inverse(z);
        for coupling in self.couplings.iter_mut().rev() {
            x = coupling.inverse(&x, &mut self.rng);
        }
        Ok(x)
    }

    fn clear_caches(&mut self) {
        self.last_latent = None;
        self.scaling.clear_cache();
        self.couplings.iter_mut().for_each(Coupling::clear_cache);
    }
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

impl Parameters for Nice {
    fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
        for coupling in &mut self.couplings {
            coupling.visit_params(visitor);
        }
        self.scaling.visit_params(visitor);
    }
}

impl Flow for Nice {
    fn log_density(&mut self, batch: &Array2<f64>) -> Result<Array1<f64>> {
        let (z, log_det) = self.encode(batch)?;
        let offset = self.config.dim as f64 * self.config.levels.ln();
        let log_p = self.prior.log_density_batch(&z) + &log_det - offset;

        if self.mode == Mode::Training {
            self.last_latent = Some(z);
        }
        Ok(log_p)
    }

    fn backward(&mut self, grad_log_density: &Array1<f64>) -> Result<()> {
        if self.mode != Mode::Training {
            return Err(Error::ModeViolation {
                operation: "backward",
                mode: self.mode,
            });
        }
        let z = self
            .last_latent
            .take()
            .ok_or_else(|| Error::Flow("backward called before log_density".into()))?;
        if grad_log_density.len() != z.nrows() {
            return Err(Error::ShapeMismatch {
                expected: z.nrows(),
                actual: grad_log_density.len(),
            });
        }

        let upstream = grad_log_density.view().insert_axis(Axis(1));
        let grad_z = self.prior.score(&z) * &upstream;

        let grad_h = self.scaling.backward(&grad_z, grad_log_density)?;
        self.couplings
            .iter_mut()
            .rev()
            .try_fold(grad_h, |grad, coupling| coupling.backward(&grad, grad_log_density))?;
        Ok(())
    }

    fn sample(&mut self, n: usize) -> Result<Array2<f64>> {
        if self.mode != Mode::Inference {
            return Err(Error::ModeViolation {
                operation: "sampling",
                mode: self.mode,
            });
        }
        let z = self.prior.sample(n, self.config.dim, &mut self.rng);
        self.decode(&z)
    }

    fn set_mode(&mut self, mode: Mode) {
        if mode != self.mode {
            self.clear_caches();
            self.mode = mode;
        }
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn export_state(&self) -> Result<Vec<u8>> {
        let state = NiceStateRef {
            config: &self.config,
            couplings: &self.couplings,
            scaling: &self.scaling,
        };
        bincode::serialize(&state).map_err(|e| Error::Flow(format!("state export failed: {e}")))
    }
}
