//! Coupling and scaling layers
//!
//! A coupling layer splits each example by position parity. The
//! conditioning half passes through unchanged and drives a network whose
//! output shifts (additive) or scales and shifts (affine) the other half.
//! Layer `forward` maps data towards the latent space and returns the
//! per-example log-determinant of its Jacobian.

use ndarray::{concatenate, s, Array1, Array2, Axis, Ix1};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layer::Mlp;
use super::param::{Param, ParamSlot, Parameters};
use super::Mode;
use crate::config::{CouplingKind, MaskParity};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct CouplingCache {
    x_on: Array2<f64>,
    log_scale: Option<Array2<f64>>,
}

/// Additive or affine coupling layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupling {
    kind: CouplingKind,
    parity: MaskParity,
    /// Transformed positions
    on: Vec<usize>,
    /// Conditioning positions
    off: Vec<usize>,
    net: Mlp,
    #[serde(skip)]
    cache: Option<CouplingCache>,
}

impl Coupling {
    pub fn new(
        dim: usize,
        mid_dim: usize,
        hidden: usize,
        kind: CouplingKind,
        parity: MaskParity,
        dropout: f64,
        rng: &mut StdRng,
    ) -> Self {
        let (on, off): (Vec<usize>, Vec<usize>) = (0..dim).partition(|&i| parity.transforms(i));
        let out = match kind {
            CouplingKind::Additive => on.len(),
            CouplingKind::Affine => 2 * on.len(),
        };
        let net = Mlp::new(off.len(), mid_dim, out, hidden, dropout, rng);

        Self {
            kind,
            parity,
            on,
            off,
            net,
            cache: None,
        }
    }

    pub fn kind(&self) -> CouplingKind {
        self.kind
    }

    /// Verify a decoded layer against the architecture it should have
    pub fn check_shape(
        &self,
        dim: usize,
        mid_dim: usize,
        hidden: usize,
        kind: CouplingKind,
        parity: MaskParity,
    ) -> Result<()> {
        if self.kind != kind || self.parity != parity {
            return Err(Error::Flow(format!(
                "{} layer with {:?} mask where {} with {:?} was expected",
                self.kind, self.parity, kind, parity
            )));
        }

        let (on, off): (Vec<usize>, Vec<usize>) = (0..dim).partition(|&i| parity.transforms(i));
        if self.on != on || self.off != off {
            return Err(Error::Flow(format!(
                "coupling split does not partition {dim} positions by {parity:?} parity"
            )));
        }

        let out = match kind {
            CouplingKind::Additive => on.len(),
            CouplingKind::Affine => 2 * on.len(),
        };
        self.net.check_shape(off.len(), mid_dim, out, hidden)
    }

    /// Data-to-latent direction; returns `(y, log_det)`
    pub fn forward(
        &mut self,
        x: &Array2<f64>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<(Array2<f64>, Array1<f64>)> {
        let x_on = x.select(Axis(1), &self.on);
        let x_off = x.select(Axis(1), &self.off);
        let h = self.net.forward(&x_off, mode, rng);

        let (y_on, log_det, log_scale) = match self.kind {
            CouplingKind::Additive => (&x_on + &h, Array1::zeros(x.nrows()), None),
            CouplingKind::Affine => {
                let n = self.on.len();
                let log_scale = h.slice(s![.., ..n]).mapv(f64::tanh);
                let shift = h.slice(s![.., n..]);
                let y_on = &x_on * &log_scale.mapv(f64::exp) + &shift;
                let log_det = log_scale.sum_axis(Axis(1));
                (y_on, log_det, Some(log_scale))
            }
        };

        if mode == Mode::Training {
            self.cache = Some(CouplingCache { x_on, log_scale });
        }
        Ok((self.merge(&y_on, &x_off, x.nrows()), log_det))
    }

    /// Latent-to-data direction
    pub fn inverse(&mut self, y: &Array2<f64>, rng: &mut StdRng) -> Array2<f64> {
        let y_on = y.select(Axis(1), &self.on);
        let y_off = y.select(Axis(1), &self.off);
        let h = self.net.forward(&y_off, Mode::Inference, rng);

        let x_on = match self.kind {
            CouplingKind::Additive => &y_on - &h,
            CouplingKind::Affine => {
                let n = self.on.len();
                let log_scale = h.slice(s![.., ..n]).mapv(f64::tanh);
                (&y_on - &h.slice(s![.., n..])) * &log_scale.mapv(|v| (-v).exp())
            }
        };
        self.merge(&x_on, &y_off, y.nrows())
    }

    /// Given `dL/dy` and `dL/dlog_det`, accumulate parameter gradients and
    /// return `dL/dx`
    pub fn backward(&mut self, grad_y: &Array2<f64>, grad_log_det: &Array1<f64>) -> Result<Array2<f64>> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| Error::Flow("coupling backward without a training-mode forward".into()))?;

        let g_on = grad_y.select(Axis(1), &self.on);
        let g_off = grad_y.select(Axis(1), &self.off);

        let (grad_x_on, grad_h) = match (self.kind, cache.log_scale) {
            (CouplingKind::Additive, _) => (g_on.clone(), g_on),
            (CouplingKind::Affine, Some(log_scale)) => {
                let scale = log_scale.mapv(f64::exp);
                let grad_x_on = &g_on * &scale;
                let grad_log_scale =
                    &g_on * &cache.x_on * &scale + &grad_log_det.view().insert_axis(Axis(1));
                let grad_raw = grad_log_scale * &log_scale.mapv(|s| 1.0 - s * s);
                let grad_h = concatenate(Axis(1), &[grad_raw.view(), g_on.view()])
                    .map_err(|e| Error::Flow(e.to_string()))?;
                (grad_x_on, grad_h)
            }
            (CouplingKind::Affine, None) => {
                return Err(Error::Flow("affine coupling cache lost its scales".into()))
            }
        };

        let grad_x_off = g_off + self.net.backward(&grad_h)?;
        Ok(self.merge(&grad_x_on, &grad_x_off, grad_y.nrows()))
    }

    pub fn clear_cache(&mut self) {
        self.cache = None;
        self.net.clear_cache();
    }

    fn merge(&self, on: &Array2<f64>, off: &Array2<f64>, rows: usize) -> Array2<f64> {
        let mut out = Array2::zeros((rows, self.on.len() + self.off.len()));
        for (j, &col) in self.on.iter().enumerate() {
            out.column_mut(col).assign(&on.column(j));
        }
        for (j, &col) in self.off.iter().enumerate() {
            out.column_mut(col).assign(&off.column(j));
        }
        out
    }
}

impl Parameters for Coupling {
    fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
        self.net.visit_params(visitor);
    }
}

/// Learnable diagonal scaling `z = h * exp(s)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaling {
    pub log_scale: Param<Ix1>,
    #[serde(skip)]
    last_output: Option<Array2<f64>>,
}

impl Scaling {
    pub fn new(dim: usize) -> Self {
        Self {
            log_scale: Param::new(Array1::zeros(dim)),
            last_output: None,
        }
    }

    pub fn forward(&mut self, h: &Array2<f64>, mode: Mode) -> (Array2<f64>, Array1<f64>) {
        let z = h * &self.log_scale.value.mapv(f64::exp);
        let log_det = Array1::from_elem(h.nrows(), self.log_scale.value.sum());
        if mode == Mode::Training {
            self.last_output = Some(z.clone());
        }
        (z, log_det)
    }

    pub fn inverse(&self, z: &Array2<f64>) -> Array2<f64> {
        z * &self.log_scale.value.mapv(|s| (-s).exp())
    }

    pub fn backward(&mut self, grad_z: &Array2<f64>, grad_log_det: &Array1<f64>) -> Result<Array2<f64>> {
        let z = self
            .last_output
            .take()
            .ok_or_else(|| Error::Flow("scaling backward without a training-mode forward".into()))?;

        let grad_s = (grad_z * &z).sum_axis(Axis(0)) + grad_log_det.sum();
        self.log_scale.accumulate(grad_s);

        Ok(grad_z * &self.log_scale.value.mapv(f64::exp))
    }

    pub fn clear_cache(&mut self) {
        self.last_output = None;
    }
}

impl Parameters for Scaling {
    fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
        visitor(self.log_scale.slot());
    }
}
