//! Mapping between image pixels and the flow's input domain
//!
//! Pixels in `[0, 1]` are rescaled onto the 256 quantization bins of the
//! original 8-bit data, moved to a point inside their bin (the bin centre,
//! or a uniformly random point when dequantizing) and mean-centred. The
//! centring mean is fitted once on the training split.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::DatasetKind;
use crate::error::{Error, Result};

/// Number of intensity levels of the source images
pub const QUANTIZATION_LEVELS: f64 = 256.0;

const MAX_INTENSITY: f64 = QUANTIZATION_LEVELS - 1.0;

/// Dataset-specific invertible preprocessing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preprocessor {
    kind: DatasetKind,
    /// Per-pixel mean of the rescaled training images
    mean: Array1<f64>,
}

impl Preprocessor {
    /// Preprocessor with a zero mean
    pub fn new(kind: DatasetKind) -> Self {
        Self {
            kind,
            mean: Array1::zeros(kind.dim()),
        }
    }

    /// Fit the centring mean on training images
    pub fn fit(kind: DatasetKind, images: &Array2<f64>) -> Result<Self> {
        check_width(kind.dim(), images.ncols())?;
        let mean = images
            .mean_axis(Axis(0))
            .map(|m| m.mapv(rescale_center))
            .unwrap_or_else(|| Array1::zeros(kind.dim()));
        Ok(Self { kind, mean })
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Deterministic forward transform: bin centres, mean-centred
    pub fn forward(&self, batch: &Array2<f64>) -> Result<Array2<f64>> {
        check_width(self.kind.dim(), batch.ncols())?;
        Ok(batch.mapv(rescale_center) - &self.mean)
    }

    /// Forward transform with uniform noise inside each quantization bin
    pub fn dequantize(&self, batch: &Array2<f64>, rng: &mut StdRng) -> Result<Array2<f64>> {
        check_width(self.kind.dim(), batch.ncols())?;
        let noise = Array2::random_using(batch.raw_dim(), Uniform::new(0.0, 1.0), rng);
        Ok((batch * MAX_INTENSITY + noise) / QUANTIZATION_LEVELS - &self.mean)
    }

    /// Exact inverse of [`Preprocessor::forward`]
    pub fn reverse(&self, batch: &Array2<f64>) -> Result<Array2<f64>> {
        check_width(self.kind.dim(), batch.ncols())?;
        Ok(((batch + &self.mean) * QUANTIZATION_LEVELS - 0.5) / MAX_INTENSITY)
    }
}

fn rescale_center(x: f64) -> f64 {
    (x * MAX_INTENSITY + 0.5) / QUANTIZATION_LEVELS
}

fn check_width(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ShapeMismatch { expected, actual })
    }
}
