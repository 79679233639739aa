//! Latent priors
//!
//! A flow only needs its base distribution's density, score and sampler, so
//! both variants sit behind the same [`LatentPrior`] trait. The distribution
//! factorizes over coordinates; everything is defined per coordinate and
//! summed.

use std::f64::consts::PI;
use std::fmt::Debug;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::distributions::Open01;
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal as NormalDistr};

use crate::config::LatentKind;

/// Factorized base distribution of a flow's latent space
pub trait LatentPrior: Debug + Send + Sync {
    /// Which variant this is
    fn kind(&self) -> LatentKind;

    /// Log-density of a single coordinate
    fn unit_log_density(&self, z: f64) -> f64;

    /// Derivative of [`LatentPrior::unit_log_density`]
    fn unit_score(&self, z: f64) -> f64;

    /// Draw a single coordinate
    fn unit_sample(&self, rng: &mut dyn RngCore) -> f64;

    /// Log-density of one latent point
    fn log_density(&self, point: ArrayView1<'_, f64>) -> f64 {
        point.iter().map(|&z| self.unit_log_density(z)).sum()
    }

    /// Log-density of each row
    fn log_density_batch(&self, points: &Array2<f64>) -> Array1<f64> {
        points.map_axis(Axis(1), |row| self.log_density(row))
    }

    /// Elementwise gradient of the log-density
    fn score(&self, points: &Array2<f64>) -> Array2<f64> {
        points.mapv(|z| self.unit_score(z))
    }

    /// Draw `n` points of dimension `dim`
    fn sample(&self, n: usize, dim: usize, rng: &mut dyn RngCore) -> Array2<f64> {
        Array2::from_shape_simple_fn((n, dim), || self.unit_sample(rng))
    }
}

/// Standard normal prior
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardNormal;

impl LatentPrior for StandardNormal {
    fn kind(&self) -> LatentKind {
        LatentKind::Normal
    }

    fn unit_log_density(&self, z: f64) -> f64 {
        -0.5 * (z * z + (2.0 * PI).ln())
    }

    fn unit_score(&self, z: f64) -> f64 {
        -z
    }

    fn unit_sample(&self, rng: &mut dyn RngCore) -> f64 {
        NormalDistr.sample(rng)
    }
}

/// Standard logistic prior, heavier tailed than the normal
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardLogistic;

impl LatentPrior for StandardLogistic {
    fn kind(&self) -> LatentKind {
        LatentKind::Logistic
    }

    fn unit_log_density(&self, z: f64) -> f64 {
        -(softplus(z) + softplus(-z))
    }

    fn unit_score(&self, z: f64) -> f64 {
        -(0.5 * z).tanh()
    }

    fn unit_sample(&self, rng: &mut dyn RngCore) -> f64 {
        // inverse CDF; Open01 keeps both logs finite
        let u: f64 = Open01.sample(rng);
        u.ln() - (-u).ln_1p()
    }
}

/// Numerically stable `ln(1 + e^x)`
fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

impl LatentKind {
    /// Instantiate the prior this variant names
    pub fn build(self) -> Box<dyn LatentPrior> {
        match self {
            LatentKind::Normal => Box::new(StandardNormal),
            LatentKind::Logistic => Box::new(StandardLogistic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn priors() -> Vec<Box<dyn LatentPrior>> {
        vec![LatentKind::Normal.build(), LatentKind::Logistic.build()]
    }

    #[test]
    fn test_normal_density_at_zero() {
        let p = StandardNormal;
        assert_abs_diff_eq!(p.unit_log_density(0.0), -0.5 * (2.0 * PI).ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_logistic_density_at_zero() {
        // p(0) = 1/4
        assert_abs_diff_eq!(StandardLogistic.unit_log_density(0.0), 0.25f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_logistic_density_finite_in_tails() {
        let p = StandardLogistic;
        assert!(p.unit_log_density(800.0).is_finite());
        assert!(p.unit_log_density(-800.0).is_finite());
    }

    #[test]
    fn test_score_matches_finite_difference() {
        let h = 1e-6;
        for prior in priors() {
            for &z in &[-3.0, -0.4, 0.0, 1.7] {
                let numeric =
                    (prior.unit_log_density(z + h) - prior.unit_log_density(z - h)) / (2.0 * h);
                assert_abs_diff_eq!(prior.unit_score(z), numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_sample_moments() {
        let mut rng = StdRng::seed_from_u64(42);
        for prior in priors() {
            let samples = prior.sample(20_000, 2, &mut rng);
            assert_eq!(samples.dim(), (20_000, 2));

            let mean = samples.mean().unwrap();
            assert!(mean.abs() < 0.05, "{:?} mean {}", prior.kind(), mean);

            let var = samples.mapv(|z| z * z).mean().unwrap();
            let expected = match prior.kind() {
                LatentKind::Normal => 1.0,
                LatentKind::Logistic => PI * PI / 3.0,
            };
            assert!((var - expected).abs() < 0.1 * expected);
        }
    }

    #[test]
    fn test_batch_density_sums_coordinates() {
        let prior = StandardNormal;
        let points = Array2::from_shape_vec((2, 2), vec![0.0, 0.0, 1.0, -1.0]).unwrap();
        let log_p = prior.log_density_batch(&points);

        assert_abs_diff_eq!(log_p[0], -(2.0 * PI).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(log_p[1], -1.0 - (2.0 * PI).ln(), epsilon = 1e-12);
    }
}
