//! Optimization Algorithms
//!
//! Optimizers walk a model's learnable tensors through
//! [`Parameters::visit_params`] and apply the gradients accumulated by the
//! latest backward pass. Per-tensor state is keyed by visit order.

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::flow::{ParamSlot, Parameters};

/// Stochastic gradient-based parameter updater
pub trait Optimizer {
    /// Discard every accumulated gradient
    fn zero_gradients<P: Parameters + ?Sized>(&mut self, model: &mut P);

    /// Apply the accumulated gradients
    fn step<P: Parameters + ?Sized>(&mut self, model: &mut P) -> Result<()>;
}

/// First and second moment estimates of one tensor
type Moments = (ArrayD<f64>, ArrayD<f64>);

/// Adam optimizer (Adaptive Moment Estimation)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    #[serde(skip)]
    t: i32,
    #[serde(skip)]
    moments: Vec<Option<Moments>>,
}

impl Adam {
    pub fn new(learning_rate: f64, betas: (f64, f64), epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1: betas.0,
            beta2: betas.1,
            epsilon,
            t: 0,
            moments: Vec::new(),
        }
    }

    /// Adam configured from a run's optimizer settings
    pub fn from_config(config: &TrainConfig) -> Self {
        Self::new(config.learning_rate, (config.beta1, config.beta2), config.epsilon)
    }

    /// Number of steps taken so far
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn zero_gradients<P: Parameters + ?Sized>(&mut self, model: &mut P) {
        model.visit_params(&mut |slot: ParamSlot<'_>| *slot.grad = None);
    }

    fn step<P: Parameters + ?Sized>(&mut self, model: &mut P) -> Result<()> {
        self.t += 1;
        let (lr, beta1, beta2, eps) = (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        let correction1 = 1.0 - beta1.powi(self.t);
        let correction2 = 1.0 - beta2.powi(self.t);

        let moments = &mut self.moments;
        let mut index = 0;
        let mut failure = None;

        model.visit_params(&mut |mut slot: ParamSlot<'_>| {
            let position = index;
            index += 1;
            if failure.is_some() {
                return;
            }
            let Some(grad) = slot.grad.as_ref() else {
                return;
            };
            if grad.shape() != slot.value.shape() {
                failure = Some(Error::ShapeMismatch {
                    expected: slot.value.len(),
                    actual: grad.len(),
                });
                return;
            }

            if moments.len() <= position {
                moments.resize(position + 1, None);
            }
            let (m, v) = moments[position].get_or_insert_with(|| {
                (ArrayD::zeros(grad.raw_dim()), ArrayD::zeros(grad.raw_dim()))
            });
            if m.shape() != grad.shape() {
                failure = Some(Error::ShapeMismatch {
                    expected: m.len(),
                    actual: grad.len(),
                });
                return;
            }

            Zip::from(&mut slot.value)
                .and(m)
                .and(v)
                .and(grad)
                .for_each(|w, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    *w -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        });

        match failure {
            Some(err) => Err(err),
            None => {
                debug!("Adam step {} over {} tensors", self.t, index);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Param;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Ix1};

    struct Quadratic {
        x: Param<Ix1>,
    }

    impl Quadratic {
        /// Gradient of `sum((x - 3)^2)`
        fn backward(&mut self) {
            let grad = self.x.value.mapv(|x| 2.0 * (x - 3.0));
            self.x.accumulate(grad);
        }
    }

    impl Parameters for Quadratic {
        fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
            visitor(self.x.slot());
        }
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut model = Quadratic { x: Param::new(array![0.0, 10.0]) };
        let mut adam = Adam::new(0.1, (0.9, 0.999), 1e-8);

        model.backward();
        adam.step(&mut model).unwrap();

        // bias-corrected first step is lr * sign(grad)
        assert_abs_diff_eq!(model.x.value[0], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(model.x.value[1], 9.9, epsilon = 1e-6);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_converges_on_quadratic() {
        let mut model = Quadratic { x: Param::new(array![-4.0, 8.0]) };
        let mut adam = Adam::new(0.05, (0.9, 0.999), 1e-8);

        for _ in 0..2000 {
            adam.zero_gradients(&mut model);
            model.backward();
            adam.step(&mut model).unwrap();
        }

        for &x in model.x.value.iter() {
            assert_abs_diff_eq!(x, 3.0, epsilon = 5e-2);
        }
    }

    #[test]
    fn test_zero_gradients_clears_accumulation() {
        let mut model = Quadratic { x: Param::new(array![1.0]) };
        let mut adam = Adam::new(0.1, (0.9, 0.999), 1e-8);

        model.backward();
        adam.zero_gradients(&mut model);
        assert!(model.x.grad().is_none());

        // no gradient means no update
        adam.step(&mut model).unwrap();
        assert_eq!(model.x.value, array![1.0]);
    }

    #[test]
    fn test_from_config_uses_run_settings() {
        let config = TrainConfig::default();
        let adam = Adam::from_config(&config);

        assert_eq!(adam.learning_rate, 1e-3);
        assert_eq!((adam.beta1, adam.beta2), (0.9, 0.999));
        assert_eq!(adam.epsilon, 1e-4);
    }
}
