//! Dense layers and the coupling networks built from them
//!
//! Forward passes in training mode cache what the backward pass needs;
//! inference-mode passes leave no state behind.

use ndarray::{Array2, Axis, Ix1, Ix2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::param::{Param, ParamSlot, Parameters};
use super::Mode;
use crate::error::{Error, Result};

/// Fully connected layer: `output = input @ weights + bias`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    /// Weight matrix (input_size x output_size)
    pub weight: Param<Ix2>,
    /// Bias vector (output_size)
    pub bias: Param<Ix1>,
    #[serde(skip)]
    last_input: Option<Array2<f64>>,
}

impl Linear {
    /// Create a layer with Xavier/Glorot uniform weights and zero bias
    pub fn new(input_size: usize, output_size: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input_size + output_size) as f64).sqrt();
        let weights = Array2::random_using((input_size, output_size), Uniform::new(-limit, limit), rng);

        Self {
            weight: Param::new(weights),
            bias: Param::new(ndarray::Array1::zeros(output_size)),
            last_input: None,
        }
    }

    /// Create a layer whose weights and bias are all zero
    pub fn zeros(input_size: usize, output_size: usize) -> Self {
        Self {
            weight: Param::new(Array2::zeros((input_size, output_size))),
            bias: Param::new(ndarray::Array1::zeros(output_size)),
            last_input: None,
        }
    }

    pub fn input_size(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.weight.value.ncols()
    }

    pub fn forward(&mut self, input: &Array2<f64>, mode: Mode) -> Array2<f64> {
        let output = input.dot(&self.weight.value) + &self.bias.value;
        if mode == Mode::Training {
            self.last_input = Some(input.clone());
        }
        output
    }

    /// Accumulate weight and bias gradients; returns the input gradient
    pub fn backward(&mut self, output_gradient: &Array2<f64>) -> Result<Array2<f64>> {
        let input = self
            .last_input
            .take()
            .ok_or_else(|| Error::Flow("linear backward without a training-mode forward".into()))?;

        self.weight.accumulate(input.t().dot(output_gradient));
        self.bias.accumulate(output_gradient.sum_axis(Axis(0)));

        Ok(output_gradient.dot(&self.weight.value.t()))
    }

    pub fn clear_cache(&mut self) {
        self.last_input = None;
    }
}

impl Parameters for Linear {
    fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
        visitor(self.weight.slot());
        visitor(self.bias.slot());
    }
}

/// Multi-layer perceptron with ReLU hidden layers and a linear output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<Linear>,
    dropout: f64,
    /// Per hidden layer: ReLU derivative times the dropout mask
    #[serde(skip)]
    masks: Vec<Array2<f64>>,
}

impl Mlp {
    /// `input -> mid_dim` ReLU, `hidden - 1` further `mid_dim` ReLU layers,
    /// then a linear `mid_dim -> output`. The output layer starts at zero so
    /// a fresh coupling layer is the identity.
    pub fn new(
        input_size: usize,
        mid_dim: usize,
        output_size: usize,
        hidden: usize,
        dropout: f64,
        rng: &mut StdRng,
    ) -> Self {
        let mut layers = Vec::with_capacity(hidden + 1);
        layers.push(Linear::new(input_size, mid_dim, rng));
        for _ in 1..hidden {
            layers.push(Linear::new(mid_dim, mid_dim, rng));
        }
        layers.push(Linear::zeros(mid_dim, output_size));

        Self {
            layers,
            dropout: dropout.clamp(0.0, 1.0),
            masks: Vec::new(),
        }
    }

    /// Check the layer widths against the shape `new` would have built
    pub fn check_shape(
        &self,
        input_size: usize,
        mid_dim: usize,
        output_size: usize,
        hidden: usize,
    ) -> Result<()> {
        let expected = std::iter::once((input_size, mid_dim))
            .chain((1..hidden).map(|_| (mid_dim, mid_dim)))
            .chain(std::iter::once((mid_dim, output_size)));
        let actual = self.layers.iter().map(|l| (l.input_size(), l.output_size()));

        if self.layers.len() != hidden + 1 || !expected.eq(actual) {
            return Err(Error::Flow(format!(
                "network layers do not match {input_size} -> {mid_dim} x {hidden} -> {output_size}"
            )));
        }
        if let Some(layer) = self.layers.iter().find(|l| l.bias.value.len() != l.output_size()) {
            return Err(Error::Flow(format!(
                "bias of length {} on a layer with {} outputs",
                layer.bias.value.len(),
                layer.output_size()
            )));
        }
        Ok(())
    }

    pub fn forward(&mut self, input: &Array2<f64>, mode: Mode, rng: &mut StdRng) -> Array2<f64> {
        self.masks.clear();
        let Some((output, hidden)) = self.layers.split_last_mut() else {
            return input.clone();
        };

        let mut h = input.clone();
        for layer in hidden.iter_mut() {
            let pre = layer.forward(&h, mode);
            let mask = activation_mask(&pre, self.dropout, mode, rng);
            h = &pre * &mask;
            if mode == Mode::Training {
                self.masks.push(mask);
            }
        }
        output.forward(&h, mode)
    }

    /// Backpropagate through the cached forward pass; returns the input gradient
    pub fn backward(&mut self, output_gradient: &Array2<f64>) -> Result<Array2<f64>> {
        let Some((output, hidden)) = self.layers.split_last_mut() else {
            return Ok(output_gradient.clone());
        };
        if self.masks.len() != hidden.len() {
            return Err(Error::Flow("network backward without a training-mode forward".into()));
        }

        let mut grad = output.backward(output_gradient)?;
        for (layer, mask) in hidden.iter_mut().rev().zip(self.masks.drain(..).rev()) {
            grad = layer.backward(&(&grad * &mask))?;
        }
        Ok(grad)
    }

    pub fn clear_cache(&mut self) {
        self.masks.clear();
        self.layers.iter_mut().for_each(Linear::clear_cache);
    }
}

impl Parameters for Mlp {
    fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
        for layer in &mut self.layers {
            layer.visit_params(visitor);
        }
    }
}

/// ReLU derivative, with inverted dropout folded in during training
fn activation_mask(pre: &Array2<f64>, dropout: f64, mode: Mode, rng: &mut StdRng) -> Array2<f64> {
    let relu = pre.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
    if mode != Mode::Training || dropout <= 0.0 {
        return relu;
    }

    let keep = 1.0 - dropout;
    relu.mapv(|r| {
        if rng.gen::<f64>() < keep {
            r / keep
        } else {
            0.0
        }
    })
}
