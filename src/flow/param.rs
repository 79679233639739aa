//! Learnable tensors and parameter traversal
//!
//! Every model exposes its tensors through [`Parameters::visit_params`] in a
//! fixed order, which is all an optimizer needs to keep per-tensor state.

use ndarray::{Array, ArrayD, ArrayViewMut, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A learnable tensor and its accumulated gradient
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "D: Dimension + Serialize",
    deserialize = "D: Dimension + Deserialize<'de>"
))]
pub struct Param<D: Dimension> {
    pub value: Array<f64, D>,
    #[serde(skip)]
    grad: Option<ArrayD<f64>>,
}

impl<D: Dimension> Param<D> {
    pub fn new(value: Array<f64, D>) -> Self {
        Self { value, grad: None }
    }

    /// Add `grad` to the accumulated gradient
    pub fn accumulate(&mut self, grad: Array<f64, D>) {
        let grad = grad.into_dyn();
        match self.grad.as_mut() {
            Some(acc) => *acc += &grad,
            None => self.grad = Some(grad),
        }
    }

    pub fn grad(&self) -> Option<&ArrayD<f64>> {
        self.grad.as_ref()
    }

    /// Dimension-erased view handed to parameter visitors
    pub fn slot(&mut self) -> ParamSlot<'_> {
        ParamSlot {
            value: self.value.view_mut().into_dyn(),
            grad: &mut self.grad,
        }
    }
}

/// Mutable access to one tensor during a parameter visit
pub struct ParamSlot<'a> {
    pub value: ArrayViewMut<'a, f64, IxDyn>,
    /// `None` until a backward pass touches the tensor
    pub grad: &'a mut Option<ArrayD<f64>>,
}

/// A model with learnable tensors
pub trait Parameters {
    /// Visit every learnable tensor, always in the same order
    fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>));
}

/// Total number of learnable scalars
pub fn parameter_count<P: Parameters + ?Sized>(model: &mut P) -> usize {
    let mut count = 0;
    model.visit_params(&mut |slot: ParamSlot<'_>| count += slot.value.len());
    count
}

/// All parameter values, flattened in visit order
pub fn snapshot<P: Parameters + ?Sized>(model: &mut P) -> Vec<f64> {
    let mut values = Vec::new();
    model.visit_params(&mut |slot: ParamSlot<'_>| values.extend(slot.value.iter().copied()));
    values
}

/// All gradients, flattened in visit order; missing gradients read as zero
pub fn gradients<P: Parameters + ?Sized>(model: &mut P) -> Vec<f64> {
    let mut values = Vec::new();
    model.visit_params(&mut |slot: ParamSlot<'_>| match slot.grad.as_ref() {
        Some(grad) => values.extend(grad.iter().copied()),
        None => values.extend(std::iter::repeat(0.0).take(slot.value.len())),
    });
    values
}

/// Overwrite all parameter values from a flat vector produced by [`snapshot`]
pub fn restore<P: Parameters + ?Sized>(model: &mut P, values: &[f64]) -> Result<()> {
    let expected = parameter_count(model);
    if expected != values.len() {
        return Err(Error::ShapeMismatch {
            expected,
            actual: values.len(),
        });
    }

    let mut offset = 0;
    model.visit_params(&mut |mut slot: ParamSlot<'_>| {
        for v in slot.value.iter_mut() {
            *v = values[offset];
            offset += 1;
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Ix1, Ix2};

    struct Pair {
        w: Param<Ix2>,
        b: Param<Ix1>,
    }

    impl Parameters for Pair {
        fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
            visitor(self.w.slot());
            visitor(self.b.slot());
        }
    }

    fn pair() -> Pair {
        Pair {
            w: Param::new(array![[1.0, 2.0], [3.0, 4.0]]),
            b: Param::new(array![5.0, 6.0]),
        }
    }

    #[test]
    fn test_snapshot_order() {
        let mut model = pair();
        assert_eq!(parameter_count(&mut model), 6);
        assert_eq!(snapshot(&mut model), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_restore_round_trip() {
        let mut model = pair();
        restore(&mut model, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(model.b.value, array![4.0, 5.0]);
        assert!(restore(&mut model, &[1.0]).is_err());
    }

    #[test]
    fn test_gradients_accumulate() {
        let mut model = pair();
        model.b.accumulate(array![1.0, 1.0]);
        model.b.accumulate(array![0.5, -1.0]);

        assert_eq!(gradients(&mut model), vec![0.0, 0.0, 0.0, 0.0, 1.5, 0.0]);
    }
}
