//! Per-epoch training and evaluation passes

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use super::Phase;
use crate::data::{Batch, Preprocessor};
use crate::error::{Error, Result};
use crate::flow::{Flow, Mode};
use crate::optim::Optimizer;
use crate::report::SampleSink;

/// Arithmetic mean of per-batch losses within one loop call
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningLoss {
    sum: f64,
    batches: usize,
}

impl RunningLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, loss: f64) {
        self.sum += loss;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Mean over the batches consumed so far, `None` before the first
    pub fn mean(&self) -> Option<f64> {
        (self.batches > 0).then(|| self.sum / self.batches as f64)
    }
}

/// Drives the training and evaluation passes of each epoch
#[derive(Debug)]
pub struct EpochRunner {
    preprocessor: Preprocessor,
    rng: StdRng,
    dequantize: bool,
}

impl EpochRunner {
    /// `dequantize` replaces bin-centre preprocessing with uniform in-bin
    /// noise during training
    pub fn new(preprocessor: Preprocessor, dequantize: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            preprocessor,
            rng,
            dequantize,
        }
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// One optimization pass over `batches`; returns the mean batch loss.
    ///
    /// The loss of a batch is its negative mean log-density, so stepping the
    /// optimizer downhill maximizes likelihood.
    pub fn run_epoch<F, O, I>(&mut self, flow: &mut F, batches: I, optimizer: &mut O) -> Result<f64>
    where
        F: Flow + ?Sized,
        O: Optimizer,
        I: IntoIterator<Item = Batch>,
    {
        flow.set_mode(Mode::Training);
        let mut running = RunningLoss::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let inputs = self.prepare(&batch, Phase::Train, index)?;
            let log_density = flow.log_density(&inputs)?;
            let loss = batch_loss(&log_density, Phase::Train, index)?;

            optimizer.zero_gradients(flow);
            let n = log_density.len() as f64;
            flow.backward(&Array1::from_elem(log_density.len(), -1.0 / n))?;
            optimizer.step(flow)?;

            running.add(loss);
        }

        let mean = running.mean().ok_or(Error::EmptyEpoch { phase: Phase::Train })?;
        debug!("Trained on {} batches, mean loss {:.4}", running.batches(), mean);
        Ok(mean)
    }

    /// Held-out pass: writes `sample_count` generated images to `sink` for
    /// `epoch`, then returns the mean batch loss over `batches`. Parameters
    /// are never touched.
    pub fn run_eval<F, S, I>(
        &mut self,
        flow: &mut F,
        batches: I,
        epoch: usize,
        sample_count: usize,
        sink: &mut S,
    ) -> Result<f64>
    where
        F: Flow + ?Sized,
        S: SampleSink + ?Sized,
        I: IntoIterator<Item = Batch>,
    {
        flow.set_mode(Mode::Inference);

        if sample_count > 0 {
            let samples = flow.sample(sample_count)?;
            let images = self.preprocessor.reverse(&samples)?;
            match sink.write_samples(epoch, &images) {
                Ok(path) => debug!("Epoch {} samples written to {}", epoch, path.display()),
                Err(e) => warn!("Could not write epoch {} samples: {}", epoch, e),
            }
        }

        let mut running = RunningLoss::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let inputs = self.prepare(&batch, Phase::Eval, index)?;
            let log_density = flow.log_density(&inputs)?;
            running.add(batch_loss(&log_density, Phase::Eval, index)?);
        }

        running.mean().ok_or(Error::EmptyEpoch { phase: Phase::Eval })
    }

    fn prepare(&mut self, batch: &Batch, phase: Phase, index: usize) -> Result<Array2<f64>> {
        if batch.is_empty() {
            return Err(Error::EmptyBatch { phase, batch: index });
        }
        if phase == Phase::Train && self.dequantize {
            self.preprocessor.dequantize(&batch.images, &mut self.rng)
        } else {
            self.preprocessor.forward(&batch.images)
        }
    }
}

/// Negative mean log-density, rejecting non-finite values
fn batch_loss(log_density: &Array1<f64>, phase: Phase, batch: usize) -> Result<f64> {
    let loss = log_density.mean().map(|m| -m).unwrap_or(f64::NAN);
    if loss.is_finite() {
        Ok(loss)
    } else {
        Err(Error::NumericalInstability { phase, batch, loss })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_running_loss_mean() {
        let mut running = RunningLoss::new();
        assert_eq!(running.mean(), None);

        running.add(1.0);
        running.add(2.0);
        running.add(6.0);
        assert_eq!(running.batches(), 3);
        assert_abs_diff_eq!(running.mean().unwrap(), 3.0);
    }

    #[test]
    fn test_batch_loss_sign() {
        let loss = batch_loss(&array![-2.0, -4.0], Phase::Train, 0).unwrap();
        assert_abs_diff_eq!(loss, 3.0);
    }

    #[test]
    fn test_batch_loss_rejects_nan() {
        let err = batch_loss(&array![-1.0, f64::NAN], Phase::Eval, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::NumericalInstability { phase: Phase::Eval, batch: 4, .. }
        ));

        assert!(batch_loss(&array![f64::NEG_INFINITY], Phase::Train, 0).is_err());
    }
}
