//! Epoch orchestration
//!
//! Each epoch runs the training pass, then the evaluation pass, records
//! both losses and checkpoints on the configured cadence. Any failure stops
//! the run and is tagged with the epoch and phase it happened in.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::loops::EpochRunner;
use super::Phase;
use crate::config::{RandomStream, TrainConfig};
use crate::data::{BatchLoader, ImageDataset, Preprocessor};
use crate::error::Result;
use crate::flow::Flow;
use crate::optim::Optimizer;
use crate::report::{maybe_checkpoint, LossHistory, Reporter, SampleSink};

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One train and one test loss per epoch
    pub history: LossHistory,
    /// Epochs at which the checkpoint file was (over)written
    pub checkpoints: Vec<usize>,
    pub checkpoint_path: PathBuf,
}

/// Runs the full epoch loop for one configuration
pub struct Trainer<'a> {
    config: &'a TrainConfig,
    show_progress: bool,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &'a TrainConfig) -> Self {
        Self {
            config,
            show_progress: false,
        }
    }

    /// Draw an epoch progress bar on stderr
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn run<F, O, S>(
        &self,
        flow: &mut F,
        optimizer: &mut O,
        train_data: &ImageDataset,
        test_data: &ImageDataset,
        preprocessor: Preprocessor,
        sink: &mut S,
    ) -> Result<RunSummary>
    where
        F: Flow + ?Sized,
        O: Optimizer,
        S: SampleSink + ?Sized,
    {
        let config = self.config;
        let noise_seed = config.stream_seed(RandomStream::Noise);
        let shuffle_seed = config.stream_seed(RandomStream::Shuffle);
        let mut runner = EpochRunner::new(preprocessor, config.dequantize, noise_seed);
        let mut train_loader = BatchLoader::new(train_data, config.batch_size, true, shuffle_seed);
        let mut test_loader = BatchLoader::new(test_data, config.batch_size, false, None);
        let mut reporter = Reporter::from_config(config);
        let checkpoint_path = config.checkpoint_path();
        let mut checkpoints = Vec::new();

        info!(
            "Training for {} epochs: {} train batches, {} test batches per epoch",
            config.max_epochs,
            train_loader.num_batches(),
            test_loader.num_batches()
        );

        let pb = self.progress_bar();

        for epoch in 0..config.max_epochs {
            let train_loss = runner
                .run_epoch(flow, train_loader.epoch(), optimizer)
                .map_err(|e| e.during(epoch, Phase::Train))?;

            let test_loss = runner
                .run_eval(flow, test_loader.epoch(), epoch, config.sample_size, sink)
                .map_err(|e| e.during(epoch, Phase::Eval))?;

            reporter.record(train_loss, test_loss);
            info!(
                epoch,
                train_loss,
                test_loss,
                "Epoch {}: train {:.4}, test {:.4}",
                epoch,
                train_loss,
                test_loss
            );

            if maybe_checkpoint(&*flow, epoch, config.save_every, train_loss, &checkpoint_path)
                .map_err(|e| e.during(epoch, Phase::Checkpoint))?
            {
                checkpoints.push(epoch);
            }

            pb.set_message(format!("train {:.3} test {:.3}", train_loss, test_loss));
            pb.inc(1);
        }

        pb.finish_with_message("Training complete");

        let last_epoch = config.max_epochs.saturating_sub(1);
        reporter
            .finish()
            .map_err(|e| e.during(last_epoch, Phase::Report))?;
        let history = reporter.into_history();

        if let Some((train, test)) = history.train.last().zip(history.test.last()) {
            info!("Final train loss {:.4}, test loss {:.4}", train, test);
        }

        Ok(RunSummary {
            history,
            checkpoints,
            checkpoint_path,
        })
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(self.config.max_epochs as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }
}
