//! Checkpoints, sample grids and loss reporting

mod chart;
mod checkpoint;
mod grid;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::Result;

pub use chart::{colors, finalize_report, render_chart, write_loss_table, Series};
pub use checkpoint::{maybe_checkpoint, should_checkpoint};
pub use grid::{make_grid, GridWriter, SampleSink, GRID_PADDING, GRID_ROW};

/// Per-epoch train and test losses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub train: Vec<f64>,
    pub test: Vec<f64>,
}

impl LossHistory {
    /// Number of completed epochs
    pub fn len(&self) -> usize {
        self.train.len().min(self.test.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the loss history of a run and writes the final report
#[derive(Debug, Clone)]
pub struct Reporter {
    history: LossHistory,
    chart_path: PathBuf,
    table_path: PathBuf,
}

impl Reporter {
    pub fn new(chart_path: impl Into<PathBuf>, table_path: impl Into<PathBuf>) -> Self {
        Self {
            history: LossHistory::default(),
            chart_path: chart_path.into(),
            table_path: table_path.into(),
        }
    }

    /// Reporter writing to the run's configured artifact paths
    pub fn from_config(config: &TrainConfig) -> Self {
        Self::new(config.loss_chart_path(), config.loss_table_path())
    }

    /// Append one epoch's losses
    pub fn record(&mut self, train_loss: f64, test_loss: f64) {
        self.history.train.push(train_loss);
        self.history.test.push(test_loss);
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    /// Write the loss table, then render the chart. The table goes first so
    /// a failed chart never costs the recorded values.
    pub fn finish(&self) -> Result<()> {
        write_loss_table(&self.history.train, &self.history.test, &self.table_path)?;
        finalize_report(&self.history.train, &self.history.test, &self.chart_path)
    }

    pub fn into_history(self) -> LossHistory {
        self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = Reporter::new(dir.path().join("loss.png"), dir.path().join("loss.csv"));

        reporter.record(3.0, 3.5);
        reporter.record(2.0, 2.5);
        assert_eq!(reporter.history().len(), 2);

        reporter.finish().unwrap();
        assert!(dir.path().join("loss.png").exists());
        assert!(dir.path().join("loss.csv").exists());

        let history = reporter.into_history();
        assert_eq!(history.train, vec![3.0, 2.0]);
        assert_eq!(history.test, vec![3.5, 2.5]);
    }

    #[test]
    fn test_table_survives_chart_failure() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the chart file should go
        let chart = dir.path().join("loss.png");
        std::fs::create_dir(&chart).unwrap();
        let mut reporter = Reporter::new(&chart, dir.path().join("loss.csv"));
        reporter.record(3.0, 3.5);

        assert!(reporter.finish().is_err());

        let table = std::fs::read_to_string(dir.path().join("loss.csv")).unwrap();
        assert_eq!(table.lines().collect::<Vec<_>>(), vec!["epoch,train_loss,test_loss", "0,3.0,3.5"]);
        assert_eq!(reporter.history().len(), 1);
    }
}
