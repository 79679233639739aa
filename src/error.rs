//! Error types for the NICE training library

use std::path::PathBuf;

use thiserror::Error;

use crate::flow::Mode;
use crate::training::Phase;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed cause of a failed artifact write
pub type PersistSource = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// A run parameter is out of range or names an unknown variant
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Dataset identifier is not one of the supported datasets
    #[error("Unsupported dataset: {0}")]
    UnsupportedDataset(String),

    /// A loop was handed a data source with no batches
    #[error("{phase} data source yielded no batches")]
    EmptyEpoch { phase: Phase },

    /// A data source yielded a batch without examples
    #[error("{phase} batch {batch} contains no examples")]
    EmptyBatch { phase: Phase, batch: usize },

    /// Loss became NaN or infinite
    #[error("Non-finite {phase} loss {loss} at batch {batch}")]
    NumericalInstability { phase: Phase, batch: usize, loss: f64 },

    /// Batch width does not match the image size
    #[error("Shape mismatch: expected {expected} values per example, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Operation is not allowed in the flow's current mode
    #[error("{operation} is not allowed in {mode} mode")]
    ModeViolation { operation: &'static str, mode: Mode },

    /// Any other failure reported by the flow model
    #[error("Flow model error: {0}")]
    Flow(String),

    /// Image and label counts disagree
    #[error("{images} images but {labels} labels")]
    LabelCountMismatch { images: usize, labels: usize },

    /// Dataset file missing or malformed
    #[error("Dataset file {}: {reason}", path.display())]
    Dataset { path: PathBuf, reason: String },

    /// Checkpoint, image or table could not be written
    #[error("Failed to persist {}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: PersistSource,
    },

    /// A failure annotated with where in the run it happened
    #[error("Epoch {epoch} failed during {phase} phase")]
    Run {
        epoch: usize,
        phase: Phase,
        #[source]
        source: Box<Error>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a persistence failure for `path`
    pub fn persistence(path: impl Into<PathBuf>, source: impl Into<PersistSource>) -> Self {
        Error::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Annotate this error with the epoch and phase it occurred in
    pub fn during(self, epoch: usize, phase: Phase) -> Self {
        Error::Run {
            epoch,
            phase,
            source: Box::new(self),
        }
    }

    /// Phase recorded by [`Error::during`], if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Run { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Innermost error, skipping run annotations
    pub fn root(&self) -> &Error {
        match self {
            Error::Run { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_during_keeps_root_cause() {
        let err = Error::EmptyEpoch { phase: Phase::Eval }.during(3, Phase::Eval);

        assert_eq!(err.phase(), Some(Phase::Eval));
        assert!(matches!(err.root(), Error::EmptyEpoch { .. }));
        assert_eq!(err.to_string(), "Epoch 3 failed during eval phase");
    }

    #[test]
    fn test_persistence_message_names_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::persistence("models/mnist.bin", io);

        assert!(err.to_string().contains("models/mnist.bin"));
    }
}
