//! Cadence-driven model checkpoints

use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::flow::Flow;

/// Whether `epoch` falls on the save cadence (`epoch mod cadence == 0`)
pub fn should_checkpoint(epoch: usize, cadence: f64) -> bool {
    cadence > 0.0 && (epoch as f64) % cadence == 0.0
}

/// Persist the flow's parameter state to `path` when `epoch` is on the
/// cadence, overwriting any earlier checkpoint, and log the epoch's
/// training loss. Returns whether a checkpoint was written.
pub fn maybe_checkpoint<F: Flow + ?Sized>(
    flow: &F,
    epoch: usize,
    cadence: f64,
    train_loss: f64,
    path: &Path,
) -> Result<bool> {
    if !should_checkpoint(epoch, cadence) {
        return Ok(false);
    }

    let bytes = flow.export_state()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::persistence(parent, e))?;
    }
    fs::write(path, bytes).map_err(|e| Error::persistence(path, e))?;

    info!(epoch, train_loss, "Epoch {}: train loss {:.4}", epoch, train_loss);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::{Arc, Mutex};

    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;
    use crate::config::{CouplingKind, LatentKind, MaskParity};
    use crate::flow::{Nice, NiceConfig};

    type Fields = Vec<(String, String)>;

    /// Keeps the fields of every event it sees
    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<Fields>>>);

    struct FieldRecorder<'a>(&'a mut Fields);

    impl Visit for FieldRecorder<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{value:?}")));
        }
    }

    impl<S: Subscriber> Layer<S> for EventLog {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = Fields::new();
            event.record(&mut FieldRecorder(&mut fields));
            self.0.lock().unwrap().push(fields);
        }
    }

    fn field<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
        fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    fn tiny_flow() -> Nice {
        let config = NiceConfig {
            dataset: None,
            dim: 4,
            coupling: 2,
            mid_dim: 3,
            hidden: 1,
            coupling_kind: CouplingKind::Additive,
            mask: MaskParity::Even,
            latent: LatentKind::Normal,
            dropout: 0.0,
            levels: 1.0,
        };
        Nice::new(config, Some(0)).unwrap()
    }

    #[test]
    fn test_progress_line_only_on_cadence_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("flow.bin");
        let flow = tiny_flow();
        let log = EventLog::default();

        let subscriber = tracing_subscriber::registry().with(log.clone());
        let written: Vec<bool> = tracing::subscriber::with_default(subscriber, || {
            (0..12)
                .map(|epoch| {
                    let loss = 10.0 - epoch as f64 * 0.5;
                    maybe_checkpoint(&flow, epoch, 5.0, loss, &path).unwrap()
                })
                .collect()
        });

        let events = log.0.lock().unwrap();
        let progress: Vec<(&str, &str)> = events
            .iter()
            .filter_map(|f| field(f, "epoch").zip(field(f, "train_loss")))
            .collect();
        assert_eq!(progress, vec![("0", "10.0"), ("5", "7.5"), ("10", "5.0")]);

        let hits: Vec<usize> = (0..12).filter(|&e| written[e]).collect();
        assert_eq!(hits, vec![0, 5, 10]);
        assert!(path.exists());
    }

    #[test]
    fn test_cadence_five() {
        let hits: Vec<usize> = (0..12).filter(|&e| should_checkpoint(e, 5.0)).collect();
        assert_eq!(hits, vec![0, 5, 10]);
    }

    #[test]
    fn test_fractional_cadence() {
        // every epoch is a multiple of 0.5
        assert!((0..4).all(|e| should_checkpoint(e, 0.5)));

        let hits: Vec<usize> = (0..10).filter(|&e| should_checkpoint(e, 2.5)).collect();
        assert_eq!(hits, vec![0, 5]);
    }

    #[test]
    fn test_non_positive_cadence_never_fires() {
        assert!(!should_checkpoint(0, 0.0));
        assert!(!should_checkpoint(10, -5.0));
    }
}
