//! End-to-end behaviour of the training and evaluation loops

use std::path::PathBuf;

use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, Ix1};
use nice_flow::data::{Batch, ImageDataset, Preprocessor};
use nice_flow::flow::{snapshot, Param, ParamSlot, Parameters};
use nice_flow::{
    Adam, CouplingKind, DatasetKind, EpochRunner, Error, Flow, LatentKind, MaskParity, Mode, Nice,
    NiceConfig, Phase, SampleSink, TrainConfig, Trainer,
};

const DIM: usize = 28 * 28;

/// How the mock assigns log-densities
#[derive(Clone, Copy)]
enum Density {
    Constant(f64),
    /// Negative sum of each preprocessed row
    RowSum,
    NotANumber,
}

/// Scripted flow that records how the loops drive it
struct MockFlow {
    density: Density,
    weight: Param<Ix1>,
    mode: Mode,
    log_density_calls: usize,
    backward_calls: usize,
    sample_requests: Vec<usize>,
}

impl MockFlow {
    fn new(density: Density) -> Self {
        Self {
            density,
            weight: Param::new(Array1::zeros(3)),
            mode: Mode::Inference,
            log_density_calls: 0,
            backward_calls: 0,
            sample_requests: Vec::new(),
        }
    }
}

impl Parameters for MockFlow {
    fn visit_params(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
        visitor(self.weight.slot());
    }
}

impl Flow for MockFlow {
    fn log_density(&mut self, batch: &Array2<f64>) -> nice_flow::Result<Array1<f64>> {
        self.log_density_calls += 1;
        Ok(match self.density {
            Density::Constant(c) => Array1::from_elem(batch.nrows(), c),
            Density::RowSum => batch.rows().into_iter().map(|row| -row.sum()).collect(),
            Density::NotANumber => Array1::from_elem(batch.nrows(), f64::NAN),
        })
    }

    fn backward(&mut self, grad_log_density: &Array1<f64>) -> nice_flow::Result<()> {
        if self.mode != Mode::Training {
            return Err(Error::ModeViolation {
                operation: "backward",
                mode: self.mode,
            });
        }
        self.backward_calls += 1;
        self.weight.accumulate(Array1::from_elem(3, grad_log_density.sum()));
        Ok(())
    }

    fn sample(&mut self, n: usize) -> nice_flow::Result<Array2<f64>> {
        if self.mode != Mode::Inference {
            return Err(Error::ModeViolation {
                operation: "sampling",
                mode: self.mode,
            });
        }
        self.sample_requests.push(n);
        Ok(Array2::zeros((n, DIM)))
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn export_state(&self) -> nice_flow::Result<Vec<u8>> {
        Ok(self.weight.value.iter().flat_map(|w| w.to_le_bytes()).collect())
    }
}

/// Sink that only remembers what it was handed
#[derive(Default)]
struct RecordingSink {
    writes: Vec<(usize, usize)>,
    fail: bool,
}

impl SampleSink for RecordingSink {
    fn write_samples(&mut self, epoch: usize, images: &Array2<f64>) -> nice_flow::Result<PathBuf> {
        if self.fail {
            let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
            return Err(Error::persistence("samples/grid.png", io));
        }
        self.writes.push((epoch, images.nrows()));
        Ok(PathBuf::from(format!("grid_epoch{epoch}.png")))
    }
}

fn batch(rows: usize, seed: usize) -> Batch {
    Batch {
        images: Array2::from_shape_fn((rows, DIM), |(i, j)| ((i * 31 + j * 7 + seed * 13) % 256) as f64 / 255.0),
        labels: vec![0; rows],
    }
}

fn runner() -> EpochRunner {
    EpochRunner::new(Preprocessor::new(DatasetKind::Mnist), false, Some(0))
}

fn dataset(rows: usize) -> ImageDataset {
    let images = Array2::from_shape_fn((rows, DIM), |(i, j)| ((i * 17 + j) % 256) as f64 / 255.0);
    ImageDataset::new(images, vec![0; rows], DatasetKind::Mnist.image_shape()).unwrap()
}

#[test]
fn test_epoch_loss_is_mean_of_batch_losses_in_any_order() {
    let batches = vec![batch(2, 0), batch(5, 1), batch(3, 2), batch(4, 3)];
    let preprocessor = Preprocessor::new(DatasetKind::Mnist);
    let expected: f64 = batches
        .iter()
        .map(|b| {
            let x = preprocessor.forward(&b.images).unwrap();
            x.rows().into_iter().map(|row| row.sum()).sum::<f64>() / b.len() as f64
        })
        .sum::<f64>()
        / batches.len() as f64;

    let mut optimizer = Adam::new(1e-3, (0.9, 0.999), 1e-4);
    let mut flow = MockFlow::new(Density::RowSum);
    let forward = runner().run_epoch(&mut flow, batches.clone(), &mut optimizer).unwrap();

    let mut reversed = batches;
    reversed.reverse();
    let mut flow = MockFlow::new(Density::RowSum);
    let backward = runner().run_epoch(&mut flow, reversed, &mut optimizer).unwrap();

    assert_abs_diff_eq!(forward, expected, epsilon = 1e-9);
    assert_abs_diff_eq!(backward, expected, epsilon = 1e-9);
}

#[test]
fn test_constant_density_gives_exact_loss() {
    let mut flow = MockFlow::new(Density::Constant(-2.0));
    let mut optimizer = Adam::new(1e-3, (0.9, 0.999), 1e-4);

    let loss = runner()
        .run_epoch(&mut flow, vec![batch(1, 0), batch(7, 1), batch(3, 2)], &mut optimizer)
        .unwrap();

    assert_eq!(loss, 2.0);
    assert_eq!(flow.backward_calls, 3);
    assert_eq!(optimizer.steps(), 3);
    assert_eq!(flow.mode(), Mode::Training);
}

#[test]
fn test_empty_sources_fail() {
    let mut flow = MockFlow::new(Density::Constant(-1.0));
    let mut optimizer = Adam::new(1e-3, (0.9, 0.999), 1e-4);
    let mut sink = RecordingSink::default();

    let err = runner().run_epoch(&mut flow, Vec::new(), &mut optimizer).unwrap_err();
    assert!(matches!(err, Error::EmptyEpoch { phase: Phase::Train }));

    let err = runner().run_eval(&mut flow, Vec::new(), 0, 4, &mut sink).unwrap_err();
    assert!(matches!(err, Error::EmptyEpoch { phase: Phase::Eval }));
}

#[test]
fn test_zero_row_batch_rejected() {
    let mut flow = MockFlow::new(Density::Constant(-1.0));
    let mut optimizer = Adam::new(1e-3, (0.9, 0.999), 1e-4);

    let err = runner()
        .run_epoch(&mut flow, vec![batch(2, 0), batch(0, 1)], &mut optimizer)
        .unwrap_err();
    assert!(matches!(err, Error::EmptyBatch { phase: Phase::Train, batch: 1 }));
}

#[test]
fn test_non_finite_loss_is_fatal() {
    let mut flow = MockFlow::new(Density::NotANumber);
    let mut optimizer = Adam::new(1e-3, (0.9, 0.999), 1e-4);

    let err = runner().run_epoch(&mut flow, vec![batch(2, 0)], &mut optimizer).unwrap_err();
    assert!(matches!(err, Error::NumericalInstability { phase: Phase::Train, batch: 0, .. }));
    assert_eq!(flow.backward_calls, 0);
}

#[test]
fn test_eval_requests_samples_and_writes_one_grid() {
    let mut flow = MockFlow::new(Density::Constant(-3.0));
    let mut sink = RecordingSink::default();

    let loss = runner()
        .run_eval(&mut flow, vec![batch(4, 0), batch(2, 1)], 7, 16, &mut sink)
        .unwrap();

    assert_eq!(loss, 3.0);
    assert_eq!(flow.sample_requests, vec![16]);
    assert_eq!(sink.writes, vec![(7, 16)]);
    assert_eq!(flow.backward_calls, 0);
    assert_eq!(flow.mode(), Mode::Inference);
}

#[test]
fn test_eval_without_samples_skips_grid() {
    let mut flow = MockFlow::new(Density::Constant(-1.0));
    let mut sink = RecordingSink::default();

    runner().run_eval(&mut flow, vec![batch(2, 0)], 0, 0, &mut sink).unwrap();

    assert!(flow.sample_requests.is_empty());
    assert!(sink.writes.is_empty());
}

#[test]
fn test_grid_failure_keeps_eval_loss() {
    let mut flow = MockFlow::new(Density::Constant(-1.5));
    let mut sink = RecordingSink {
        fail: true,
        ..RecordingSink::default()
    };

    let loss = runner().run_eval(&mut flow, vec![batch(3, 0)], 2, 8, &mut sink).unwrap();
    assert_eq!(loss, 1.5);
}

fn small_nice(kind: CouplingKind) -> Nice {
    let config = NiceConfig {
        dataset: None,
        dim: DIM,
        coupling: 2,
        mid_dim: 8,
        hidden: 1,
        coupling_kind: kind,
        mask: MaskParity::Even,
        latent: LatentKind::Logistic,
        dropout: 0.1,
        levels: 256.0,
    };
    Nice::new(config, Some(3)).unwrap()
}

#[test]
fn test_eval_leaves_parameters_bit_identical() {
    for kind in [CouplingKind::Additive, CouplingKind::Affine] {
        let mut flow = small_nice(kind);
        let mut optimizer = Adam::new(1e-2, (0.9, 0.999), 1e-4);
        let mut runner = runner();
        // move parameters off their initial values first
        runner.run_epoch(&mut flow, vec![batch(4, 0), batch(4, 1)], &mut optimizer).unwrap();

        for sample_count in [0, 5] {
            let before = snapshot(&mut flow);
            let mut sink = RecordingSink::default();
            runner
                .run_eval(&mut flow, vec![batch(3, 2), batch(2, 3)], 1, sample_count, &mut sink)
                .unwrap();
            assert_eq!(before, snapshot(&mut flow));
        }
    }
}

#[test]
fn test_training_reduces_nice_loss() {
    let mut flow = small_nice(CouplingKind::Additive);
    let mut optimizer = Adam::new(1e-2, (0.9, 0.999), 1e-4);
    let mut runner = runner();
    let batches: Vec<Batch> = (0..4).map(|k| batch(8, k)).collect();

    let first = runner.run_epoch(&mut flow, batches.clone(), &mut optimizer).unwrap();
    let mut last = first;
    for _ in 0..10 {
        last = runner.run_epoch(&mut flow, batches.clone(), &mut optimizer).unwrap();
    }

    assert!(last < first, "loss went from {first} to {last}");
}

fn run_config(dir: &std::path::Path, epochs: usize, cadence: f64) -> TrainConfig {
    TrainConfig {
        output_dir: dir.to_path_buf(),
        batch_size: 4,
        max_epochs: epochs,
        sample_size: 2,
        save_every: cadence,
        dequantize: false,
        seed: Some(9),
        ..TrainConfig::default()
    }
}

#[test]
fn test_run_checkpoints_on_cadence_and_records_every_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path(), 12, 5.0);
    let mut flow = MockFlow::new(Density::Constant(-2.0));
    let mut optimizer = Adam::from_config(&config);
    let mut sink = RecordingSink::default();

    let summary = Trainer::new(&config)
        .run(
            &mut flow,
            &mut optimizer,
            &dataset(10),
            &dataset(6),
            Preprocessor::new(DatasetKind::Mnist),
            &mut sink,
        )
        .unwrap();

    assert_eq!(summary.checkpoints, vec![0, 5, 10]);
    assert_eq!(summary.history.train.len(), 12);
    assert_eq!(summary.history.test.len(), 12);
    assert!(summary.history.train.iter().all(|&l| l == 2.0));
    assert_eq!(sink.writes.len(), 12);
    assert_eq!(sink.writes.iter().map(|w| w.0).collect::<Vec<_>>(), (0..12).collect::<Vec<_>>());

    assert!(summary.checkpoint_path.exists());
    assert!(config.loss_chart_path().exists());
    assert!(config.loss_table_path().exists());
    // 10 train examples in batches of 4
    assert_eq!(flow.backward_calls, 12 * 3);
}

#[test]
fn test_run_failure_names_epoch_and_phase() {
    let dir = tempfile::tempdir().unwrap();
    let config = run_config(dir.path(), 3, 1.0);
    let mut flow = MockFlow::new(Density::NotANumber);
    let mut optimizer = Adam::from_config(&config);

    let err = Trainer::new(&config)
        .run(
            &mut flow,
            &mut optimizer,
            &dataset(4),
            &dataset(4),
            Preprocessor::new(DatasetKind::Mnist),
            &mut RecordingSink::default(),
        )
        .unwrap_err();

    assert_eq!(err.phase(), Some(Phase::Train));
    assert!(matches!(err.root(), Error::NumericalInstability { .. }));
    assert!(err.to_string().contains("Epoch 0"));
    assert!(!config.loss_chart_path().exists());
}

#[test]
fn test_checkpoint_restores_nice_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig {
        coupling: 2,
        mid_dim: 8,
        hidden: 1,
        coupling_kind: CouplingKind::Affine,
        ..run_config(dir.path(), 2, 1.0)
    };
    let mut flow = Nice::new(NiceConfig::from_train_config(&config), Some(4)).unwrap();
    let mut optimizer = Adam::from_config(&config);

    let summary = Trainer::new(&config)
        .run(
            &mut flow,
            &mut optimizer,
            &dataset(8),
            &dataset(4),
            Preprocessor::new(DatasetKind::Mnist),
            &mut RecordingSink::default(),
        )
        .unwrap();
    assert_eq!(summary.checkpoints, vec![0, 1]);

    let mut restored = Nice::load(&summary.checkpoint_path, Some(0)).unwrap();
    assert_eq!(snapshot(&mut restored), snapshot(&mut flow));
}

#[test]
fn test_preprocessor_round_trip_for_every_dataset() {
    for kind in [DatasetKind::Mnist, DatasetKind::FashionMnist] {
        let images = batch(3, 5).images;
        let preprocessor = Preprocessor::fit(kind, &images).unwrap();

        let restored = preprocessor.reverse(&preprocessor.forward(&images).unwrap()).unwrap();
        for (a, b) in images.iter().zip(restored.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }
}
