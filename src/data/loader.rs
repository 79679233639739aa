//! In-memory image datasets and mini-batch iteration

use std::path::Path;

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use super::idx;
use crate::config::{DatasetKind, ImageShape};
use crate::error::{Error, Result};

/// Which half of a dataset to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_names(self) -> (&'static str, &'static str) {
        match self {
            Split::Train => ("train-images-idx3-ubyte", "train-labels-idx1-ubyte"),
            Split::Test => ("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte"),
        }
    }
}

/// A mini-batch of flattened images with their (unused) labels
#[derive(Debug, Clone)]
pub struct Batch {
    /// One row per example
    pub images: Array2<f64>,
    pub labels: Vec<u8>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.images.nrows() == 0
    }
}

/// Images of one dataset split held in memory
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Array2<f64>,
    labels: Vec<u8>,
    shape: ImageShape,
}

impl ImageDataset {
    /// Load one split of `kind` from `dir`
    pub fn load(kind: DatasetKind, dir: &Path, split: Split) -> Result<Self> {
        let (image_file, label_file) = split.file_names();
        let shape = kind.image_shape();

        let images = idx::read_images(&dir.join(image_file), shape)?;
        let labels = idx::read_labels(&dir.join(label_file))?;
        let dataset = Self::new(images, labels, shape)?;

        info!(
            "Loaded {} {:?} images of {} from {}",
            dataset.len(),
            split,
            kind,
            dir.display()
        );
        Ok(dataset)
    }

    /// Build a dataset from already-decoded arrays
    pub fn new(images: Array2<f64>, labels: Vec<u8>, shape: ImageShape) -> Result<Self> {
        if images.ncols() != shape.pixels() {
            return Err(Error::ShapeMismatch {
                expected: shape.pixels(),
                actual: images.ncols(),
            });
        }
        if labels.len() != images.nrows() {
            return Err(Error::LabelCountMismatch {
                images: images.nrows(),
                labels: labels.len(),
            });
        }
        Ok(Self {
            images,
            labels,
            shape,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn images(&self) -> &Array2<f64> {
        &self.images
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Gather the examples at `indices` into one batch
    pub fn get_batch(&self, indices: &[usize]) -> Batch {
        Batch {
            images: self.images.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// Batched iteration over a dataset, one pass per call to [`BatchLoader::epoch`]
pub struct BatchLoader<'a> {
    dataset: &'a ImageDataset,
    indices: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl<'a> BatchLoader<'a> {
    /// Create a loader; `shuffle` reorders examples before every epoch
    pub fn new(dataset: &'a ImageDataset, batch_size: usize, shuffle: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            dataset,
            indices: (0..dataset.len()).collect(),
            batch_size: batch_size.max(1),
            shuffle,
            rng,
        }
    }

    /// Get number of batches per epoch
    pub fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    /// Batches of one epoch, each example exactly once
    pub fn epoch(&mut self) -> impl Iterator<Item = Batch> + '_ {
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
        let dataset = self.dataset;
        self.indices
            .chunks(self.batch_size)
            .map(move |chunk| dataset.get_batch(chunk))
    }
}
