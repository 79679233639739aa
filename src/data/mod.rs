//! Dataset loading, batching and preprocessing

mod idx;
mod loader;
mod preprocess;

pub use idx::{encode_images, encode_labels, read_images, read_labels};
pub use loader::{Batch, BatchLoader, ImageDataset, Split};
pub use preprocess::{Preprocessor, QUANTIZATION_LEVELS};
