//! IDX file reader
//!
//! MNIST and Fashion-MNIST ship as big-endian IDX files: a magic number,
//! one `u32` per dimension, then raw `u8` values.

use std::fs;
use std::path::Path;

use ndarray::Array2;

use crate::config::ImageShape;
use crate::error::{Error, Result};

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

fn malformed(path: &Path, reason: impl Into<String>) -> Error {
    Error::Dataset {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let word = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| malformed(path, e.to_string()))
}

/// Read an image file into an `(n, height * width)` array scaled to `[0, 1]`
pub fn read_images(path: &Path, shape: ImageShape) -> Result<Array2<f64>> {
    let bytes = read_file(path)?;
    parse_images(&bytes, shape).map_err(|reason| malformed(path, reason))
}

/// Read a label file
pub fn read_labels(path: &Path) -> Result<Vec<u8>> {
    let bytes = read_file(path)?;
    parse_labels(&bytes).map_err(|reason| malformed(path, reason))
}

fn parse_images(bytes: &[u8], shape: ImageShape) -> std::result::Result<Array2<f64>, String> {
    let header = |offset| read_u32(bytes, offset).ok_or_else(|| "truncated header".to_string());

    let magic = header(0)?;
    if magic != IMAGES_MAGIC {
        return Err(format!("bad image magic number {magic:#010x}"));
    }
    let count = header(4)? as usize;
    let rows = header(8)? as usize;
    let cols = header(12)? as usize;
    if rows != shape.height || cols != shape.width {
        return Err(format!(
            "images are {rows}x{cols}, expected {}x{}",
            shape.height, shape.width
        ));
    }

    let pixels = &bytes[16..];
    let expected = count * rows * cols;
    if pixels.len() != expected {
        return Err(format!("expected {expected} pixel bytes, found {}", pixels.len()));
    }

    let values = pixels.iter().map(|&p| f64::from(p) / 255.0).collect();
    Array2::from_shape_vec((count, rows * cols), values).map_err(|e| e.to_string())
}

fn parse_labels(bytes: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let magic = read_u32(bytes, 0).ok_or("truncated header")?;
    if magic != LABELS_MAGIC {
        return Err(format!("bad label magic number {magic:#010x}"));
    }
    let count = read_u32(bytes, 4).ok_or("truncated header")? as usize;

    let labels = &bytes[8..];
    if labels.len() != count {
        return Err(format!("expected {count} labels, found {}", labels.len()));
    }
    Ok(labels.to_vec())
}

/// Encode images in IDX format; the inverse of [`read_images`]
pub fn encode_images(images: &[Vec<u8>], shape: ImageShape) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16 + images.len() * shape.pixels());
    bytes.extend_from_slice(&IMAGES_MAGIC.to_be_bytes());
    bytes.extend_from_slice(&(images.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&(shape.height as u32).to_be_bytes());
    bytes.extend_from_slice(&(shape.width as u32).to_be_bytes());
    for image in images {
        bytes.extend_from_slice(image);
    }
    bytes
}

/// Encode labels in IDX format
pub fn encode_labels(labels: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + labels.len());
    bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
    bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
    bytes.extend_from_slice(labels);
    bytes
}
