//! Sample grid rendering

use std::fs;
use std::path::PathBuf;

use image::{GrayImage, Luma};
use ndarray::Array2;
use tracing::debug;

use crate::config::ImageShape;
use crate::error::{Error, Result};

/// Images per grid row
pub const GRID_ROW: usize = 8;
/// Black border between grid cells, in pixels
pub const GRID_PADDING: u32 = 2;

/// Destination for the sample batch drawn during evaluation
pub trait SampleSink {
    /// Persist one epoch's samples, given as rows of pixels in `[0, 1]`;
    /// returns where they were written
    fn write_samples(&mut self, epoch: usize, images: &Array2<f64>) -> Result<PathBuf>;
}

/// Writes each epoch's samples as one PNG grid
#[derive(Debug, Clone)]
pub struct GridWriter {
    dir: PathBuf,
    prefix: String,
    shape: ImageShape,
}

impl GridWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, shape: ImageShape) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            shape,
        }
    }

    /// `{dir}/{prefix}_epoch{epoch}.png`
    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}_epoch{}.png", self.prefix, epoch))
    }
}

impl SampleSink for GridWriter {
    fn write_samples(&mut self, epoch: usize, images: &Array2<f64>) -> Result<PathBuf> {
        let grid = make_grid(images, self.shape, GRID_ROW)?;
        let path = self.path_for(epoch);

        fs::create_dir_all(&self.dir).map_err(|e| Error::persistence(&self.dir, e))?;
        grid.save(&path).map_err(|e| Error::persistence(&path, e))?;

        debug!("Wrote {} samples to {}", images.nrows(), path.display());
        Ok(path)
    }
}

/// Tile images into a grid of `per_row` columns with black padding around
/// every cell. Values are clamped to `[0, 1]`.
pub fn make_grid(images: &Array2<f64>, shape: ImageShape, per_row: usize) -> Result<GrayImage> {
    if images.ncols() != shape.pixels() {
        return Err(Error::ShapeMismatch {
            expected: shape.pixels(),
            actual: images.ncols(),
        });
    }

    let count = images.nrows();
    let cols = per_row.min(count).max(1);
    let rows = count.div_ceil(cols).max(1);
    let cell_w = shape.width as u32 + GRID_PADDING;
    let cell_h = shape.height as u32 + GRID_PADDING;

    let mut grid = GrayImage::new(
        cols as u32 * cell_w + GRID_PADDING,
        rows as u32 * cell_h + GRID_PADDING,
    );

    for (k, image) in images.outer_iter().enumerate() {
        let x0 = (k % cols) as u32 * cell_w + GRID_PADDING;
        let y0 = (k / cols) as u32 * cell_h + GRID_PADDING;
        for (p, &value) in image.iter().enumerate() {
            let (y, x) = ((p / shape.width) as u32, (p % shape.width) as u32);
            let level = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
            grid.put_pixel(x0 + x, y0 + y, Luma([level]));
        }
    }

    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: ImageShape = ImageShape { height: 2, width: 3 };

    #[test]
    fn test_grid_dimensions() {
        let images = Array2::from_elem((10, 6), 0.5);
        let grid = make_grid(&images, TINY, 8).unwrap();

        // 8 columns of 3 + 2 padding, 2 rows of 2 + 2 padding
        assert_eq!(grid.dimensions(), (8 * 5 + 2, 2 * 4 + 2));
    }

    #[test]
    fn test_grid_narrower_than_row() {
        let grid = make_grid(&Array2::zeros((3, 6)), TINY, 8).unwrap();
        assert_eq!(grid.dimensions(), (3 * 5 + 2, 4 + 2));
    }

    #[test]
    fn test_grid_places_pixels_and_clamps() {
        let mut images = Array2::zeros((2, 6));
        images[[1, 4]] = 7.0;
        let grid = make_grid(&images, TINY, 8).unwrap();

        // second image, row 1, column 1
        assert_eq!(grid.get_pixel(5 + 2 + 1, 2 + 1), &Luma([255]));
        assert_eq!(grid.get_pixel(0, 0), &Luma([0]));
    }

    #[test]
    fn test_grid_rejects_wrong_width() {
        assert!(make_grid(&Array2::zeros((1, 5)), TINY, 8).is_err());
    }

    #[test]
    fn test_writer_saves_png() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = GridWriter::new(dir.path().join("samples"), "mnist_sampled", TINY);

        let path = writer.write_samples(4, &Array2::from_elem((3, 6), 0.25)).unwrap();

        assert!(path.ends_with("mnist_sampled_epoch4.png"));
        let loaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(loaded.dimensions(), (17, 6));
    }
}
