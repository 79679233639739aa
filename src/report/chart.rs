//! Loss curve rendering
//!
//! Draws both loss sequences against the epoch index on shared axes, under a
//! title and with a legend naming each series.

use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};

pub const CHART_WIDTH: u32 = 640;
pub const CHART_HEIGHT: u32 = 480;

const MARGIN_LEFT: u32 = 70;
const MARGIN_RIGHT: u32 = 20;
const MARGIN_TOP: u32 = 34;
const MARGIN_BOTTOM: u32 = 50;

pub const CHART_TITLE: &str = "Train/Test LL Loss";
const Y_LABEL: &str = "Loss";

pub mod colors {
    use image::Rgb;

    pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
    pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
    pub const LIGHT_GRAY: Rgb<u8> = Rgb([220, 220, 220]);
    pub const BLUE: Rgb<u8> = Rgb([31, 119, 180]);
    pub const ORANGE: Rgb<u8> = Rgb([255, 127, 14]);
}

/// One named line of a chart
#[derive(Debug, Clone, Copy)]
pub struct Series<'a> {
    pub label: &'a str,
    pub values: &'a [f64],
    pub color: Rgb<u8>,
}

/// Render the train and test loss curves and save them as a PNG
pub fn finalize_report(train: &[f64], test: &[f64], path: &Path) -> Result<()> {
    let chart = render_chart(CHART_TITLE, &[
        Series {
            label: "train loss",
            values: train,
            color: colors::BLUE,
        },
        Series {
            label: "test loss",
            values: test,
            color: colors::ORANGE,
        },
    ]);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::persistence(parent, e))?;
    }
    chart.save(path).map_err(|e| Error::persistence(path, e))?;

    info!("Saved loss curves to {}", path.display());
    Ok(())
}

#[derive(Serialize)]
struct LossRow {
    epoch: usize,
    train_loss: Option<f64>,
    test_loss: Option<f64>,
}

/// Write the loss history as `epoch,train_loss,test_loss` rows
pub fn write_loss_table(train: &[f64], test: &[f64], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::persistence(parent, e))?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| Error::persistence(path, e))?;

    for epoch in 0..train.len().max(test.len()) {
        let row = LossRow {
            epoch,
            train_loss: train.get(epoch).copied(),
            test_loss: test.get(epoch).copied(),
        };
        writer.serialize(row).map_err(|e| Error::persistence(path, e))?;
    }
    writer.flush().map_err(|e| Error::persistence(path, e))?;
    Ok(())
}

/// Plot every series on shared axes with a legend in the top-right corner
pub fn render_chart(title: &str, series: &[Series<'_>]) -> RgbImage {
    let mut img = RgbImage::from_pixel(CHART_WIDTH, CHART_HEIGHT, colors::WHITE);

    let left = MARGIN_LEFT;
    let right = CHART_WIDTH - MARGIN_RIGHT;
    let top = MARGIN_TOP;
    let bottom = CHART_HEIGHT - MARGIN_BOTTOM;

    let points = series.iter().map(|s| s.values.len()).max().unwrap_or(0);
    let (lo, hi) = value_range(series);

    // gridlines, then axes on top
    for k in 1..4 {
        let y = top + (bottom - top) * k / 4;
        draw_line(&mut img, left, y, right, y, colors::LIGHT_GRAY);
    }
    draw_line(&mut img, left, top, left, bottom, colors::BLACK);
    draw_line(&mut img, left, bottom, right, bottom, colors::BLACK);

    draw_text(&mut img, 4, top, &format_value(hi), colors::BLACK);
    draw_text(&mut img, 4, bottom - GLYPH_HEIGHT, &format_value(lo), colors::BLACK);
    draw_text(&mut img, left, bottom + 8, "0", colors::BLACK);
    let last = points.saturating_sub(1).to_string();
    let last_x = right.saturating_sub(text_width(&last));
    draw_text(&mut img, last_x, bottom + 8, &last, colors::BLACK);
    let label_x = (left + right) / 2 - text_width("epoch") / 2;
    draw_text(&mut img, label_x, bottom + 26, "epoch", colors::BLACK);
    draw_text(&mut img, 4, (top + bottom - GLYPH_HEIGHT) / 2, Y_LABEL, colors::BLACK);

    let title_x = ((left + right) / 2).saturating_sub(text_width(title) / 2);
    draw_text(&mut img, title_x, (top - GLYPH_HEIGHT) / 2, title, colors::BLACK);

    let to_pixel = |i: usize, v: f64| -> (u32, u32) {
        let fx = if points > 1 { i as f64 / (points - 1) as f64 } else { 0.5 };
        let fy = (v - lo) / (hi - lo);
        let x = left as f64 + fx * (right - left) as f64;
        let y = bottom as f64 - fy * (bottom - top) as f64;
        (x.round() as u32, y.round() as u32)
    };

    for s in series {
        let mut previous = None;
        for (i, &v) in s.values.iter().enumerate() {
            if !v.is_finite() {
                previous = None;
                continue;
            }
            let (x, y) = to_pixel(i, v);
            match previous {
                Some((px, py)) => draw_line(&mut img, px, py, x, y, s.color),
                None => draw_marker(&mut img, x, y, s.color),
            }
            previous = Some((x, y));
        }
    }

    draw_legend(&mut img, series, right, top);
    img
}

/// Shared y-range over all finite values, padded so flat series stay visible
fn value_range(series: &[Series<'_>]) -> (f64, f64) {
    let (lo, hi) = series
        .iter()
        .flat_map(|s| s.values.iter().copied())
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));

    if lo > hi {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(1e-6 * lo.abs().max(1.0));
    (lo - pad, hi + pad)
}

fn format_value(v: f64) -> String {
    if v.abs() >= 1e4 || (v != 0.0 && v.abs() < 1e-2) {
        format!("{v:.2e}")
    } else {
        format!("{v:.2}")
    }
}

fn draw_legend(img: &mut RgbImage, series: &[Series<'_>], right: u32, top: u32) {
    const SWATCH: u32 = 16;
    const ROW: u32 = GLYPH_HEIGHT + 8;

    let text = series.iter().map(|s| text_width(s.label)).max().unwrap_or(0);
    let width = SWATCH + 6 + text + 12;
    let height = ROW * series.len() as u32 + 6;
    let x0 = right.saturating_sub(width + 6);
    let y0 = top + 6;

    fill_rect(img, x0, y0, width, height, colors::WHITE);
    draw_line(img, x0, y0, x0 + width, y0, colors::LIGHT_GRAY);
    draw_line(img, x0, y0 + height, x0 + width, y0 + height, colors::LIGHT_GRAY);
    draw_line(img, x0, y0, x0, y0 + height, colors::LIGHT_GRAY);
    draw_line(img, x0 + width, y0, x0 + width, y0 + height, colors::LIGHT_GRAY);

    for (k, s) in series.iter().enumerate() {
        let y = y0 + 6 + ROW * k as u32;
        fill_rect(img, x0 + 6, y + GLYPH_HEIGHT / 2 - 1, SWATCH, 3, s.color);
        draw_text(img, x0 + 6 + SWATCH + 6, y, s.label, colors::BLACK);
    }
}

fn fill_rect(img: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    for py in y..(y + height).min(img.height()) {
        for px in x..(x + width).min(img.width()) {
            img.put_pixel(px, py, color);
        }
    }
}

fn draw_marker(img: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    fill_rect(img, x.saturating_sub(1), y.saturating_sub(1), 3, 3, color);
}

/// Bresenham line, clipped to the image
fn draw_line(img: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32, color: Rgb<u8>) {
    let dx = (x2 as i64 - x1 as i64).abs();
    let dy = (y2 as i64 - y1 as i64).abs();
    let sx = if x1 < x2 { 1 } else { -1 };
    let sy = if y1 < y2 { 1 } else { -1 };
    let mut err = dx - dy;

    let (mut x, mut y) = (x1 as i64, y1 as i64);
    loop {
        if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
            img.put_pixel(x as u32, y as u32, color);
        }
        if x == x2 as i64 && y == y2 as i64 {
            break;
        }
        let e2 = 2 * err;
        if e2 > -dy {
            err -= dy;
            x += sx;
        }
        if e2 < dx {
            err += dx;
            y += sy;
        }
    }
}

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;

/// 5x7 bitmap rows, most significant of the low five bits leftmost
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '+' => [0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00],
        '/' => [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'a' => [0x00, 0x00, 0x0E, 0x01, 0x0F, 0x11, 0x0F],
        'c' => [0x00, 0x00, 0x0E, 0x10, 0x10, 0x11, 0x0E],
        'e' => [0x00, 0x00, 0x0E, 0x11, 0x1F, 0x10, 0x0E],
        'h' => [0x10, 0x10, 0x16, 0x19, 0x11, 0x11, 0x11],
        'i' => [0x04, 0x00, 0x0C, 0x04, 0x04, 0x04, 0x0E],
        'l' => [0x0C, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'n' => [0x00, 0x00, 0x16, 0x19, 0x11, 0x11, 0x11],
        'o' => [0x00, 0x00, 0x0E, 0x11, 0x11, 0x11, 0x0E],
        'p' => [0x00, 0x00, 0x1E, 0x11, 0x1E, 0x10, 0x10],
        'r' => [0x00, 0x00, 0x16, 0x19, 0x10, 0x10, 0x10],
        's' => [0x00, 0x00, 0x0E, 0x10, 0x0E, 0x01, 0x1E],
        't' => [0x08, 0x08, 0x1C, 0x08, 0x08, 0x09, 0x06],
        _ => [0x00; 7],
    }
}

fn text_width(text: &str) -> u32 {
    text.chars().count() as u32 * GLYPH_ADVANCE
}

fn draw_text(img: &mut RgbImage, x: u32, y: u32, text: &str, color: Rgb<u8>) {
    for (k, c) in text.chars().enumerate() {
        let gx = x + k as u32 * GLYPH_ADVANCE;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (0x10 >> col) != 0 {
                    let (px, py) = (gx + col, y + row as u32);
                    if px < img.width() && py < img.height() {
                        img.put_pixel(px, py, color);
                    }
                }
            }
        }
    }
}
