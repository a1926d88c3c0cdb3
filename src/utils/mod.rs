use burn::prelude::*;
use image::{Rgb, RgbImage};
use std::path::Path;
use tracing::warn;

use crate::error::{GanError, GanResult};
use crate::model::constants::CHANNELS;

fn denormalize(val: f32) -> u8 {
    // Reversing the normalization: (val + 1.0) * 127.5
    ((val + 1.0) * 127.5).clamp(0.0, 255.0) as u8
}

/// Converts one planar CHW image in [-1, 1] to RGB.
pub fn chw_vec_to_image(data: &[f32], height: usize, width: usize) -> Option<RgbImage> {
    let expected_len = width * height * CHANNELS;
    if data.len() != expected_len {
        warn!(
            "Mismatched data length. Expected {}, got {}.",
            expected_len,
            data.len()
        );
        return None;
    }

    let plane = width * height;
    let raw_pixels: Vec<u8> = (0..plane)
        .flat_map(|i| (0..CHANNELS).map(move |c| denormalize(data[c * plane + i])))
        .collect();

    RgbImage::from_raw(width as u32, height as u32, raw_pixels)
}

/// Tiles a batch of CHW images row-major into a `rows x cols` grid. Cells
/// without a sample stay black.
pub fn image_grid(
    data: &[f32],
    rows: usize,
    cols: usize,
    height: usize,
    width: usize,
) -> Option<RgbImage> {
    let item_len = CHANNELS * height * width;
    if item_len == 0 || data.len() % item_len != 0 || data.len() / item_len > rows * cols {
        return None;
    }

    let mut grid = RgbImage::from_pixel((cols * width) as u32, (rows * height) as u32, Rgb([0, 0, 0]));
    for (k, item) in data.chunks_exact(item_len).enumerate() {
        let tile = chw_vec_to_image(item, height, width)?;
        let x0 = ((k % cols) * width) as u32;
        let y0 = ((k / cols) * height) as u32;
        for (x, y, pixel) in tile.enumerate_pixels() {
            grid.put_pixel(x0 + x, y0 + y, *pixel);
        }
    }
    Some(grid)
}

pub fn save_image_grid<B: Backend, P: AsRef<Path>>(
    images: Tensor<B, 4>,
    rows: usize,
    cols: usize,
    path: P,
) -> GanResult<()> {
    let [_, _, height, width] = images.dims();
    let data: Vec<f32> = images
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| GanError::Dataset(format!("cannot read generated images: {e:?}")))?;

    let grid = image_grid(&data, rows, cols, height, width).ok_or_else(|| {
        GanError::Config(format!(
            "{} values do not fit a {rows}x{cols} grid of {height}x{width} images",
            data.len()
        ))
    })?;
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    grid.save(path)?;
    Ok(())
}
