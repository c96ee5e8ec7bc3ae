use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage, imageops::FilterType};
use ndarray::Array3;

/// Load an image from disk into memory.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Resize an image to the requested resolution using the provided filter.
///
/// The cascade resizes with `FilterType::Triangle`, matching OpenCV's
/// `INTER_LINEAR` resampling.
pub fn resize_image(image: &RgbImage, width: u32, height: u32, filter: FilterType) -> RgbImage {
    image::imageops::resize(image, width, height, filter)
}

/// Convert an RGB image into a BGR CHW array of raw `0..=255` values.
///
/// The memory layout is rearranged from HWC (height, width, channels) to
/// CHW (channels, height, width) with red and blue swapped, matching the
/// channel order the networks were trained on.
pub fn rgb_to_bgr_chw(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (xi, yi) = (x as usize, y as usize);
        array[(0, yi, xi)] = pixel[2] as f32; // Blue
        array[(1, yi, xi)] = pixel[1] as f32; // Green
        array[(2, yi, xi)] = pixel[0] as f32; // Red
    }
    array
}

/// Convert an RGB image into the zero-centered BGR CHW tensor the networks
/// consume: every channel value is mapped through `(v - 127.5) / 128`.
pub fn zero_centered_bgr_chw(image: &RgbImage) -> Array3<f32> {
    let mut array = rgb_to_bgr_chw(image);
    array.mapv_inplace(|v| (v - 127.5) / 128.0);
    array
}
