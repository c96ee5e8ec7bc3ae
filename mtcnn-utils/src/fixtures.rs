//! Synthetic image generators for tests.
//!
//! The detection tests drive the cascade with small in-memory images rather
//! than binary assets checked into the repository.

use image::{Rgb, RgbImage};

/// A uniform mid-gray image with no face-like structure.
pub fn blank_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

/// A horizontal luminance ramp, useful for checking resampling behavior.
pub fn gradient_image(width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::new(width, height);
    for (x, _, pixel) in image.enumerate_pixels_mut() {
        let value = if width > 1 {
            ((x as f32 / (width - 1) as f32) * 255.0) as u8
        } else {
            0
        };
        *pixel = Rgb([value, value, value]);
    }
    image
}

/// A dark image with a bright axis-aligned block at the given rectangle.
pub fn block_image(width: u32, height: u32, rect: (u32, u32, u32, u32)) -> RgbImage {
    let (bx, by, bw, bh) = rect;
    let mut image = RgbImage::from_pixel(width, height, Rgb([10, 10, 10]));
    for y in by..(by + bh).min(height) {
        for x in bx..(bx + bw).min(width) {
            image.put_pixel(x, y, Rgb([240, 240, 240]));
        }
    }
    image
}
