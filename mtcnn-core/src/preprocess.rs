//! Pyramid generation and crop-batch preparation.
//!
//! The proposal stage scans a lazily generated pyramid of progressively
//! smaller copies of the input; the refine and output stages re-crop the
//! original image around surviving boxes. Both paths feed zero-centered BGR
//! CHW tensors to their backends.

use anyhow::Result;
use image::{RgbImage, imageops::FilterType};
use ndarray::{Array3, Array4, s};

use crate::geometry::pad_map;
use crate::postprocess::BoundingBox;
use mtcnn_utils::image_utils::zero_centered_bgr_chw;

/// One rescaled, zero-centered copy of the input image.
#[derive(Debug)]
pub struct PyramidLevel {
    /// The scale this level was resized by, relative to the original image.
    pub scale: f32,
    /// Zero-centered BGR CHW pixel data.
    pub image: Array3<f32>,
}

/// Lazy, forward-only pyramid over the input image.
///
/// The first scale is `net_size / min_face_size`; each subsequent scale is
/// multiplied by `scale_factor`. Iteration stops once the resized image no
/// longer strictly exceeds `net_size` on its smaller side, so the sequence
/// is always finite for a shrinking factor. Levels are resized from the
/// original image, not from each other.
pub struct ImagePyramid<'a> {
    source: &'a RgbImage,
    scale: f32,
    scale_factor: f32,
    net_size: u32,
}

impl<'a> ImagePyramid<'a> {
    pub fn new(source: &'a RgbImage, min_face_size: u32, net_size: u32, scale_factor: f32) -> Self {
        Self {
            source,
            scale: net_size as f32 / min_face_size as f32,
            scale_factor,
            net_size,
        }
    }
}

impl Iterator for ImagePyramid<'_> {
    type Item = PyramidLevel;

    fn next(&mut self) -> Option<PyramidLevel> {
        let (width, height) = self.source.dimensions();
        let scaled_w = (width as f32 * self.scale) as u32;
        let scaled_h = (height as f32 * self.scale) as u32;
        if scaled_w.min(scaled_h) <= self.net_size {
            return None;
        }

        let resized = image::imageops::resize(self.source, scaled_w, scaled_h, FilterType::Triangle);
        let level = PyramidLevel {
            scale: self.scale,
            image: zero_centered_bgr_chw(&resized),
        };
        self.scale *= self.scale_factor;
        Some(level)
    }
}

/// Crop every box out of `image` into a zero-centered batch of
/// `size x size` tensors.
///
/// Boxes may extend past the image on any side; the out-of-bounds region is
/// zero-padded (black) before resizing, so each crop always covers exactly
/// the box's declared extent. Boxes are expected to carry integer
/// coordinates with a positive extent.
pub fn crop_batch(image: &RgbImage, boxes: &[BoundingBox], size: u32) -> Result<Array4<f32>> {
    let (image_w, image_h) = image.dimensions();
    let side = size as usize;
    let mut batch = Array4::<f32>::zeros((boxes.len(), 3, side, side));

    for (index, bbox) in boxes.iter().enumerate() {
        let map = pad_map(bbox, image_w, image_h);
        anyhow::ensure!(
            map.width > 0 && map.height > 0,
            "box {index} has no extent after rounding"
        );

        let mut canvas = RgbImage::new(map.width as u32, map.height as u32);
        let copy_w = (map.src_x1 - map.src_x0 + 1).min(map.dst_x1 - map.dst_x0 + 1);
        let copy_h = (map.src_y1 - map.src_y0 + 1).min(map.dst_y1 - map.dst_y0 + 1);
        for row in 0..copy_h.max(0) {
            for col in 0..copy_w.max(0) {
                let pixel = image.get_pixel(
                    (map.src_x0 + col) as u32,
                    (map.src_y0 + row) as u32,
                );
                canvas.put_pixel(
                    (map.dst_x0 + col) as u32,
                    (map.dst_y0 + row) as u32,
                    *pixel,
                );
            }
        }

        let resized = image::imageops::resize(&canvas, size, size, FilterType::Triangle);
        batch
            .slice_mut(s![index, .., .., ..])
            .assign(&zero_centered_bgr_chw(&resized));
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtcnn_utils::fixtures::blank_image;

    const NET_SIZE: u32 = 12;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox {
            x1,
            y1,
            x2,
            y2,
            score: 0.9,
        }
    }

    #[test]
    fn first_scale_targets_the_minimum_face() {
        let image = blank_image(100, 100);
        let mut pyramid = ImagePyramid::new(&image, 24, NET_SIZE, 0.79);
        let level = pyramid.next().expect("100px image has levels");
        assert!((level.scale - 0.5).abs() < f32::EPSILON);
        assert_eq!(level.image.dim(), (3, 50, 50));
    }

    #[test]
    fn scales_shrink_until_the_receptive_field() {
        let image = blank_image(100, 100);
        let levels: Vec<PyramidLevel> =
            ImagePyramid::new(&image, 24, NET_SIZE, 0.79).collect();
        assert!(!levels.is_empty());

        for pair in levels.windows(2) {
            assert!(pair[1].scale < pair[0].scale);
        }
        for level in &levels {
            let (_, h, w) = level.image.dim();
            assert!(h.min(w) > NET_SIZE as usize);
        }
        // The next scale after the last level would fall at or below net_size.
        let last = levels.last().unwrap();
        let next_scale = last.scale * 0.79;
        let next_side = (100.0 * next_scale) as u32;
        assert!(next_side <= NET_SIZE);
    }

    #[test]
    fn tiny_image_yields_no_levels() {
        // 20 * (12/24) = 10 <= 12: the loop body never runs.
        let image = blank_image(20, 20);
        assert_eq!(ImagePyramid::new(&image, 24, NET_SIZE, 0.79).count(), 0);
    }

    #[test]
    fn levels_are_zero_centered() {
        let image = blank_image(64, 64);
        let level = ImagePyramid::new(&image, 24, NET_SIZE, 0.79)
            .next()
            .unwrap();
        let expected = (128.0 - 127.5) / 128.0;
        assert!(level.image.iter().all(|&v| (v - expected).abs() < 1e-5));
    }

    #[test]
    fn crops_have_the_requested_shape() {
        let image = blank_image(60, 60);
        let boxes = [bbox(5.0, 5.0, 28.0, 28.0), bbox(20.0, 20.0, 43.0, 43.0)];
        let batch = crop_batch(&image, &boxes, 24).unwrap();
        assert_eq!(batch.dim(), (2, 3, 24, 24));
    }

    #[test]
    fn out_of_bounds_region_is_black_padded() {
        // A box hanging entirely off the image: every pixel comes from the
        // zero-filled canvas.
        let image = blank_image(40, 40);
        let batch = crop_batch(&image, &[bbox(100.0, 100.0, 123.0, 123.0)], 24).unwrap();
        let black = (0.0 - 127.5) / 128.0;
        assert!(batch.iter().all(|&v| (v - black).abs() < 1e-5));
    }

    #[test]
    fn interior_crop_keeps_source_values() {
        let image = blank_image(40, 40);
        let batch = crop_batch(&image, &[bbox(8.0, 8.0, 31.0, 31.0)], 24).unwrap();
        let gray = (128.0 - 127.5) / 128.0;
        assert!(batch.iter().all(|&v| (v - gray).abs() < 1e-5));
    }

    #[test]
    fn degenerate_box_is_rejected() {
        let image = blank_image(40, 40);
        let result = crop_batch(&image, &[bbox(10.0, 10.0, 5.0, 5.0)], 24);
        assert!(result.is_err());
    }
}
