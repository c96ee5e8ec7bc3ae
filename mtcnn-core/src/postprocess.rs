//! Candidate decoding, suppression, and calibration.
//!
//! This module hosts the coordinate-level machinery of the cascade: turning
//! a proposal-stage score map back into image-space boxes, greedy
//! non-maximum suppression, and regression-based box refinement.
//!
//! All widths, heights, and areas use inclusive pixel counting
//! (`x2 - x1 + 1`), the convention the cascade networks were trained
//! against; changing it changes which boxes survive suppression.

use std::cmp::Ordering;

use anyhow::Result;
use ndarray::{Array2, Array3};

/// Sampling stride of the proposal network's score map, in input pixels.
const MAP_STRIDE: usize = 2;
/// Receptive field of one score-map cell, in input pixels.
const CELL_SIZE: usize = 12;

/// Axis-aligned rectangle in original-image pixel coordinates, with the
/// confidence score attached to it.
///
/// `x2 >= x1` and `y2 >= y1` hold after clipping and calibration; raw
/// regression output may violate them transiently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Confidence in `[0, 1]`.
    pub score: f32,
}

impl BoundingBox {
    /// Box width under inclusive pixel counting.
    pub fn width(&self) -> f32 {
        self.x2 - self.x1 + 1.0
    }

    /// Box height under inclusive pixel counting.
    pub fn height(&self) -> f32 {
        self.y2 - self.y1 + 1.0
    }

    /// Box area under inclusive pixel counting.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// The same box with every coordinate rounded to the nearest integer.
    pub fn rounded(&self) -> Self {
        Self {
            x1: self.x1.round(),
            y1: self.y1.round(),
            x2: self.x2.round(),
            y2: self.y2.round(),
            score: self.score,
        }
    }
}

/// Fractional coordinate offsets produced by a stage's regressor, relative
/// to the box's width and height.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegressionOffset {
    pub dx1: f32,
    pub dy1: f32,
    pub dx2: f32,
    pub dy2: f32,
}

/// A decoded box paired with its raw, not-yet-applied regression offsets.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub offsets: RegressionOffset,
}

/// Facial landmark coordinate in image space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
}

/// A final detection: calibrated box, five landmarks, output-stage score.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Right eye, left eye, nose tip, right mouth corner, left mouth corner.
    pub landmarks: [Landmark; 5],
    pub score: f32,
}

/// Which denominator the suppression overlap uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionMode {
    /// Intersection over union (IoU).
    Union,
    /// Intersection over the smaller box's area.
    Min,
}

/// Decode a proposal-stage score map into image-space candidates.
///
/// Every cell of `scores` whose value exceeds `threshold` is back-projected
/// into original-image coordinates through the map stride and the cell's
/// receptive field, divided by the pyramid `scale` the map was computed at:
///
/// ```text
/// x1 = round(stride * col / scale)        y1 = round(stride * row / scale)
/// x2 = round((stride * col + cell) / scale)
/// y2 = round((stride * row + cell) / scale)
/// ```
///
/// The cell's score and its four raw regression values are attached
/// unmodified. An empty result is the normal outcome at most pyramid
/// levels, not an error.
pub fn generate_candidates(
    scores: &Array2<f32>,
    regressions: &Array3<f32>,
    scale: f32,
    threshold: f32,
) -> Result<Vec<Candidate>> {
    let (rows, cols) = scores.dim();
    anyhow::ensure!(
        regressions.dim() == (rows, cols, 4),
        "regression map shape {:?} does not match score map {}x{}",
        regressions.dim(),
        rows,
        cols
    );

    let mut candidates = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let score = scores[(row, col)];
            if score <= threshold {
                continue;
            }
            let bbox = BoundingBox {
                x1: ((MAP_STRIDE * col) as f32 / scale).round(),
                y1: ((MAP_STRIDE * row) as f32 / scale).round(),
                x2: ((MAP_STRIDE * col + CELL_SIZE) as f32 / scale).round(),
                y2: ((MAP_STRIDE * row + CELL_SIZE) as f32 / scale).round(),
                score,
            };
            let offsets = RegressionOffset {
                dx1: regressions[(row, col, 0)],
                dy1: regressions[(row, col, 1)],
                dx2: regressions[(row, col, 2)],
                dy2: regressions[(row, col, 3)],
            };
            candidates.push(Candidate { bbox, offsets });
        }
    }
    Ok(candidates)
}

/// Greedy non-maximum suppression.
///
/// Indices are stable-sorted by descending score (ties keep input order),
/// then the best remaining box is emitted and every remaining box whose
/// overlap with it exceeds `threshold` is dropped, until none remain.
/// Returns the kept indices in score-rank order. Empty input yields an
/// empty keep-list.
pub fn non_max_suppression(
    boxes: &[BoundingBox],
    threshold: f32,
    mode: SuppressionMode,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| {
        boxes[b]
            .score
            .partial_cmp(&boxes[a].score)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep = Vec::new();
    while !order.is_empty() {
        let best = order[0];
        keep.push(best);
        let survivors: Vec<usize> = order[1..]
            .iter()
            .copied()
            .filter(|&idx| overlap(&boxes[best], &boxes[idx], mode) <= threshold)
            .collect();
        order = survivors;
    }
    keep
}

fn overlap(a: &BoundingBox, b: &BoundingBox, mode: SuppressionMode) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    let iw = (ix2 - ix1 + 1.0).max(0.0);
    let ih = (iy2 - iy1 + 1.0).max(0.0);
    let intersection = iw * ih;

    match mode {
        SuppressionMode::Union => intersection / (a.area() + b.area() - intersection),
        SuppressionMode::Min => intersection / a.area().min(b.area()),
    }
}

/// Apply regression offsets to boxes, producing refined boxes.
///
/// Offsets are fractions of the pre-calibration box extent:
/// `x1' = x1 + w * dx1` and so on, with `w`/`h` computed before any
/// adjustment. Scores carry through unchanged. Pure and total.
pub fn calibrate(boxes: &[BoundingBox], offsets: &[RegressionOffset]) -> Vec<BoundingBox> {
    debug_assert_eq!(boxes.len(), offsets.len());
    boxes
        .iter()
        .zip(offsets)
        .map(|(bbox, reg)| {
            let w = bbox.width();
            let h = bbox.height();
            BoundingBox {
                x1: bbox.x1 + w * reg.dx1,
                y1: bbox.y1 + h * reg.dy1,
                x2: bbox.x2 + w * reg.dx2,
                y2: bbox.y2 + h * reg.dy2,
                score: bbox.score,
            }
        })
        .collect()
}
