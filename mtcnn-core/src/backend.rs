//! Inference backend contracts for the three cascade stages.
//!
//! The cascade never looks inside a network; it consumes two shapes of
//! output. The proposal stage maps a whole (resized) image to per-cell
//! score and regression maps; the refine and output stages map a batch of
//! fixed-size square crops to per-crop scores, regressions, and — for the
//! final stage — landmarks. Backends are immutable once constructed and may
//! be shared across concurrent detections.

use std::fmt::Debug;

use anyhow::Result;
use ndarray::{Array2, Array3, Array4};

/// Raw per-cell outputs of the proposal network at one pyramid level.
#[derive(Debug, Clone)]
pub struct ProposalMaps {
    /// Object-presence probability per map cell, `[rows, cols]`.
    pub scores: Array2<f32>,
    /// Four box regression values per map cell, `[rows, cols, 4]`.
    pub regressions: Array3<f32>,
}

impl ProposalMaps {
    /// Reject maps whose regression shape disagrees with the score map.
    /// A malformed shape is a backend fault, never silently patched over.
    pub fn ensure_consistent(&self) -> Result<()> {
        let (rows, cols) = self.scores.dim();
        anyhow::ensure!(
            self.regressions.dim() == (rows, cols, 4),
            "proposal backend returned regression map {:?} for a {}x{} score map",
            self.regressions.dim(),
            rows,
            cols
        );
        Ok(())
    }
}

/// Per-crop outputs of the refine or output network.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Object-presence probability per crop.
    pub scores: Vec<f32>,
    /// Four box regression values per crop, `[n, 4]`.
    pub regressions: Array2<f32>,
    /// Five landmark points per crop as interleaved `(x, y)` fractions of
    /// the crop box, `[n, 10]`. Only the output stage produces these.
    pub landmarks: Option<Array2<f32>>,
}

impl StageOutput {
    /// Validate the output against the submitted batch size.
    pub fn ensure_consistent(&self, batch_len: usize) -> Result<()> {
        anyhow::ensure!(
            self.scores.len() == batch_len,
            "stage backend returned {} scores for a batch of {}",
            self.scores.len(),
            batch_len
        );
        anyhow::ensure!(
            self.regressions.dim() == (batch_len, 4),
            "stage backend returned regressions {:?} for a batch of {}",
            self.regressions.dim(),
            batch_len
        );
        if let Some(landmarks) = &self.landmarks {
            anyhow::ensure!(
                landmarks.dim() == (batch_len, 10),
                "stage backend returned landmarks {:?} for a batch of {}",
                landmarks.dim(),
                batch_len
            );
        }
        Ok(())
    }
}

/// The proposal-stage contract: one zero-centered BGR CHW image of arbitrary
/// size at or above the network's receptive field, mapped to per-cell maps.
pub trait ProposalBackend: Send + Sync + Debug {
    fn infer(&self, image: &Array3<f32>) -> Result<ProposalMaps>;
}

/// The crop-stage contract shared by the refine and output networks: a batch
/// of zero-centered BGR CHW crops of the network's fixed square input size.
pub trait StageBackend: Send + Sync + Debug {
    /// Side length of the square crops this backend expects.
    fn input_size(&self) -> u32;

    fn infer(&self, batch: &Array4<f32>) -> Result<StageOutput>;
}
