//! Core MTCNN cascade primitives.
//!
//! This crate orchestrates three inference backends over an image pyramid:
//! a fully convolutional proposal network scanned across scales, and two
//! crop-based networks that refine and finalize the surviving boxes. The
//! backends run through `tract-onnx`; the geometric pipeline around them
//! (decoding, suppression, square normalization, padding, calibration)
//! lives here.

/// Inference backend contracts shared by the three stages.
pub mod backend;
/// The three-stage cascade controller.
pub mod detector;
/// Square normalization and border-safe crop planning.
pub mod geometry;
/// ONNX model loading and execution.
pub mod model;
/// Candidate decoding, suppression, and calibration.
pub mod postprocess;
/// Pyramid generation and crop-batch preparation.
pub mod preprocess;

pub use backend::{ProposalBackend, ProposalMaps, StageBackend, StageOutput};
pub use detector::{DetectionOutput, MtcnnDetector, PROPOSAL_NET_SIZE};
pub use geometry::{PadMap, pad_map, square_of};
pub use model::{OutputNet, ProposalNet, RefineNet};
pub use postprocess::{
    BoundingBox, Candidate, Detection, Landmark, RegressionOffset, SuppressionMode, calibrate,
    generate_candidates, non_max_suppression,
};
pub use preprocess::{ImagePyramid, PyramidLevel, crop_batch};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
