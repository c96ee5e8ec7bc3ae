//! The three-stage cascade controller.
//!
//! `MtcnnDetector` walks an image through propose, refine, and output
//! stages. Each stage hands the next an explicit list of boxes; finding
//! nothing at any point short-circuits to an empty result, which is the
//! expected outcome for most images, never an error.

use std::path::Path;

use anyhow::Result;
use image::{DynamicImage, RgbImage};
use log::debug;

use crate::backend::{ProposalBackend, StageBackend};
use crate::geometry::square_of;
use crate::model::{OutputNet, ProposalNet, RefineNet};
use crate::postprocess::{
    BoundingBox, Candidate, Detection, Landmark, RegressionOffset, SuppressionMode, calibrate,
    generate_candidates, non_max_suppression,
};
use crate::preprocess::{ImagePyramid, crop_batch};
use mtcnn_utils::config::CascadeSettings;
use mtcnn_utils::image_utils::load_image;
use mtcnn_utils::timing_guard;

/// Receptive field of the proposal network; also the smallest image side
/// the pyramid will scan.
pub const PROPOSAL_NET_SIZE: u32 = 12;

/// Per-scale suppression inside the proposal stage.
const PROPOSE_SCALE_NMS: f32 = 0.5;
/// Cross-scale merge suppression at the end of the proposal stage.
const PROPOSE_MERGE_NMS: f32 = 0.7;
/// Suppression after refine-stage filtering.
const REFINE_NMS: f32 = 0.6;

/// Result of running the cascade on an image.
#[derive(Debug)]
pub struct DetectionOutput {
    /// Final calibrated detections, empty when no face was found.
    pub detections: Vec<Detection>,
    /// Dimensions of the input image.
    pub original_size: (u32, u32),
}

/// Face detector cascading three inference backends over an image pyramid.
///
/// Backends are read-only after construction; all per-call state flows
/// through the stage functions, so one detector can serve concurrent
/// `detect` calls.
#[derive(Debug)]
pub struct MtcnnDetector {
    pnet: Box<dyn ProposalBackend>,
    rnet: Box<dyn StageBackend>,
    onet: Box<dyn StageBackend>,
    settings: CascadeSettings,
}

impl MtcnnDetector {
    /// Load the three ONNX models (`pnet.onnx`, `rnet.onnx`, `onet.onnx`)
    /// from `model_dir` and build a detector.
    pub fn new<P: AsRef<Path>>(model_dir: P, settings: CascadeSettings) -> Result<Self> {
        let dir = model_dir.as_ref();
        let pnet = ProposalNet::load(dir.join("pnet.onnx"))?;
        let rnet = RefineNet::load(dir.join("rnet.onnx"))?;
        let onet = OutputNet::load(dir.join("onet.onnx"))?;
        Self::from_backends(Box::new(pnet), Box::new(rnet), Box::new(onet), settings)
    }

    /// Build a detector from already-constructed backends.
    ///
    /// Settings are validated here; malformed thresholds or pyramid
    /// parameters fail construction rather than a later `detect` call.
    pub fn from_backends(
        pnet: Box<dyn ProposalBackend>,
        rnet: Box<dyn StageBackend>,
        onet: Box<dyn StageBackend>,
        settings: CascadeSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            pnet,
            rnet,
            onet,
            settings,
        })
    }

    /// The validated cascade settings in effect.
    pub fn settings(&self) -> &CascadeSettings {
        &self.settings
    }

    /// Run detection on an image file.
    pub fn detect_path<P: AsRef<Path>>(&self, path: P) -> Result<DetectionOutput> {
        let image = load_image(path)?;
        self.detect_image(&image)
    }

    /// Run detection on an in-memory image.
    pub fn detect_image(&self, image: &DynamicImage) -> Result<DetectionOutput> {
        let _guard = timing_guard("mtcnn_core::detect_image", log::Level::Debug);
        let rgb = image.to_rgb8();
        let original_size = rgb.dimensions();

        // A zero-area or sub-receptive-field image simply has nothing to
        // scan; that is an empty result, not a failure.
        if original_size.0 == 0 || original_size.1 == 0 {
            return Ok(DetectionOutput {
                detections: Vec::new(),
                original_size,
            });
        }

        let proposals = self.propose(&rgb)?;
        if proposals.is_empty() {
            return Ok(DetectionOutput {
                detections: Vec::new(),
                original_size,
            });
        }

        let refined = self.refine(&rgb, &proposals)?;
        if refined.is_empty() {
            return Ok(DetectionOutput {
                detections: Vec::new(),
                original_size,
            });
        }

        let detections = self.output(&rgb, &refined)?;
        debug!(
            "cascade kept {} of {} proposals for a {}x{} image",
            detections.len(),
            proposals.len(),
            original_size.0,
            original_size.1
        );
        Ok(DetectionOutput {
            detections,
            original_size,
        })
    }

    /// Stage 1: scan the pyramid, decode and suppress per scale, merge
    /// across scales, calibrate. Returns calibrated candidate boxes.
    fn propose(&self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
        let _guard = timing_guard("mtcnn_core::propose", log::Level::Debug);
        let threshold = self.settings.stage_thresholds[0];

        let mut accumulated: Vec<Candidate> = Vec::new();
        let pyramid = ImagePyramid::new(
            image,
            self.settings.min_face_size,
            PROPOSAL_NET_SIZE,
            self.settings.scale_factor,
        );
        for level in pyramid {
            let maps = self.pnet.infer(&level.image)?;
            maps.ensure_consistent()?;

            let candidates =
                generate_candidates(&maps.scores, &maps.regressions, level.scale, threshold)?;
            if candidates.is_empty() {
                continue;
            }

            let boxes: Vec<BoundingBox> = candidates.iter().map(|c| c.bbox).collect();
            let keep = non_max_suppression(&boxes, PROPOSE_SCALE_NMS, SuppressionMode::Union);
            accumulated.extend(keep.into_iter().map(|i| candidates[i]));
        }

        if accumulated.is_empty() {
            return Ok(Vec::new());
        }

        let boxes: Vec<BoundingBox> = accumulated.iter().map(|c| c.bbox).collect();
        let keep = non_max_suppression(&boxes, PROPOSE_MERGE_NMS, SuppressionMode::Union);

        let merged_boxes: Vec<BoundingBox> = keep.iter().map(|&i| boxes[i]).collect();
        let merged_offsets: Vec<RegressionOffset> =
            keep.iter().map(|&i| accumulated[i].offsets).collect();
        Ok(calibrate(&merged_boxes, &merged_offsets))
    }

    /// Stage 2: re-crop survivors, batch-infer, filter, suppress,
    /// calibrate.
    fn refine(&self, image: &RgbImage, proposals: &[BoundingBox]) -> Result<Vec<BoundingBox>> {
        let _guard = timing_guard("mtcnn_core::refine", log::Level::Debug);
        let threshold = self.settings.stage_thresholds[1];

        let squared: Vec<BoundingBox> = proposals
            .iter()
            .map(|b| square_of(b).rounded())
            .collect();
        let batch = crop_batch(image, &squared, self.rnet.input_size())?;
        let output = self.rnet.infer(&batch)?;
        output.ensure_consistent(squared.len())?;

        // Survivors adopt the refine-stage score.
        let mut kept_boxes = Vec::new();
        let mut kept_offsets = Vec::new();
        for (index, bbox) in squared.iter().enumerate() {
            let score = output.scores[index];
            if score <= threshold {
                continue;
            }
            kept_boxes.push(BoundingBox { score, ..*bbox });
            kept_offsets.push(RegressionOffset {
                dx1: output.regressions[(index, 0)],
                dy1: output.regressions[(index, 1)],
                dx2: output.regressions[(index, 2)],
                dy2: output.regressions[(index, 3)],
            });
        }
        if kept_boxes.is_empty() {
            return Ok(Vec::new());
        }

        let keep = non_max_suppression(&kept_boxes, REFINE_NMS, SuppressionMode::Union);
        let boxes: Vec<BoundingBox> = keep.iter().map(|&i| kept_boxes[i]).collect();
        let offsets: Vec<RegressionOffset> = keep.iter().map(|&i| kept_offsets[i]).collect();
        Ok(calibrate(&boxes, &offsets))
    }

    /// Stage 3: re-crop survivors, batch-infer, filter, project landmarks,
    /// calibrate. No suppression follows this stage.
    fn output(&self, image: &RgbImage, refined: &[BoundingBox]) -> Result<Vec<Detection>> {
        let _guard = timing_guard("mtcnn_core::output", log::Level::Debug);
        let threshold = self.settings.stage_thresholds[2];

        let squared: Vec<BoundingBox> = refined
            .iter()
            .map(|b| square_of(b).rounded())
            .collect();
        let batch = crop_batch(image, &squared, self.onet.input_size())?;
        let output = self.onet.infer(&batch)?;
        output.ensure_consistent(squared.len())?;
        let landmark_rows = output
            .landmarks
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("output backend produced no landmarks"))?;

        let mut kept_boxes = Vec::new();
        let mut kept_offsets = Vec::new();
        let mut kept_landmarks = Vec::new();
        for (index, bbox) in squared.iter().enumerate() {
            let score = output.scores[index];
            if score <= threshold {
                continue;
            }

            // Landmarks are fractions of the crop box; project them through
            // the pre-calibration extent.
            let w = bbox.width();
            let h = bbox.height();
            let mut landmarks = [Landmark { x: 0.0, y: 0.0 }; 5];
            for (point, slot) in landmarks.iter_mut().enumerate() {
                *slot = Landmark {
                    x: bbox.x1 + w * landmark_rows[(index, point * 2)],
                    y: bbox.y1 + h * landmark_rows[(index, point * 2 + 1)],
                };
            }

            kept_boxes.push(BoundingBox { score, ..*bbox });
            kept_offsets.push(RegressionOffset {
                dx1: output.regressions[(index, 0)],
                dy1: output.regressions[(index, 1)],
                dx2: output.regressions[(index, 2)],
                dy2: output.regressions[(index, 3)],
            });
            kept_landmarks.push(landmarks);
        }
        if kept_boxes.is_empty() {
            return Ok(Vec::new());
        }

        let detections = calibrate(&kept_boxes, &kept_offsets)
            .into_iter()
            .zip(kept_landmarks)
            .map(|(bbox, landmarks)| Detection {
                score: bbox.score,
                bbox,
                landmarks,
            })
            .collect();
        Ok(detections)
    }
}
