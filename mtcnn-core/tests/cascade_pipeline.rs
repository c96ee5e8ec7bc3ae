//! End-to-end cascade behavior, driven through scripted inference backends.
//!
//! The real networks are exercised elsewhere; here the interesting part is
//! the orchestration around them: pyramid scanning, stage hand-off,
//! empty-result short-circuits, and coordinate bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use image::DynamicImage;
use ndarray::{Array2, Array3, Array4};

use mtcnn_core::{
    MtcnnDetector, ProposalBackend, ProposalMaps, StageBackend, StageOutput,
};
use mtcnn_utils::config::CascadeSettings;
use mtcnn_utils::fixtures::blank_image;

/// A proposal backend that reports one map cell with a fixed score for
/// every pyramid level it sees.
#[derive(Debug)]
struct ScriptedProposal {
    score: f32,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProposal {
    fn new(score: f32) -> Self {
        Self {
            score,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ProposalBackend for ScriptedProposal {
    fn infer(&self, _image: &Array3<f32>) -> Result<ProposalMaps> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProposalMaps {
            scores: Array2::from_elem((1, 1), self.score),
            regressions: Array3::zeros((1, 1, 4)),
        })
    }
}

/// A crop backend that scores crops by their batch position and returns
/// zero regressions; landmarks, when enabled, all sit at the crop center.
#[derive(Debug)]
struct ScriptedStage {
    size: u32,
    scores: Vec<f32>,
    with_landmarks: bool,
    calls: Arc<AtomicUsize>,
}

impl ScriptedStage {
    fn new(size: u32, scores: Vec<f32>, with_landmarks: bool) -> Self {
        Self {
            size,
            scores,
            with_landmarks,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl StageBackend for ScriptedStage {
    fn input_size(&self) -> u32 {
        self.size
    }

    fn infer(&self, batch: &Array4<f32>) -> Result<StageOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let count = batch.dim().0;
        let scores = (0..count)
            .map(|i| self.scores.get(i).copied().unwrap_or(0.0))
            .collect();
        Ok(StageOutput {
            scores,
            regressions: Array2::zeros((count, 4)),
            landmarks: self
                .with_landmarks
                .then(|| Array2::from_elem((count, 10), 0.5)),
        })
    }
}

fn detector(
    proposal_score: f32,
    refine_scores: Vec<f32>,
    output_scores: Vec<f32>,
) -> MtcnnDetector {
    MtcnnDetector::from_backends(
        Box::new(ScriptedProposal::new(proposal_score)),
        Box::new(ScriptedStage::new(24, refine_scores, false)),
        Box::new(ScriptedStage::new(48, output_scores, true)),
        CascadeSettings::default(),
    )
    .expect("default settings are valid")
}

#[test]
fn confident_candidate_survives_all_three_stages() {
    let detector = detector(1.0, vec![0.9], vec![0.95]);
    let image = DynamicImage::ImageRgb8(blank_image(100, 100));

    let output = detector.detect_image(&image).expect("detection runs");
    assert_eq!(output.original_size, (100, 100));
    assert_eq!(output.detections.len(), 1);

    // The 1x1 score map at the first pyramid level (scale 0.5) decodes to
    // the cell's receptive field back-projected into image space.
    let detection = &output.detections[0];
    assert_eq!(detection.bbox.x1, 0.0);
    assert_eq!(detection.bbox.y1, 0.0);
    assert_eq!(detection.bbox.x2, 24.0);
    assert_eq!(detection.bbox.y2, 24.0);
    assert_eq!(detection.score, 0.95);

    // Landmarks at fraction 0.5 of a 25-wide box land on its center.
    for landmark in &detection.landmarks {
        assert!((landmark.x - 12.5).abs() < 1e-5);
        assert!((landmark.y - 12.5).abs() < 1e-5);
    }
}

#[test]
fn low_proposal_scores_short_circuit_the_cascade() {
    let pnet = ScriptedProposal::new(0.2);
    let rnet = ScriptedStage::new(24, vec![0.9], false);
    let onet = ScriptedStage::new(48, vec![0.9], true);
    let pnet_calls = Arc::clone(&pnet.calls);
    let rnet_calls = Arc::clone(&rnet.calls);

    let detector = MtcnnDetector::from_backends(
        Box::new(pnet),
        Box::new(rnet),
        Box::new(onet),
        CascadeSettings::default(),
    )
    .unwrap();
    let image = DynamicImage::ImageRgb8(blank_image(100, 100));

    let output = detector.detect_image(&image).expect("detection runs");
    assert!(output.detections.is_empty());
    // Every pyramid level was scanned, but the refine backend never ran.
    assert!(pnet_calls.load(Ordering::SeqCst) > 0);
    assert_eq!(rnet_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn image_below_the_receptive_field_yields_no_levels() {
    let detector = detector(1.0, vec![0.9], vec![0.95]);
    // 20 * (12 / 24) = 10, not above the 12-pixel receptive field.
    let image = DynamicImage::ImageRgb8(blank_image(20, 20));

    let output = detector.detect_image(&image).expect("detection runs");
    assert!(output.detections.is_empty());
}

#[test]
fn zero_area_image_is_an_empty_result_not_an_error() {
    let detector = detector(1.0, vec![0.9], vec![0.95]);
    let image = DynamicImage::new_rgb8(0, 0);

    let output = detector.detect_image(&image).expect("detection runs");
    assert!(output.detections.is_empty());
    assert_eq!(output.original_size, (0, 0));
}

#[test]
fn refine_stage_can_reject_every_candidate() {
    let detector = detector(1.0, vec![0.1, 0.1, 0.1, 0.1, 0.1, 0.1], vec![0.95]);
    let image = DynamicImage::ImageRgb8(blank_image(100, 100));

    let output = detector.detect_image(&image).expect("detection runs");
    assert!(output.detections.is_empty());
}

#[test]
fn output_stage_can_reject_every_candidate() {
    let detector = detector(1.0, vec![0.9], vec![0.1]);
    let image = DynamicImage::ImageRgb8(blank_image(100, 100));

    let output = detector.detect_image(&image).expect("detection runs");
    assert!(output.detections.is_empty());
}

#[test]
fn malformed_backend_output_is_surfaced_as_an_error() {
    #[derive(Debug)]
    struct BrokenStage;

    impl StageBackend for BrokenStage {
        fn input_size(&self) -> u32 {
            24
        }

        fn infer(&self, batch: &Array4<f32>) -> Result<StageOutput> {
            let count = batch.dim().0;
            Ok(StageOutput {
                scores: vec![0.9; count],
                // Wrong trailing dimension.
                regressions: Array2::zeros((count, 3)),
                landmarks: None,
            })
        }
    }

    let detector = MtcnnDetector::from_backends(
        Box::new(ScriptedProposal::new(1.0)),
        Box::new(BrokenStage),
        Box::new(ScriptedStage::new(48, vec![0.9], true)),
        CascadeSettings::default(),
    )
    .unwrap();
    let image = DynamicImage::ImageRgb8(blank_image(100, 100));

    assert!(detector.detect_image(&image).is_err());
}

#[test]
fn invalid_settings_fail_at_construction() {
    let result = MtcnnDetector::from_backends(
        Box::new(ScriptedProposal::new(1.0)),
        Box::new(ScriptedStage::new(24, vec![0.9], false)),
        Box::new(ScriptedStage::new(48, vec![0.9], true)),
        CascadeSettings {
            scale_factor: 1.2,
            ..CascadeSettings::default()
        },
    );
    assert!(result.is_err());
}

#[test]
fn missing_landmarks_from_the_output_stage_are_an_error() {
    let detector = MtcnnDetector::from_backends(
        Box::new(ScriptedProposal::new(1.0)),
        Box::new(ScriptedStage::new(24, vec![0.9], false)),
        // An output backend wired without landmark support.
        Box::new(ScriptedStage::new(48, vec![0.9], false)),
        CascadeSettings::default(),
    )
    .unwrap();
    let image = DynamicImage::ImageRgb8(blank_image(100, 100));

    assert!(detector.detect_image(&image).is_err());
}
