mod args;

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serde::Serialize;

use args::DetectArgs;
use mtcnn_core::{Detection, MtcnnDetector};
use mtcnn_utils::{config::AppSettings, configure_telemetry, init_logging, normalize_path};

#[derive(Debug, Serialize)]
struct DetectionRecord {
    score: f32,
    bbox: [f32; 4],
    landmarks: [[f32; 2]; 5],
}

impl From<&Detection> for DetectionRecord {
    fn from(detection: &Detection) -> Self {
        Self {
            score: detection.score,
            bbox: [
                detection.bbox.x1,
                detection.bbox.y1,
                detection.bbox.x2,
                detection.bbox.y2,
            ],
            landmarks: detection.landmarks.map(|point| [point.x, point.y]),
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageDetections {
    image: String,
    detections: Vec<DetectionRecord>,
}

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let args = DetectArgs::parse();

    let input_path = normalize_path(&args.input)?;
    let model_dir = normalize_path(&args.model_dir)?;

    let mut settings = load_settings(args.config.as_ref())?;
    apply_cli_overrides(&mut settings, &args);
    configure_telemetry(
        settings.telemetry.enabled || args.telemetry,
        settings.telemetry.level_filter(),
    );

    info!("Loading cascade models from {}", model_dir.display());
    let detector = MtcnnDetector::new(&model_dir, settings.detection.clone())?;

    let output = detector.detect_path(&input_path)?;
    info!(
        "{} -> {} detection(s)",
        input_path.display(),
        output.detections.len()
    );

    let report = ImageDetections {
        image: input_path.display().to_string(),
        detections: output.detections.iter().map(DetectionRecord::from).collect(),
    };
    let payload =
        serde_json::to_string_pretty(&report).context("failed to serialize detections")?;

    match args.json.as_ref() {
        Some(path) => fs::write(path, payload)
            .with_context(|| format!("failed to write detections to {}", path.display()))?,
        None => println!("{payload}"),
    }

    Ok(())
}

fn load_settings(config: Option<&std::path::PathBuf>) -> Result<AppSettings> {
    match config {
        Some(path) => AppSettings::load_from_path(path),
        None => Ok(AppSettings::default()),
    }
}

fn apply_cli_overrides(settings: &mut AppSettings, args: &DetectArgs) {
    if let Some(min_face_size) = args.min_face_size {
        settings.detection.min_face_size = min_face_size;
    }
    if let Some(threshold) = args.propose_threshold {
        settings.detection.stage_thresholds[0] = threshold;
    }
    if let Some(threshold) = args.refine_threshold {
        settings.detection.stage_thresholds[1] = threshold;
    }
    if let Some(threshold) = args.output_threshold {
        settings.detection.stage_thresholds[2] = threshold;
    }
}
