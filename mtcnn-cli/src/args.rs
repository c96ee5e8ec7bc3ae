//! Command-line argument definitions for mtcnn-cli.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Run cascaded face detection over an image.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct DetectArgs {
    /// Path to the image file to scan.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Directory holding pnet.onnx, rnet.onnx, and onet.onnx.
    #[arg(short, long, default_value = "models")]
    pub model_dir: PathBuf,

    /// Optional settings JSON; built-in parameters are used when absent.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the smallest face size (pixels) the cascade commits to.
    #[arg(long)]
    pub min_face_size: Option<u32>,

    /// Override the proposal-stage score threshold.
    #[arg(long)]
    pub propose_threshold: Option<f32>,

    /// Override the refine-stage score threshold.
    #[arg(long)]
    pub refine_threshold: Option<f32>,

    /// Override the output-stage score threshold.
    #[arg(long)]
    pub output_threshold: Option<f32>,

    /// Write detections to a JSON file instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to the settings file).
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,
}
