//! Common helpers shared across the MTCNN crates.

/// Cascade configuration and persisted settings.
pub mod config;
/// Synthetic image generation for tests.
pub mod fixtures;
/// Image loading, resizing, and tensor conversion.
pub mod image_utils;
/// Instrumentation helpers for optional performance tracing.
pub mod telemetry;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use config::{AppSettings, CascadeSettings, TelemetrySettings};
pub use fixtures::{blank_image, block_image, gradient_image};
pub use image_utils::{load_image, resize_image, rgb_to_bgr_chw, zero_centered_bgr_chw};
pub use telemetry::{
    TimingGuard, configure as configure_telemetry, telemetry_allows, telemetry_enabled,
    timing_guard, timing_guard_if,
};

/// Initialize logging once for CLI and test environments.
///
/// Respects the `RUST_LOG` environment variable when set, otherwise falls
/// back to the provided default filter level.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module("mtcnn::telemetry", LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
