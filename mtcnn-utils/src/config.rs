//! Shared configuration types consumed across the MTCNN workspace.
//!
//! These structures mirror the canonical cascade parameters and can be
//! serialized to disk and reused by the CLI and by tests.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::Path,
};

/// Cascade parameters shared by all three detection stages.
///
/// The defaults are the canonical MTCNN parameters: a candidate must score
/// at least 0.9 to leave the proposal stage, 0.6 to survive refinement, and
/// 0.7 to be emitted, while the pyramid shrinks by 0.79 per level down to a
/// 24-pixel face.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CascadeSettings {
    /// Minimum acceptable confidence per stage (propose, refine, output).
    pub stage_thresholds: [f32; 3],
    /// Pyramid downscale ratio applied between consecutive levels.
    pub scale_factor: f32,
    /// Smallest face size, in pixels, the pipeline commits to detecting.
    pub min_face_size: u32,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            stage_thresholds: [0.9, 0.6, 0.7],
            scale_factor: 0.79,
            min_face_size: 24,
        }
    }
}

impl CascadeSettings {
    /// Reject malformed parameters before any detection work starts.
    ///
    /// Thresholds must lie in `[0, 1]`; the scale factor must sit strictly
    /// between 0 and 1 so the pyramid terminates; the minimum face size must
    /// be non-zero.
    pub fn validate(&self) -> Result<()> {
        for (stage, threshold) in self.stage_thresholds.iter().enumerate() {
            anyhow::ensure!(
                (0.0..=1.0).contains(threshold),
                "stage {} threshold {} outside [0, 1]",
                stage + 1,
                threshold
            );
        }
        anyhow::ensure!(
            self.scale_factor > 0.0 && self.scale_factor < 1.0,
            "scale factor {} must be in (0, 1)",
            self.scale_factor
        );
        anyhow::ensure!(self.min_face_size > 0, "minimum face size must be non-zero");
        Ok(())
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether telemetry timing logs are enabled.
    pub enabled: bool,
    /// Logging level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Debug,
        }
    }
}

/// Persistent application settings consumed by the CLI front end.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppSettings {
    /// Optional override for the directory holding the three ONNX models.
    pub model_dir: Option<String>,
    /// Cascade thresholds and pyramid parameters.
    pub detection: CascadeSettings,
    /// Telemetry and diagnostics preferences.
    pub telemetry: TelemetrySettings,
}

impl AppSettings {
    /// Load settings from a JSON file.
    ///
    /// Missing fields fall back to their defaults; a file that does not
    /// exist or fails to parse is an error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings.detection.validate()?;
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON, overwriting any
    /// existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let settings = AppSettings::default();
        settings.save_to_path(file.path()).expect("save");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.detection, settings.detection);
        assert_eq!(loaded.model_dir, settings.model_dir);
        assert_eq!(loaded.telemetry.enabled, settings.telemetry.enabled);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{ "detection": { "min_face_size": 40 } }"#;
        fs::write(file.path(), json).expect("write custom settings");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.detection.min_face_size, 40);
        assert_eq!(loaded.detection.stage_thresholds, [0.9, 0.6, 0.7]);
        assert_eq!(loaded.detection.scale_factor, 0.79);
        assert!(loaded.model_dir.is_none());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let settings = CascadeSettings {
            stage_thresholds: [0.9, 1.5, 0.7],
            ..CascadeSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_shrinking_scale_factor() {
        for factor in [0.0, -0.5, 1.0, 1.3] {
            let settings = CascadeSettings {
                scale_factor: factor,
                ..CascadeSettings::default()
            };
            assert!(settings.validate().is_err(), "factor {factor} accepted");
        }
    }

    #[test]
    fn validate_rejects_zero_face_size() {
        let settings = CascadeSettings {
            min_face_size: 0,
            ..CascadeSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn telemetry_level_parses_variants() {
        let telemetry = TelemetrySettings {
            level: "TRACE".into(),
            ..TelemetrySettings::default()
        };
        assert_eq!(telemetry.level_filter(), LevelFilter::Trace);

        let telemetry = TelemetrySettings {
            level: "Warn".into(),
            ..TelemetrySettings::default()
        };
        assert_eq!(telemetry.level_filter(), LevelFilter::Warn);
    }
}
