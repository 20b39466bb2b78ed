//! Configuration System using Figment
//!
//! Strongly-typed settings for the scan controller and its collaborators.
//! Settings are loaded from:
//! 1. `config/sem_scan.toml` (optional; every field has a default)
//! 2. Environment variables prefixed with `SEM_SCAN_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use sem_scan::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Application: {}", settings.application.name);
//! # Ok::<(), sem_scan::error::ScanError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ScanError, ScanResult};
use crate::hardware::Wiring;
use crate::logging::OutputFormat;
use crate::scan::controller::{default_presets, Preset};
use crate::scan::field::{CodeRange, MAX_RESOLUTION};

/// Default settings file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/sem_scan.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SEM_SCAN_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// DAQ channel wiring
    pub wiring: Wiring,
    /// Scan engine and controller timing
    pub scan: ScanConfig,
    /// Scan rate presets
    pub presets: Vec<Preset>,
    /// Partial field settings
    pub partial_field: PartialFieldConfig,
    /// Display refresh settings
    pub display: DisplayConfig,
    /// Image export settings
    pub export: ExportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "SEM scan control".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
        }
    }
}

/// Scan engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Code written for the first pixel on each axis
    pub code_min: i16,
    /// Code written for the last pixel on each axis
    pub code_max: i16,
    /// Pause between outer iterations of the acquisition loop
    pub frame_pause_ms: u64,
    /// Poll interval while waiting for a stopped loop to terminate
    pub stop_poll_ms: u64,
    /// Pause before starting a scan from the run/record toggles
    pub restart_pause_ms: u64,
    /// Frame size before any preset is selected
    pub initial_resolution: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            code_min: -2048,
            code_max: 2047,
            frame_pause_ms: 10,
            stop_poll_ms: 1000,
            restart_pause_ms: 500,
            initial_resolution: 1024,
        }
    }
}

impl ScanConfig {
    /// Deflection code range.
    pub fn codes(&self) -> CodeRange {
        CodeRange {
            min: self.code_min,
            max: self.code_max,
        }
    }

    /// Pause between outer iterations.
    pub fn frame_pause(&self) -> Duration {
        Duration::from_millis(self.frame_pause_ms)
    }

    /// Stop-and-wait poll interval.
    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }

    /// Pre-start pause.
    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

/// Partial field configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialFieldConfig {
    /// Window edge length in pixels
    pub size: u32,
}

impl Default for PartialFieldConfig {
    fn default() -> Self {
        Self { size: 128 }
    }
}

/// Display refresh configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Refresh interval in milliseconds
    pub refresh_ms: u64,
    /// Whether refresh starts enabled
    pub enabled: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_ms: 1000,
            enabled: true,
        }
    }
}

impl DisplayConfig {
    /// Refresh interval.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }
}

/// Export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Output file for the save command
    pub path: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("Test.tif"),
        }
    }
}

impl Settings {
    /// Load settings from the default file and environment variables
    ///
    /// Environment variables override file values with prefix `SEM_SCAN_`.
    /// Example: `SEM_SCAN_SCAN__STOP_POLL_MS=50`
    pub fn load() -> ScanResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path, then validate
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let settings: Settings = Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string (no environment overrides), then validate
    pub fn from_toml_str(toml: &str) -> ScanResult<Self> {
        let settings: Settings = Self::figment().merge(Toml::string(toml)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::with_default_presets()))
    }

    /// Defaults including the four standard scan rate presets
    pub fn with_default_presets() -> Self {
        Self {
            presets: default_presets(),
            ..Default::default()
        }
    }

    /// Validate settings after loading
    pub fn validate(&self) -> ScanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ScanError::config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scan.code_min >= self.scan.code_max {
            return Err(ScanError::config(format!(
                "code_min {} must be below code_max {}",
                self.scan.code_min, self.scan.code_max
            )));
        }
        if self.scan.stop_poll_ms == 0 {
            return Err(ScanError::config("stop_poll_ms must be positive"));
        }
        check_resolution("initial_resolution", self.scan.initial_resolution)?;

        if self.presets.is_empty() {
            return Err(ScanError::config("at least one preset is required"));
        }
        let mut ids = HashSet::new();
        for preset in &self.presets {
            if !ids.insert(preset.id) {
                return Err(ScanError::config(format!(
                    "Duplicate preset id: {}",
                    preset.id
                )));
            }
            check_resolution(&format!("preset {} resolution", preset.id), preset.resolution)?;
            if preset.dwell <= 0 {
                return Err(ScanError::config(format!(
                    "preset {} dwell must be positive",
                    preset.id
                )));
            }
        }

        if self.partial_field.size == 0 {
            return Err(ScanError::config("partial_field.size must be positive"));
        }
        if self.display.refresh_ms == 0 {
            return Err(ScanError::config("display.refresh_ms must be positive"));
        }
        Ok(())
    }

    /// Look up a preset by id
    pub fn preset(&self, id: u8) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == id)
    }
}

fn check_resolution(what: &str, n: u32) -> ScanResult<()> {
    if n == 0 || n > MAX_RESOLUTION {
        return Err(ScanError::config(format!(
            "{what} {n} outside 1..={MAX_RESOLUTION}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::with_default_presets();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.presets.len(), 4);
        assert_eq!(settings.wiring.y_channel, 1);
        assert_eq!(settings.scan.stop_poll(), Duration::from_secs(1));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [scan]
            stop_poll_ms = 20

            [partial_field]
            size = 32
            "#,
        )
        .unwrap();
        assert_eq!(settings.scan.stop_poll_ms, 20);
        assert_eq!(settings.scan.code_min, -2048);
        assert_eq!(settings.partial_field.size, 32);
        assert_eq!(settings.presets, default_presets());
    }

    #[test]
    fn custom_presets_replace_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [[presets]]
            id = 7
            resolution = 2048
            dwell = 20
            "#,
        )
        .unwrap();
        assert_eq!(settings.presets.len(), 1);
        assert_eq!(settings.preset(7).map(|p| p.resolution), Some(2048));
        assert!(settings.preset(1).is_none());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::with_default_presets();
        settings.application.log_level = "invalid".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_preset_ids() {
        let mut settings = Settings::with_default_presets();
        settings.presets.push(settings.presets[0]);
        assert!(matches!(
            settings.validate(),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_code_range() {
        let result = Settings::from_toml_str(
            r#"
            [scan]
            code_min = 100
            code_max = 100
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn malformed_toml_is_a_settings_error() {
        let result = Settings::from_toml_str("[scan]\nstop_poll_ms = \"soon\"");
        assert!(matches!(result, Err(ScanError::Config(_))));
    }
}
