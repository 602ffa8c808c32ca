//! Configuration management for capture sessions.
//!
//! Loads configuration from TOML files and provides runtime defaults. A
//! loaded [`Config`] is validated once into an immutable [`SessionPlan`]
//! before the capture loop starts.

use crate::dedup::DedupSettings;
use crate::navigator::NavKey;
use crate::types::{CaptureTarget, ConfigError, Schema};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable consulted when no API key is configured
pub const API_KEY_ENV: &str = "MISTRAL_API_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub navigation: NavigationConfig,

    #[serde(default)]
    pub extractor: ExtractorConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub change_detection: ChangeDetectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Output column names, in order
    #[serde(default)]
    pub columns: Vec<String>,

    /// Minimum time between the starts of two captures
    #[serde(default = "default_capture_interval")]
    pub capture_interval_seconds: f64,

    /// Wait after navigating before the next capture
    #[serde(default = "default_settle_delay")]
    pub settle_delay_seconds: f64,

    /// Advance events sent per cycle
    #[serde(default = "default_navigation_steps")]
    pub navigation_steps: u32,

    /// Where the CSV is written
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,

    /// Keep the raw buffer and ask before deduplicating
    #[serde(default)]
    pub debug_mode: bool,

    /// Keep a downscaled copy of the latest frame on disk
    #[serde(default = "default_true")]
    pub preview_enabled: bool,

    /// Where the preview image is written
    #[serde(default = "default_preview_path")]
    pub preview_path: PathBuf,

    /// Archive every frame as PNG here (cleared at session start)
    #[serde(default)]
    pub screenshots_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            capture_interval_seconds: default_capture_interval(),
            settle_delay_seconds: default_settle_delay(),
            navigation_steps: default_navigation_steps(),
            output_path: default_output_path(),
            debug_mode: false,
            preview_enabled: true,
            preview_path: default_preview_path(),
            screenshots_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Window title or app name to capture (substring or glob); full display if unset
    #[serde(default)]
    pub window: Option<String>,
}

impl CaptureConfig {
    pub fn target(&self) -> CaptureTarget {
        match self.window.as_deref().map(str::trim) {
            Some(selector) if !selector.is_empty() => CaptureTarget::Window(selector.to_string()),
            _ => CaptureTarget::FullDisplay,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationConfig {
    /// Send advance events at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Key used to move to the next item (down, up, page_down, page_up, left, right, tab)
    #[serde(default = "default_nav_key")]
    pub key: String,

    /// Delay between individual key events
    #[serde(default = "default_key_delay")]
    pub key_delay_ms: u64,

    /// Bring the target application to the front before sending keys
    #[serde(default = "default_true")]
    pub activate_target: bool,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key: default_nav_key(),
            key_delay_ms: default_key_delay(),
            activate_target: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// API key; falls back to the MISTRAL_API_KEY environment variable
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_ocr_model")]
    pub ocr_model: String,

    #[serde(default = "default_structuring_model")]
    pub structuring_model: String,

    /// Per-attempt timeout
    #[serde(default = "default_extract_timeout")]
    pub timeout_seconds: u64,

    /// Attempts per cycle before its records are skipped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles for each further attempt
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,

    /// Parse a markdown table from the OCR text when structuring fails
    #[serde(default = "default_true")]
    pub markdown_fallback: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_api_base(),
            ocr_model: default_ocr_model(),
            structuring_model: default_structuring_model(),
            timeout_seconds: default_extract_timeout(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
            markdown_fallback: true,
        }
    }
}

impl ExtractorConfig {
    /// Configured key, else the environment variable
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Collapse rows that are similar but not identical
    #[serde(default = "default_true")]
    pub near_duplicates: bool,

    /// Per-column similarity (0-1) at or above which rows are near duplicates
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicates: true,
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetectionConfig {
    /// Skip extraction when the frame looks the same as the previous one
    #[serde(default)]
    pub skip_unchanged_frames: bool,

    /// Hamming distance threshold for hash comparison (0-64)
    #[serde(default = "default_hash_sensitivity")]
    pub hash_sensitivity: u32,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            skip_unchanged_frames: false,
            hash_sensitivity: default_hash_sensitivity(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_capture_interval() -> f64 {
    10.0
}

fn default_settle_delay() -> f64 {
    5.0
}

fn default_navigation_steps() -> u32 {
    11
}

fn default_output_path() -> PathBuf {
    PathBuf::from("screen_capture_table.csv")
}

fn default_preview_path() -> PathBuf {
    std::env::temp_dir().join("table-capture-preview.png")
}

fn default_nav_key() -> String {
    "down".to_string()
}

fn default_key_delay() -> u64 {
    100
}

fn default_api_base() -> String {
    "https://api.mistral.ai".to_string()
}

fn default_ocr_model() -> String {
    "mistral-ocr-latest".to_string()
}

fn default_structuring_model() -> String {
    "mistral-medium-2505".to_string()
}

fn default_extract_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> u64 {
    1000
}

fn default_similarity_threshold() -> f64 {
    0.9
}

fn default_hash_sensitivity() -> u32 {
    2
}

/// Validated, immutable view of a [`Config`] consumed by the session
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub schema: Schema,
    pub target: CaptureTarget,
    pub capture_interval: Duration,
    pub settle_delay: Duration,
    pub navigation_steps: u32,
    pub output_path: PathBuf,
    pub debug_mode: bool,
    pub extraction_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub dedup: DedupSettings,
    pub skip_unchanged_frames: bool,
    pub hash_sensitivity: u32,
}

impl SessionPlan {
    /// Backoff before the attempt following `attempt` (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor)
    }
}

fn positive_secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::NotPositive {
            field,
            value: value.to_string(),
        });
    }
    match Duration::try_from_secs_f64(value) {
        // Sub-nanosecond values round down to zero
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(ConfigError::NotPositive {
            field,
            value: value.to_string(),
        }),
    }
}

fn non_negative_secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Negative {
            field,
            value: value.to_string(),
        });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::Negative {
        field,
        value: value.to_string(),
    })
}

/// Where a leniently loaded [`Config`] came from
///
/// Loading happens before logging is set up, so the outcome is returned and
/// reported once a subscriber exists.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at this path
    Defaults(PathBuf),
    /// File exists but could not be used
    Invalid { path: PathBuf, error: String },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded configuration from {:?}", path),
            ConfigSource::Defaults(path) => {
                info!("No config file found at {:?}, using defaults", path)
            }
            ConfigSource::Invalid { path, error } => {
                warn!("Failed to parse config file {:?}: {}, using defaults", path, error)
            }
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> (Self, ConfigSource) {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path, falling back to defaults
    pub fn load_from_path(path: PathBuf) -> (Self, ConfigSource) {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, ConfigSource::File(path)),
                Err(e) => (
                    Self::default(),
                    ConfigSource::Invalid {
                        path,
                        error: e.to_string(),
                    },
                ),
            },
            Err(_) => (Self::default(), ConfigSource::Defaults(path)),
        }
    }

    /// Load a config the user asked for explicitly; errors are not swallowed
    pub fn load_strict(path: PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("table-capture")
            .join("config.toml")
    }

    /// Save configuration to a specific path
    ///
    /// The API key is never written; keep it in the environment.
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let mut saved = self.clone();
        saved.extractor.api_key = None;
        let contents = toml::to_string_pretty(&saved)
            .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        std::fs::write(path, contents).map_err(io_err)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate everything the capture loop depends on
    pub fn plan(&self) -> Result<SessionPlan, ConfigError> {
        let schema = Schema::new(&self.session.columns)?;

        let capture_interval = positive_secs(
            "capture_interval_seconds",
            self.session.capture_interval_seconds,
        )?;
        let settle_delay =
            non_negative_secs("settle_delay_seconds", self.session.settle_delay_seconds)?;

        if self.session.navigation_steps == 0 {
            return Err(ConfigError::NotPositive {
                field: "navigation_steps",
                value: "0".to_string(),
            });
        }
        if self.extractor.max_attempts == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_attempts",
                value: "0".to_string(),
            });
        }
        if self.extractor.timeout_seconds == 0 {
            return Err(ConfigError::NotPositive {
                field: "timeout_seconds",
                value: "0".to_string(),
            });
        }

        let threshold = self.dedup.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::ThresholdOutOfRange(threshold));
        }

        NavKey::parse(&self.navigation.key)?;

        Ok(SessionPlan {
            schema,
            target: self.capture.target(),
            capture_interval,
            settle_delay,
            navigation_steps: self.session.navigation_steps,
            output_path: self.session.output_path.clone(),
            debug_mode: self.session.debug_mode,
            extraction_timeout: Duration::from_secs(self.extractor.timeout_seconds),
            max_attempts: self.extractor.max_attempts,
            backoff: Duration::from_millis(self.extractor.backoff_ms),
            dedup: DedupSettings {
                near_duplicates: self.dedup.near_duplicates,
                similarity_threshold: threshold,
            },
            skip_unchanged_frames: self.change_detection.skip_unchanged_frames,
            hash_sensitivity: self.change_detection.hash_sensitivity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.columns = vec!["Name".into(), "Title".into()];
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.session.navigation_steps, 11);
        assert_eq!(config.extractor.max_attempts, 3);
        assert_eq!(config.extractor.ocr_model, "mistral-ocr-latest");
        assert_eq!(config.capture.target(), CaptureTarget::FullDisplay);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[general]
log_level = "debug"

[session]
columns = ["Person Name", "Company Name", "Job Title"]
capture_interval_seconds = 4
settle_delay_seconds = 1.5
debug_mode = true

[capture]
window = "LinkedIn*"

[dedup]
similarity_threshold = 0.8
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.session.columns.len(), 3);
        assert_eq!(config.session.capture_interval_seconds, 4.0);
        assert!(config.session.debug_mode);
        assert_eq!(
            config.capture.target(),
            CaptureTarget::Window("LinkedIn*".into())
        );
        assert_eq!(config.dedup.similarity_threshold, 0.8);
        // Untouched sections keep their defaults
        assert_eq!(config.navigation.key, "down");
        assert_eq!(config.extractor.backoff_ms, 1000);
    }

    #[test]
    fn test_blank_window_means_full_display() {
        let capture = CaptureConfig {
            window: Some("   ".into()),
        };
        assert_eq!(capture.target(), CaptureTarget::FullDisplay);
    }

    #[test]
    fn test_plan_valid() {
        let plan = valid_config().plan().unwrap();
        assert_eq!(plan.schema.columns(), &["Name", "Title"]);
        assert_eq!(plan.capture_interval, Duration::from_secs(10));
        assert_eq!(plan.settle_delay, Duration::from_secs(5));
        assert_eq!(plan.max_attempts, 3);
    }

    #[test]
    fn test_plan_rejects_empty_schema() {
        let config = Config::default();
        assert!(matches!(config.plan(), Err(ConfigError::EmptySchema)));
    }

    #[test]
    fn test_plan_rejects_non_positive_interval() {
        let mut config = valid_config();
        config.session.capture_interval_seconds = 0.0;
        assert!(matches!(
            config.plan(),
            Err(ConfigError::NotPositive { field: "capture_interval_seconds", .. })
        ));

        config.session.capture_interval_seconds = f64::NAN;
        assert!(config.plan().is_err());
    }

    #[test]
    fn test_plan_rejects_sub_nanosecond_interval() {
        let mut config = valid_config();
        config.session.capture_interval_seconds = 1e-10;
        assert!(matches!(
            config.plan(),
            Err(ConfigError::NotPositive { field: "capture_interval_seconds", .. })
        ));

        config.session.capture_interval_seconds = 0.001;
        assert!(!config.plan().unwrap().capture_interval.is_zero());
    }

    #[test]
    fn test_plan_rejects_zero_steps() {
        let mut config = valid_config();
        config.session.navigation_steps = 0;
        assert!(matches!(
            config.plan(),
            Err(ConfigError::NotPositive { field: "navigation_steps", .. })
        ));
    }

    #[test]
    fn test_plan_allows_zero_settle_but_not_negative() {
        let mut config = valid_config();
        config.session.settle_delay_seconds = 0.0;
        assert_eq!(config.plan().unwrap().settle_delay, Duration::ZERO);

        config.session.settle_delay_seconds = -1.0;
        assert!(matches!(config.plan(), Err(ConfigError::Negative { .. })));
    }

    #[test]
    fn test_plan_rejects_threshold_out_of_range() {
        let mut config = valid_config();
        config.dedup.similarity_threshold = 1.5;
        assert!(matches!(
            config.plan(),
            Err(ConfigError::ThresholdOutOfRange(_))
        ));
    }

    #[test]
    fn test_plan_rejects_unknown_key() {
        let mut config = valid_config();
        config.navigation.key = "space_bar".into();
        assert!(matches!(config.plan(), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_backoff_doubles() {
        let plan = valid_config().plan().unwrap();
        assert_eq!(plan.backoff_after(1), Duration::from_millis(1000));
        assert_eq!(plan.backoff_after(2), Duration::from_millis(2000));
        assert_eq!(plan.backoff_after(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_api_key_from_config_wins() {
        let extractor = ExtractorConfig {
            api_key: Some("  key-from-config ".into()),
            ..ExtractorConfig::default()
        };
        assert_eq!(extractor.resolve_api_key().as_deref(), Some("key-from-config"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = valid_config();
        config.session.navigation_steps = 4;
        config.extractor.api_key = Some("secret".into());
        config.save_to_path(&path).unwrap();

        assert!(!std::fs::read_to_string(&path).unwrap().contains("secret"));

        let loaded = Config::load_strict(path).unwrap();
        assert_eq!(loaded.session.columns, vec!["Name", "Title"]);
        assert_eq!(loaded.session.navigation_steps, 4);
        assert!(loaded.extractor.api_key.is_none());
    }

    #[test]
    fn test_save_into_file_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();

        let result = valid_config().save_to_path(&blocker.join("config.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_from_missing_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let (config, source) = Config::load_from_path(path.clone());
        assert!(config.session.columns.is_empty());
        assert_eq!(source, ConfigSource::Defaults(path));
    }

    #[test]
    fn test_load_from_invalid_path_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\ncolumns = 3").unwrap();

        let (config, source) = Config::load_from_path(path.clone());
        assert!(config.session.columns.is_empty());
        assert!(matches!(source, ConfigSource::Invalid { path: p, .. } if p == path));
    }

    #[test]
    fn test_load_from_file_reports_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\ncolumns = [\"Name\"]").unwrap();

        let (config, source) = Config::load_from_path(path.clone());
        assert_eq!(config.session.columns, vec!["Name"]);
        assert_eq!(source, ConfigSource::File(path));
    }

    #[test]
    fn test_load_strict_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[session\ncolumns = 3").unwrap();
        assert!(matches!(Config::load_strict(path), Err(ConfigError::Parse(_))));
    }
}
