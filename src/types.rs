//! Core types used throughout the capture session.
//!
//! This module defines the schema and record model, capture frames and
//! targets, and the error taxonomy shared by every component.

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Per-cycle ordinal, used for logging and ordering only
pub type SequenceNumber = u64;

/// Ordered, unique column names fixed for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Arc<[String]>,
}

impl Schema {
    /// Build a schema, trimming names and rejecting blanks and duplicates
    pub fn new<I, S>(columns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let columns: Vec<String> = columns
            .into_iter()
            .map(|c| c.as_ref().trim().to_string())
            .collect();

        if columns.is_empty() {
            return Err(ConfigError::EmptySchema);
        }

        let mut seen = HashSet::new();
        for (index, column) in columns.iter().enumerate() {
            if column.is_empty() {
                return Err(ConfigError::BlankColumn(index + 1));
            }
            if !seen.insert(column.to_lowercase()) {
                return Err(ConfigError::DuplicateColumn(column.clone()));
            }
        }

        Ok(Self {
            columns: columns.into(),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of a column by exact name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.columns.join(", "))
    }
}

/// One schema-conformant extracted row
///
/// The column list is shared with the [`Schema`] that produced the record, so
/// its keys are always exactly the schema's columns in schema order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    seq: SequenceNumber,
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl Record {
    /// Build a record from values given in schema order
    pub fn new(
        schema: &Schema,
        seq: SequenceNumber,
        values: Vec<String>,
    ) -> Result<Self, ExtractionError> {
        if values.len() != schema.len() {
            return Err(ExtractionError::NonConforming(format!(
                "expected {} values, got {}",
                schema.len(),
                values.len()
            )));
        }

        Ok(Self {
            seq,
            columns: schema.columns.clone(),
            values,
        })
    }

    /// Sequence number of the frame this record was extracted from
    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    pub fn keys(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.values[i].as_str())
    }

    /// Column/value pairs in schema order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }

    /// Whether this record was built against the given schema
    pub fn conforms_to(&self, schema: &Schema) -> bool {
        self.columns[..] == schema.columns[..] && self.values.len() == schema.len()
    }
}

/// What the capturer should photograph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureTarget {
    /// A window matched by title or app name (substring or glob pattern)
    Window(String),
    /// The primary display
    FullDisplay,
}

impl CaptureTarget {
    pub fn is_window(&self) -> bool {
        matches!(self, CaptureTarget::Window(_))
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTarget::Window(selector) => write!(f, "window '{}'", selector),
            CaptureTarget::FullDisplay => write!(f, "full display"),
        }
    }
}

/// One still image produced by a capture cycle
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: SequenceNumber,
    pub image: DynamicImage,
    pub captured_at: DateTime<Utc>,
    pub target: CaptureTarget,
}

impl Frame {
    pub fn new(seq: SequenceNumber, image: DynamicImage, target: CaptureTarget) -> Self {
        Self {
            seq,
            image,
            captured_at: Utc::now(),
            target,
        }
    }
}

/// Information about a capturable window
#[derive(Debug, Clone)]
pub struct WindowInfo {
    pub id: u32,
    pub title: String,
    pub app_name: String,
    pub width: u32,
    pub height: u32,
    pub is_minimized: bool,
}

/// Why the capture loop stopped
#[derive(Debug)]
pub enum Termination {
    /// External interrupt (Ctrl+C or a stop request)
    Interrupted,
    /// Capture failed and no fallback remained
    CaptureFailed(CaptureError),
    /// Navigation backend is not usable
    NavigationFailed(NavigationError),
}

impl Termination {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Termination::Interrupted)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Interrupted => write!(f, "interrupted"),
            Termination::CaptureFailed(e) => write!(f, "capture failed: {}", e),
            Termination::NavigationFailed(e) => write!(f, "navigation failed: {}", e),
        }
    }
}

/// Invalid schema or configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Schema must contain at least one column")]
    EmptySchema,

    #[error("Column {0} has an empty name")]
    BlankColumn(usize),

    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: String },

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: String },

    #[error("Similarity threshold must be within [0, 1], got {0}")]
    ThresholdOutOfRange(f64),

    #[error("Unknown navigation key: {0}")]
    UnknownKey(String),

    #[error("Mistral API key not found (set MISTRAL_API_KEY, pass --api-key, or add extractor.api_key to the config)")]
    MissingApiKey,

    #[error("Config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors that can occur while capturing a frame
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),
}

/// Errors that can occur during extraction
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed structured output: {0}")]
    Malformed(String),

    #[error("Output does not match schema: {0}")]
    NonConforming(String),

    #[error("Failed to encode image: {0}")]
    Image(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while sending navigation input
#[derive(Debug, thiserror::Error)]
pub enum NavigationError {
    /// No input backend on this platform, or its tool is missing
    #[error("Navigation unsupported: {0}")]
    Unsupported(String),

    /// Backend exists but the events were not delivered
    #[error("Navigation input not delivered: {0}")]
    Delivery(String),
}

impl NavigationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, NavigationError::Unsupported(_))
    }
}

/// Persisting the output artifact failed
#[derive(Debug, thiserror::Error)]
#[error("Failed to write {path:?}: {source}")]
pub struct SinkWriteError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Errors that end a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The artifact could not be written; the buffer is handed back intact
    #[error("{source}")]
    SinkWrite {
        #[source]
        source: SinkWriteError,
        buffer: Vec<Record>,
    },
}
