//! Table Capture - screen table scraping into CSV
//!
//! This crate repeatedly screenshots a window (or the whole display), turns
//! each screenshot into schema-conformant rows through an OCR and structuring
//! service, scrolls the list forward with synthetic key presses, and finally
//! writes the deduplicated rows to a CSV file.
//!
//! # Architecture
//!
//! A [`Session`] drives the cycle through four capabilities: a
//! [`Capturer`], an [`Extractor`], a [`Navigator`] and, in debug mode, a
//! [`Reviewer`]. Captured frames are also published on a [`FrameBus`] for
//! side-effect-only observers such as the preview writer. Records only ever
//! accumulate in memory; the single CSV write happens after the capture loop
//! has stopped.

pub mod capture;
pub mod change_detector;
pub mod config;
pub mod csv;
pub mod dedup;
pub mod extractors;
pub mod navigator;
pub mod observer;
pub mod recorder;
pub mod review;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use capture::{list_windows, CaptureService, Capturer};
pub use change_detector::{compute_ahash, hamming_distance, ChangeDetector, PerceptualHash};
pub use config::{Config, ConfigSource, SessionPlan, API_KEY_ENV};
pub use dedup::{DedupOutcome, DedupSettings, Deduplicator, Fingerprint};
pub use extractors::{mistral::MistralExtractor, Extractor};
pub use navigator::{KeystrokeNavigator, NavKey, Navigator, NoopNavigator};
pub use observer::{spawn_observer, FrameArchive, FrameBus, FrameObserver, PreviewWriter};
pub use recorder::{raw_path_for, write_csv, Recorder};
pub use review::{AutoApprove, ConsoleReviewer, ReviewDecision, Reviewer};
pub use session::{Session, SessionReport, SessionState, StopSignal};
pub use types::{
    CaptureError, CaptureTarget, ConfigError, ExtractionError, Frame, NavigationError, Record,
    Schema, SequenceNumber, SessionError, SinkWriteError, Termination, WindowInfo,
};
