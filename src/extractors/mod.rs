//! Turning captured frames into schema-conformant records.
//!
//! The session only depends on the [`Extractor`] trait. The production
//! implementation is [`mistral::MistralExtractor`]; the parsers it relies on
//! live in [`structured`] (JSON mode output) and [`markdown`] (table fallback).

pub mod markdown;
pub mod mistral;
pub mod structured;

use crate::types::{ExtractionError, Frame, Record, Schema};
use async_trait::async_trait;

/// OCR/structuring capability
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract the visible rows of `frame`, in on-screen order
    ///
    /// Every returned record must have exactly the schema's columns.
    /// Non-conforming output is an error, never coerced.
    async fn extract(&self, frame: &Frame, schema: &Schema) -> Result<Vec<Record>, ExtractionError>;

    /// Short name used in logs
    fn name(&self) -> &str;
}
