//! Mistral OCR + structuring extractor.
//!
//! Two HTTP calls per frame: the OCR endpoint turns the PNG into page
//! markdown, then a chat completion in JSON mode maps that text onto the
//! session's columns.

use super::markdown::records_from_markdown;
use super::structured::{build_structuring_prompt, parse_structured_rows};
use super::Extractor;
use crate::config::ExtractorConfig;
use crate::types::{ExtractionError, Frame, Record, Schema, SequenceNumber};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, ImageFormat};
use serde_json::Value;
use std::future::Future;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Encode a frame as a `data:image/png;base64,...` URL
pub fn png_data_url(image: &DynamicImage) -> Result<String, ExtractionError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| ExtractionError::Image(e.to_string()))?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(&buf)))
}

/// Join the markdown of every page in an OCR response
pub fn ocr_text(response: &Value) -> Result<String, ExtractionError> {
    let pages = response["pages"]
        .as_array()
        .ok_or_else(|| ExtractionError::Malformed("OCR response has no pages".to_string()))?;

    Ok(pages
        .iter()
        .filter_map(|page| page["markdown"].as_str().or_else(|| page["text"].as_str()))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Message content of the first chat completion choice
pub fn completion_content(response: &Value) -> Result<&str, ExtractionError> {
    response["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .and_then(|choice| choice["message"]["content"].as_str())
        .ok_or_else(|| ExtractionError::Malformed("completion has no message content".to_string()))
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json["message"]
                .as_str()
                .or_else(|| json["error"]["message"].as_str())
                .or_else(|| json["detail"].as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Extractor backed by the Mistral HTTP API
pub struct MistralExtractor {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    ocr_model: String,
    structuring_model: String,
    markdown_fallback: bool,
}

impl MistralExtractor {
    pub fn new(api_key: String, config: &ExtractorConfig) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            ocr_model: config.ocr_model.clone(),
            structuring_model: config.structuring_model.clone(),
            markdown_fallback: config.markdown_fallback,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ExtractionError> {
        let url = format!("{}{}", self.api_base, path);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(ExtractionError::Api {
                status: status.as_u16(),
                message: api_error_message(&text),
            });
        }

        Ok(serde_json::from_str(&text)?)
    }

    /// OCR stage: image to markdown text
    pub async fn ocr(&self, image: &DynamicImage) -> Result<String, ExtractionError> {
        let body = serde_json::json!({
            "model": self.ocr_model,
            "document": {
                "type": "image_url",
                "image_url": png_data_url(image)?,
            },
            "include_image_base64": false,
        });

        let response = self.post("/v1/ocr", &body).await?;
        ocr_text(&response)
    }

    /// Structuring stage: OCR text to the raw JSON reply
    pub async fn structure(&self, text: &str, schema: &Schema) -> Result<String, ExtractionError> {
        let body = serde_json::json!({
            "model": self.structuring_model,
            "messages": [{
                "role": "user",
                "content": build_structuring_prompt(text, schema),
            }],
            "response_format": { "type": "json_object" },
        });

        let response = self.post("/v1/chat/completions", &body).await?;
        Ok(completion_content(&response)?.to_string())
    }
}

/// Combine OCR text with the structuring stage
///
/// `structure` runs only when the OCR text has content. If structuring fails
/// and `markdown_fallback` is set, a markdown table in the OCR text whose
/// header matches `schema` is used instead; when that also fails the
/// structuring error is returned.
pub async fn records_from_stages<F, Fut>(
    text: &str,
    schema: &Schema,
    seq: SequenceNumber,
    markdown_fallback: bool,
    structure: F,
) -> Result<Vec<Record>, ExtractionError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String, ExtractionError>>,
{
    if text.trim().is_empty() {
        info!("🔍 OCR: frame {} has no text", seq);
        return Ok(Vec::new());
    }

    let structured = match structure().await {
        Ok(raw) => parse_structured_rows(&raw, schema, seq),
        Err(e) => Err(e),
    };

    match structured {
        Ok(records) => Ok(records),
        Err(e) if markdown_fallback => {
            warn!("Structuring failed for frame {}: {}, trying markdown table", seq, e);
            records_from_markdown(text, schema, seq).map_err(|fallback| {
                debug!("Markdown fallback failed: {}", fallback);
                e
            })
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Extractor for MistralExtractor {
    async fn extract(&self, frame: &Frame, schema: &Schema) -> Result<Vec<Record>, ExtractionError> {
        let start = Instant::now();

        let text = self.ocr(&frame.image).await?;
        debug!("🔍 OCR: {} chars from frame {} in {:?}", text.len(), frame.seq, start.elapsed());

        let records = records_from_stages(&text, schema, frame.seq, self.markdown_fallback, || {
            self.structure(&text, schema)
        })
        .await?;

        info!(
            "🔍 Extracted {} rows from frame {} in {:?}",
            records.len(),
            frame.seq,
            start.elapsed()
        );
        Ok(records)
    }

    fn name(&self) -> &str {
        "mistral"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_png_data_url() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let url = png_data_url(&image).unwrap();
        assert!(url.starts_with("data:image/png;base64,"));

        let payload = url.trim_start_matches("data:image/png;base64,");
        let bytes = STANDARD.decode(payload).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn test_ocr_text_joins_pages() {
        let response = serde_json::json!({
            "pages": [
                {"index": 0, "markdown": "| Name | Title |"},
                {"index": 1, "markdown": "| Alice | Eng |"}
            ]
        });
        assert_eq!(ocr_text(&response).unwrap(), "| Name | Title |\n| Alice | Eng |");
    }

    #[test]
    fn test_ocr_text_without_pages() {
        assert!(matches!(
            ocr_text(&serde_json::json!({"error": "x"})),
            Err(ExtractionError::Malformed(_))
        ));
        assert_eq!(ocr_text(&serde_json::json!({"pages": []})).unwrap(), "");
    }

    #[test]
    fn test_completion_content() {
        let response = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"rows\": []}"}}]
        });
        assert_eq!(completion_content(&response).unwrap(), "{\"rows\": []}");
        assert!(completion_content(&serde_json::json!({"choices": []})).is_err());
    }

    #[test]
    fn test_api_error_message() {
        assert_eq!(api_error_message(r#"{"message": "Unauthorized"}"#), "Unauthorized");
        assert_eq!(
            api_error_message(r#"{"error": {"message": "rate limited"}}"#),
            "rate limited"
        );
        assert_eq!(api_error_message(" bad gateway "), "bad gateway");
    }

    const TABLE: &str = "Results\n\n| Name | Title |\n|---|---|\n| Alice | Eng |\n";

    fn schema() -> Schema {
        Schema::new(["Name", "Title"]).unwrap()
    }

    fn values(records: &[Record]) -> Vec<Vec<String>> {
        records.iter().map(|r| r.values().to_vec()).collect()
    }

    #[tokio::test]
    async fn test_stages_skip_structuring_without_text() {
        let mut called = false;
        let records = records_from_stages(" \n ", &schema(), 1, true, || {
            called = true;
            async { Ok(r#"{"rows": [{"Name": "x", "Title": "y"}]}"#.to_string()) }
        })
        .await
        .unwrap();

        assert!(records.is_empty());
        assert!(!called);
    }

    #[tokio::test]
    async fn test_stages_prefer_structured_rows() {
        let records = records_from_stages(TABLE, &schema(), 3, true, || async {
            Ok(r#"{"rows": [{"Name": "Bob", "Title": "PM"}]}"#.to_string())
        })
        .await
        .unwrap();

        assert_eq!(values(&records), vec![vec!["Bob", "PM"]]);
        assert_eq!(records[0].seq(), 3);
    }

    #[tokio::test]
    async fn test_stages_fall_back_to_markdown() {
        let records = records_from_stages(TABLE, &schema(), 2, true, || async {
            Err(ExtractionError::Timeout(Duration::from_secs(1)))
        })
        .await
        .unwrap();
        assert_eq!(values(&records), vec![vec!["Alice", "Eng"]]);

        // Unusable JSON takes the same path
        let records = records_from_stages(TABLE, &schema(), 2, true, || async {
            Ok("not json".to_string())
        })
        .await
        .unwrap();
        assert_eq!(values(&records), vec![vec!["Alice", "Eng"]]);
    }

    #[tokio::test]
    async fn test_stages_report_structuring_error_when_fallback_fails() {
        let text = "| Person | Role |\n|---|---|\n| Alice | Eng |";
        let result = records_from_stages(text, &schema(), 1, true, || async {
            Ok("not json".to_string())
        })
        .await;
        assert!(matches!(result, Err(ExtractionError::Malformed(_))));

        let result = records_from_stages(TABLE, &schema(), 1, false, || async {
            Err(ExtractionError::Timeout(Duration::from_secs(1)))
        })
        .await;
        assert!(matches!(result, Err(ExtractionError::Timeout(_))));
    }

    #[test]
    fn test_new_trims_api_base() {
        let config = ExtractorConfig {
            api_base: "https://example.test/".to_string(),
            ..ExtractorConfig::default()
        };
        let extractor = MistralExtractor::new("key".to_string(), &config).unwrap();
        assert_eq!(extractor.api_base, "https://example.test");
        assert_eq!(extractor.name(), "mistral");
    }
}
