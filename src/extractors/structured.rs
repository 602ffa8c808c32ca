//! Validation of structured (JSON) model output.
//!
//! The structuring model is asked for `{"rows": [{column: value, ...}]}`.
//! Anything that does not match the schema exactly is rejected as a whole,
//! never patched up.

use crate::types::{ExtractionError, Record, Schema, SequenceNumber};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

lazy_static! {
    // ```json ... ``` wrapper some models add even in JSON mode
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").unwrap();
}

/// Prompt asking the structuring model to map OCR text onto `schema`
pub fn build_structuring_prompt(ocr_text: &str, schema: &Schema) -> String {
    let headers = schema.columns().join(", ");

    let example: Map<String, Value> = schema
        .columns()
        .iter()
        .map(|c| (c.clone(), Value::String("...".to_string())))
        .collect();
    let example = serde_json::json!({ "rows": [example] });

    format!(
        "You are a data extraction assistant. Extract the table data from the following OCR text and return it as JSON.\n\n\
         Target columns: {headers}\n\n\
         OCR Text:\n{ocr_text}\n\n\
         Instructions:\n\
         1. Look for tabular data in the text\n\
         2. Map each data row to the target columns: {headers}\n\
         3. Return a JSON object with a \"rows\" array\n\
         4. Each row must be an object whose keys are exactly the target column names\n\
         5. If a value is missing or unclear, use an empty string\n\
         6. Only include actual data rows, not headers\n\n\
         Example format:\n{example}"
    )
}

fn strip_code_fence(raw: &str) -> &str {
    match CODE_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

fn cell_text(column: &str, value: &Value) -> Result<String, ExtractionError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Array(_) | Value::Object(_) => Err(ExtractionError::NonConforming(format!(
            "column '{}' holds a nested value",
            column
        ))),
    }
}

fn row_to_record(
    index: usize,
    row: &Value,
    schema: &Schema,
    seq: SequenceNumber,
) -> Result<Record, ExtractionError> {
    let object = row.as_object().ok_or_else(|| {
        ExtractionError::NonConforming(format!("row {} is not an object", index))
    })?;

    if let Some(extra) = object.keys().find(|k| schema.position(k).is_none()) {
        return Err(ExtractionError::NonConforming(format!(
            "row {} has unknown column '{}'",
            index, extra
        )));
    }

    let values = schema
        .columns()
        .iter()
        .map(|column| match object.get(column) {
            Some(value) => cell_text(column, value),
            None => Err(ExtractionError::NonConforming(format!(
                "row {} is missing column '{}'",
                index, column
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Record::new(schema, seq, values)
}

/// Parse a structuring response into records for `schema`
pub fn parse_structured_rows(
    raw: &str,
    schema: &Schema,
    seq: SequenceNumber,
) -> Result<Vec<Record>, ExtractionError> {
    let body = strip_code_fence(raw);
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| ExtractionError::Malformed(format!("invalid JSON: {}", e)))?;

    let rows = parsed
        .as_object()
        .ok_or_else(|| ExtractionError::Malformed("top level is not an object".to_string()))?
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| ExtractionError::Malformed("missing \"rows\" array".to_string()))?;

    rows.iter()
        .enumerate()
        .map(|(i, row)| row_to_record(i, row, schema, seq))
        .collect()
}
