//! Markdown table fallback.
//!
//! OCR output is markdown, and screens that already show a table usually come
//! back as one. When the structuring stage fails, the first table in the OCR
//! text is used directly, but only if its header names the schema's columns.

use crate::dedup::normalize;
use crate::types::{ExtractionError, Record, Schema, SequenceNumber};

/// Header row plus body rows of a markdown table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn split_cells(line: &str) -> Vec<String> {
    let inner = &line[1..line.len() - 1];
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn is_separator(cells: &[String]) -> bool {
    cells
        .iter()
        .all(|cell| !cell.is_empty() && cell.chars().all(|c| matches!(c, '-' | ':' | ' ')))
}

/// Find the first pipe table in `text`
///
/// Lines that start and end with `|` belong to the table; the first of them
/// is the header and the `---` separator row is skipped. The table ends at the
/// first non-table line. A table with no non-empty cell counts as absent.
pub fn parse_markdown_table(text: &str) -> Option<MarkdownTable> {
    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        let is_table_line = line.len() >= 2 && line.starts_with('|') && line.ends_with('|');

        if !is_table_line {
            if header.is_some() {
                break;
            }
            continue;
        }

        let cells = split_cells(line);
        match &header {
            None => header = Some(cells),
            Some(h) => {
                if cells.len() == h.len() && is_separator(&cells) {
                    continue;
                }
                rows.push(cells);
            }
        }
    }

    let header = header?;
    let has_content = header
        .iter()
        .chain(rows.iter().flatten())
        .any(|cell| !cell.is_empty());

    if has_content {
        Some(MarkdownTable { header, rows })
    } else {
        None
    }
}

/// Whether a table header names exactly the schema's columns, in order
pub fn header_matches(header: &[String], schema: &Schema) -> bool {
    header.len() == schema.len()
        && header
            .iter()
            .zip(schema.columns())
            .all(|(h, c)| normalize(h) == normalize(c))
}

/// Records from the first markdown table in `text`
pub fn records_from_markdown(
    text: &str,
    schema: &Schema,
    seq: SequenceNumber,
) -> Result<Vec<Record>, ExtractionError> {
    let table = parse_markdown_table(text)
        .ok_or_else(|| ExtractionError::Malformed("no markdown table in OCR text".to_string()))?;

    if !header_matches(&table.header, schema) {
        return Err(ExtractionError::NonConforming(format!(
            "table header [{}] does not match columns [{}]",
            table.header.join(", "),
            schema
        )));
    }

    table
        .rows
        .into_iter()
        .map(|row| Record::new(schema, seq, row))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::new(["Name", "Title"]).unwrap()
    }

    const PAGE: &str = "# Results\n\nSome intro text\n\n| Name | Title |\n|------|:-----:|\n| Alice | Eng |\n| Bob | PM |\n\nFooter | not a table";

    #[test]
    fn test_parse_first_table() {
        let table = parse_markdown_table(PAGE).unwrap();
        assert_eq!(table.header, vec!["Name", "Title"]);
        assert_eq!(
            table.rows,
            vec![vec!["Alice".to_string(), "Eng".to_string()], vec!["Bob".to_string(), "PM".to_string()]]
        );
    }

    #[test]
    fn test_no_table() {
        assert!(parse_markdown_table("just some text\nwithout pipes").is_none());
        assert!(parse_markdown_table("").is_none());
        assert!(parse_markdown_table("| |\n| |").is_none());
    }

    #[test]
    fn test_records_from_matching_header() {
        let records = records_from_markdown(PAGE, &schema(), 4).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].values(), &["Bob", "PM"]);
        assert_eq!(records[0].seq(), 4);
    }

    #[test]
    fn test_header_match_is_normalized() {
        let text = "| name |  TITLE |\n|---|---|\n| Alice | Eng |";
        assert_eq!(records_from_markdown(text, &schema(), 1).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_other_header() {
        let text = "| Person | Role |\n|---|---|\n| Alice | Eng |";
        assert!(matches!(
            records_from_markdown(text, &schema(), 1),
            Err(ExtractionError::NonConforming(_))
        ));
    }

    #[test]
    fn test_rejects_short_row() {
        let text = "| Name | Title |\n|---|---|\n| Alice |";
        assert!(matches!(
            records_from_markdown(text, &schema(), 1),
            Err(ExtractionError::NonConforming(_))
        ));
    }

    #[test]
    fn test_header_only_table_yields_no_records() {
        let text = "| Name | Title |\n|---|---|";
        assert!(records_from_markdown(text, &schema(), 1).unwrap().is_empty());
    }

    #[test]
    fn test_missing_table_is_malformed() {
        assert!(matches!(
            records_from_markdown("no table here", &schema(), 1),
            Err(ExtractionError::Malformed(_))
        ));
    }
}
