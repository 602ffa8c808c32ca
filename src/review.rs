//! Debug-mode review of the deduplication result.
//!
//! In debug mode nothing is discarded silently: the raw buffer is written
//! first, then a [`Reviewer`] sees what deduplication would drop and decides
//! which version ends up at the output path.

use crate::dedup::{DedupOutcome, MatchKind};
use async_trait::async_trait;
use std::io::{BufRead, Write};
use std::path::Path;
use tracing::warn;

/// Rows listed in the console summary before it is truncated
const SUMMARY_LIMIT: usize = 20;

/// What to write to the output path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Write the deduplicated rows
    Apply,
    /// Write the raw buffer unchanged
    KeepRaw,
}

#[async_trait]
pub trait Reviewer: Send {
    async fn review(&mut self, outcome: &DedupOutcome, raw_path: &Path) -> ReviewDecision;
}

/// Approves every deduplication without asking
#[derive(Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl Reviewer for AutoApprove {
    async fn review(&mut self, _outcome: &DedupOutcome, _raw_path: &Path) -> ReviewDecision {
        ReviewDecision::Apply
    }
}

/// Human-readable listing of the rows deduplication would drop
pub fn summarize(outcome: &DedupOutcome) -> String {
    let mut out = format!(
        "Deduplication would keep {} of {} rows and drop {}.\n",
        outcome.retained.len(),
        outcome.input_len(),
        outcome.dropped.len()
    );

    for dropped in outcome.dropped.iter().take(SUMMARY_LIMIT) {
        let kind = match dropped.kind {
            MatchKind::Exact => "exact".to_string(),
            MatchKind::Near { similarity } => format!("near {:.2}", similarity),
        };
        out.push_str(&format!(
            "  - [{}] {} (duplicate of row {}, {})\n",
            dropped.record.seq(),
            dropped.record.values().join(" | "),
            dropped.duplicate_of + 1,
            kind
        ));
    }

    if outcome.dropped.len() > SUMMARY_LIMIT {
        out.push_str(&format!(
            "  ... and {} more\n",
            outcome.dropped.len() - SUMMARY_LIMIT
        ));
    }

    out
}

/// Interpret a y/n answer
pub fn parse_answer(answer: &str) -> Option<ReviewDecision> {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(ReviewDecision::Apply),
        "n" | "no" => Some(ReviewDecision::KeepRaw),
        _ => None,
    }
}

/// Asks on the terminal: `Proceed with deduplication? (y/n)`
#[derive(Debug, Default)]
pub struct ConsoleReviewer;

fn prompt_blocking(summary: String, raw_path: String) -> ReviewDecision {
    println!();
    println!("{}", summary);
    println!("Raw data saved to {}", raw_path);

    let stdin = std::io::stdin();
    loop {
        print!("Proceed with deduplication? (y/n): ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            // EOF: nobody to ask, keep everything
            Ok(0) => return ReviewDecision::KeepRaw,
            Ok(_) => {
                if let Some(decision) = parse_answer(&line) {
                    return decision;
                }
                println!("Please answer 'y' or 'n'.");
            }
            Err(e) => {
                warn!("Failed to read answer: {}", e);
                return ReviewDecision::KeepRaw;
            }
        }
    }
}

#[async_trait]
impl Reviewer for ConsoleReviewer {
    async fn review(&mut self, outcome: &DedupOutcome, raw_path: &Path) -> ReviewDecision {
        let summary = summarize(outcome);
        let raw_path = raw_path.display().to_string();

        match tokio::task::spawn_blocking(move || prompt_blocking(summary, raw_path)).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Review prompt failed: {}", e);
                ReviewDecision::KeepRaw
            }
        }
    }
}
