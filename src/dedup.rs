//! Deduplication of the session buffer.
//!
//! Consecutive captures overlap, so the same on-screen row is usually
//! extracted several times, sometimes with small OCR differences. Records are
//! compared through a normalized [`Fingerprint`]: identical fingerprints are
//! exact duplicates, and fingerprints whose every column is similar enough
//! (normalized Levenshtein) are near duplicates. The first occurrence wins.

use crate::types::Record;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

/// Normalized form of a record, used only for comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    columns: Vec<String>,
    key: String,
}

impl Fingerprint {
    pub fn of(record: &Record) -> Self {
        let columns: Vec<String> = record.values().iter().map(|v| normalize(v)).collect();
        let key = compute_key(&columns);
        Self { columns, key }
    }

    /// Normalized column values in schema order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// SHA-256 over the normalized columns
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lowest per-column similarity against another fingerprint (0.0-1.0)
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        if self.columns.len() != other.columns.len() {
            return 0.0;
        }

        self.columns
            .iter()
            .zip(&other.columns)
            .map(|(a, b)| strsim::normalized_levenshtein(a, b))
            .fold(1.0, f64::min)
    }
}

/// Case-fold, collapse whitespace runs and trim
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn compute_key(columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    for column in columns {
        hasher.update(column.as_bytes());
        // Unit separator keeps ["ab", "c"] apart from ["a", "bc"]
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

/// Dedup tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupSettings {
    pub near_duplicates: bool,
    pub similarity_threshold: f64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            near_duplicates: true,
            similarity_threshold: 0.9,
        }
    }
}

/// How a dropped record matched a retained one
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchKind {
    Exact,
    Near { similarity: f64 },
}

/// A record the deduplicator would discard
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedRecord {
    pub record: Record,
    /// Index into [`DedupOutcome::retained`] of the record it duplicates
    pub duplicate_of: usize,
    pub kind: MatchKind,
}

/// Partition of a buffer into retained and dropped records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub retained: Vec<Record>,
    pub dropped: Vec<DroppedRecord>,
}

impl DedupOutcome {
    pub fn input_len(&self) -> usize {
        self.retained.len() + self.dropped.len()
    }
}

/// Collapses duplicate records, keeping first-seen order
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    settings: DedupSettings,
}

impl Deduplicator {
    pub fn new(settings: DedupSettings) -> Self {
        Self { settings }
    }

    /// Partition `records` without discarding anything
    pub fn partition(&self, records: &[Record]) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();
        let mut retained_prints: Vec<Fingerprint> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for record in records {
            let print = Fingerprint::of(record);

            if let Some(&index) = by_key.get(print.key()) {
                outcome.dropped.push(DroppedRecord {
                    record: record.clone(),
                    duplicate_of: index,
                    kind: MatchKind::Exact,
                });
                continue;
            }

            if self.settings.near_duplicates {
                if let Some((index, similarity)) = self.find_near(&print, &retained_prints) {
                    debug!(
                        "Record from cycle {} is a near duplicate of retained row {} ({:.2})",
                        record.seq(),
                        index,
                        similarity
                    );
                    outcome.dropped.push(DroppedRecord {
                        record: record.clone(),
                        duplicate_of: index,
                        kind: MatchKind::Near { similarity },
                    });
                    continue;
                }
            }

            by_key.insert(print.key().to_string(), outcome.retained.len());
            retained_prints.push(print);
            outcome.retained.push(record.clone());
        }

        info!(
            "Deduplication: {} rows in, {} retained, {} dropped",
            records.len(),
            outcome.retained.len(),
            outcome.dropped.len()
        );

        outcome
    }

    /// Retained records only
    pub fn dedupe(&self, records: &[Record]) -> Vec<Record> {
        self.partition(records).retained
    }

    fn find_near(&self, print: &Fingerprint, retained: &[Fingerprint]) -> Option<(usize, f64)> {
        retained
            .iter()
            .enumerate()
            .map(|(i, other)| (i, print.similarity(other)))
            .find(|(_, similarity)| *similarity >= self.settings.similarity_threshold)
    }
}
