//! Property tests for buffer deduplication.
//!
//! Buffers are generated from a small alphabet so duplicates, case variants
//! and whitespace variants show up often.

use proptest::prelude::*;
use table_capture::dedup::{normalize, DedupSettings, Deduplicator, Fingerprint};
use table_capture::{Record, Schema};

fn schema() -> Schema {
    Schema::new(["Name", "Title"]).unwrap()
}

fn cell() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Alice".to_string()),
        Just("alice".to_string()),
        Just(" ALICE ".to_string()),
        Just("Bob".to_string()),
        Just("Bobb".to_string()),
        Just("Eng".to_string()),
        Just("eng".to_string()),
        Just("PM".to_string()),
        Just(String::new()),
        "[a-z ]{0,8}",
    ]
}

fn buffer() -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec((cell(), cell()), 0..24).prop_map(|rows| {
        let schema = schema();
        rows.into_iter()
            .enumerate()
            .map(|(i, (name, title))| Record::new(&schema, i as u64 + 1, vec![name, title]).unwrap())
            .collect()
    })
}

fn settings() -> impl Strategy<Value = DedupSettings> {
    (any::<bool>(), 0.5f64..=1.0).prop_map(|(near_duplicates, similarity_threshold)| DedupSettings {
        near_duplicates,
        similarity_threshold,
    })
}

/// Position of each retained record in the input, by sequence number
fn positions(input: &[Record], output: &[Record]) -> Vec<usize> {
    output
        .iter()
        .map(|r| input.iter().position(|i| i.seq() == r.seq()).unwrap())
        .collect()
}

proptest! {
    /// Deduplicating twice changes nothing
    #[test]
    fn prop_dedupe_is_idempotent(buffer in buffer(), settings in settings()) {
        let dedup = Deduplicator::new(settings);
        let once = dedup.dedupe(&buffer);
        let twice = dedup.dedupe(&once);
        prop_assert_eq!(once, twice);
    }

    /// Output is a subsequence of the input in first-seen order
    #[test]
    fn prop_dedupe_preserves_order(buffer in buffer(), settings in settings()) {
        let out = Deduplicator::new(settings).dedupe(&buffer);
        prop_assert!(out.len() <= buffer.len());

        let pos = positions(&buffer, &out);
        prop_assert!(pos.windows(2).all(|w| w[0] < w[1]));
    }

    /// Retained plus dropped accounts for every input record
    #[test]
    fn prop_partition_is_complete(buffer in buffer(), settings in settings()) {
        let outcome = Deduplicator::new(settings).partition(&buffer);
        prop_assert_eq!(outcome.input_len(), buffer.len());
        for dropped in &outcome.dropped {
            prop_assert!(dropped.duplicate_of < outcome.retained.len());
        }
    }

    /// No two retained records normalize to the same fingerprint
    #[test]
    fn prop_identical_normalized_rows_collapse(buffer in buffer(), settings in settings()) {
        let out = Deduplicator::new(settings).dedupe(&buffer);
        let keys: Vec<String> = out.iter().map(|r| Fingerprint::of(r).key().to_string()).collect();

        let mut unique = keys.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), keys.len());
    }

    /// The first record of the buffer is always kept
    #[test]
    fn prop_first_record_survives(buffer in buffer(), settings in settings()) {
        let out = Deduplicator::new(settings).dedupe(&buffer);
        if let Some(first) = buffer.first() {
            prop_assert_eq!(out.first(), Some(first));
        }
    }

    /// Normalization is stable
    #[test]
    fn prop_normalize_is_idempotent(value in "\\PC{0,16}") {
        let once = normalize(&value);
        prop_assert_eq!(normalize(&once), once.clone());
        prop_assert!(!once.starts_with(' ') && !once.ends_with(' '));
        prop_assert!(!once.contains("  "));
    }
}
