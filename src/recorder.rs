//! Session buffer and the terminal CSV write.
//!
//! The recorder only ever appends during capture. The buffer is handed over
//! once at shutdown and written in a single pass: header row first, then one
//! line per record in schema order.

use crate::csv::write_row;
use crate::types::{Record, Schema, SinkWriteError};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Append-only accumulation of records for one session
#[derive(Debug, Default)]
pub struct Recorder {
    buffer: Vec<Record>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every record, in order
    pub fn append(&mut self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        debug!("Recording {} rows (buffer: {})", records.len(), self.buffer.len());
        self.buffer.extend(records);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Freeze the buffer and take ownership of it
    pub fn into_buffer(self) -> Vec<Record> {
        self.buffer
    }
}

/// Path of the raw (pre-dedup) artifact written next to `output` in debug mode
pub fn raw_path_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{}.raw.csv", stem))
}

/// Write `records` as CSV with `schema` as the header row
///
/// The data goes to a sibling temp file that is renamed over `path`, so a
/// failed write never leaves a truncated artifact behind.
pub fn write_csv(path: &Path, schema: &Schema, records: &[Record]) -> Result<(), SinkWriteError> {
    let sink_err = |source| SinkWriteError {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(sink_err)?;
        }
    }

    let tmp_path = path.with_extension("csv.tmp");
    let result = (|| -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        write_row(&mut writer, schema.columns())?;
        for record in records {
            write_row(&mut writer, record.values())?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(sink_err(e));
    }

    info!("Wrote {} rows to {}", records.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(["Name", "Title"]).unwrap()
    }

    fn record(name: &str, title: &str) -> Record {
        Record::new(&schema(), 1, vec![name.into(), title.into()]).unwrap()
    }

    #[test]
    fn test_recorder_appends_in_order() {
        let mut recorder = Recorder::new();
        assert!(recorder.is_empty());

        recorder.append(vec![record("Alice", "Eng")]);
        recorder.append(Vec::new());
        recorder.append(vec![record("Bob", "PM"), record("Alice", "Eng")]);

        assert_eq!(recorder.len(), 3);
        let names: Vec<_> = recorder
            .into_buffer()
            .iter()
            .map(|r| r.values()[0].clone())
            .collect();
        assert_eq!(names, vec!["Alice", "Bob", "Alice"]);
    }

    #[test]
    fn test_raw_path_for() {
        assert_eq!(
            raw_path_for(Path::new("out/table.csv")),
            PathBuf::from("out/table.raw.csv")
        );
        assert_eq!(raw_path_for(Path::new("table")), PathBuf::from("table.raw.csv"));
    }

    #[test]
    fn test_write_csv_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");

        let records = vec![record("Alice", "Eng"), record("Smith, John", "PM")];
        write_csv(&path, &schema(), &records).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "Name,Title\nAlice,Eng\n\"Smith, John\",PM\n");
        assert!(!path.with_extension("csv.tmp").exists());
    }

    #[test]
    fn test_write_csv_empty_buffer_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");

        write_csv(&path, &schema(), &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "Name,Title\n");
    }

    #[test]
    fn test_write_csv_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        // A file where a directory is expected
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        let path = blocker.join("out.csv");

        let err = write_csv(&path, &schema(), &[record("Alice", "Eng")]).unwrap_err();
        assert_eq!(err.path, path);
    }
}
