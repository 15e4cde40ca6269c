//! Delimited-file export for extraction records and batch summaries.
//!
//! Files are UTF-8 with a leading byte-order mark so spreadsheet tools pick
//! the right encoding for non-Latin scripts. The header row is always
//! written, even when there are no rows.

use crate::report::{BatchEntry, BATCH_COLUMNS};
use crate::schema::{ExtractionRecord, RECORD_COLUMNS};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write {path} (fallback {fallback}): {cause}")]
    Persistence {
        path: PathBuf,
        fallback: PathBuf,
        cause: String,
    },
}

/// Write extraction records. Returns the path actually written.
pub fn write_records(records: &[ExtractionRecord], path: &Path) -> Result<PathBuf, ExportError> {
    write_with_fallback(&RECORD_COLUMNS, records, path)
}

/// Write a batch summary table. Returns the path actually written.
pub fn write_batch(entries: &[BatchEntry], path: &Path) -> Result<PathBuf, ExportError> {
    write_with_fallback(&BATCH_COLUMNS, entries, path)
}

/// Try `path`, then once more under the system temp directory.
fn write_with_fallback<T: Serialize>(
    header: &[&str],
    rows: &[T],
    path: &Path,
) -> Result<PathBuf, ExportError> {
    let first_err = match write_csv(header, rows, path) {
        Ok(()) => {
            info!("Wrote {} rows to {:?}", rows.len(), path);
            return Ok(path.to_path_buf());
        }
        Err(e) => e,
    };

    let fallback = fallback_path(path);
    warn!(
        "Export to {:?} failed ({}), falling back to {:?}",
        path, first_err, fallback
    );

    match write_csv(header, rows, &fallback) {
        Ok(()) => {
            info!("Wrote {} rows to {:?}", rows.len(), fallback);
            Ok(fallback)
        }
        Err(e) => Err(ExportError::Persistence {
            path: path.to_path_buf(),
            fallback,
            cause: format!("{}; fallback: {}", first_err, e),
        }),
    }
}

fn fallback_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "ocr_results.csv".into());
    std::env::temp_dir().join("medocr").join(name)
}

fn write_csv<T: Serialize>(header: &[&str], rows: &[T], path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    file.write_all(UTF8_BOM)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(header)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(line_number: usize, text: &str, confidence: f64) -> ExtractionRecord {
        ExtractionRecord {
            file_name: "scan.png".to_string(),
            line_number,
            extracted_text: text.to_string(),
            confidence,
        }
    }

    fn read_rows(path: &Path) -> (Vec<u8>, Vec<Vec<String>>) {
        let bytes = fs::read(path).unwrap();
        let body = bytes.strip_prefix(UTF8_BOM).unwrap().to_vec();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(body.as_slice());
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(|f| f.to_string()).collect())
            .collect();
        (bytes, rows)
    }

    #[test]
    fn test_header_only_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("ocr_results.csv");
        let written = write_records(&[], &path).unwrap();
        assert_eq!(written, path);

        let (bytes, rows) = read_rows(&path);
        assert!(bytes.starts_with(UTF8_BOM));
        assert_eq!(rows, vec![vec!["file_name", "line_number", "extracted_text", "confidence"]]);
    }

    #[test]
    fn test_non_latin_text_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocr_results.csv");
        let records = vec![
            record(1, "Hypertension", 0.92),
            record(2, "高血压, 每日一次", 0.88),
        ];
        write_records(&records, &path).unwrap();

        let (_, rows) = read_rows(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["scan.png", "1", "Hypertension", "0.92"]);
        assert_eq!(rows[2][2], "高血压, 每日一次");
    }

    #[test]
    fn test_falls_back_when_target_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        let path = blocker.join("medocr_fallback_test.csv");

        let written = write_records(&[record(1, "a", 0.5)], &path).unwrap();
        assert_ne!(written, path);
        assert!(written.starts_with(std::env::temp_dir()));
        let (_, rows) = read_rows(&written);
        assert_eq!(rows.len(), 2);
        fs::remove_file(written).unwrap();
    }

    #[test]
    fn test_batch_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch_summary.csv");
        write_batch(&[BatchEntry::rejected("bad.png")], &path).unwrap();

        let (_, rows) = read_rows(&path);
        assert_eq!(rows[0], BATCH_COLUMNS.to_vec());
        assert_eq!(rows[1], vec!["bad.png", "0", "0.0", "0.0", "rejected"]);
    }
}
