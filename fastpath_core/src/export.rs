//! CSV export of fasting history.

use crate::{FastingRecord, Result};
use std::fs::File;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    id: String,
    start_time: String,
    end_time: Option<String>,
    duration_secs: Option<i64>,
}

impl From<&FastingRecord> for CsvRow {
    fn from(record: &FastingRecord) -> Self {
        CsvRow {
            id: record.id.to_string(),
            start_time: record.start_time.to_rfc3339(),
            end_time: record.end_time.map(|t| t.to_rfc3339()),
            duration_secs: record.duration().map(|d| d.num_seconds()),
        }
    }
}

/// Write `records` to `csv_path`, replacing any existing file.
///
/// A fast still in progress is written with empty `end_time` and
/// `duration_secs`. Returns the number of rows written.
pub fn export_history_csv(records: &[FastingRecord], csv_path: &Path) -> Result<usize> {
    if let Some(parent) = csv_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(csv_path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    // Header written explicitly so an empty history still gets one
    writer.write_record(["id", "start_time", "end_time", "duration_secs"])?;
    for record in records {
        writer.serialize(CsvRow::from(record))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Exported {} fasting records to {:?}", records.len(), csv_path);
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_export_writes_rows() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("history.csv");

        let start = Utc.with_ymd_and_hms(2025, 5, 4, 20, 0, 0).unwrap();
        let finished = FastingRecord::new(start).stopped_at(start + Duration::hours(16));
        let running = FastingRecord::new(start + Duration::days(1));

        let count = export_history_csv(&[running.clone(), finished.clone()], &csv_path).unwrap();
        assert_eq!(count, 2);

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["id", "start_time", "end_time", "duration_secs"]
        );

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], running.id.to_string());
        assert_eq!(&rows[0][2], "");
        assert_eq!(&rows[0][3], "");
        assert_eq!(&rows[1][0], finished.id.to_string());
        assert_eq!(&rows[1][3], "57600");
    }

    #[test]
    fn test_export_empty_history_has_header() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("nested").join("history.csv");

        let count = export_history_csv(&[], &csv_path).unwrap();
        assert_eq!(count, 0);

        let contents = std::fs::read_to_string(&csv_path).unwrap();
        assert_eq!(contents.trim(), "id,start_time,end_time,duration_secs");
    }

    #[test]
    fn test_export_replaces_existing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("history.csv");
        std::fs::write(&csv_path, "stale contents\nmore\nlines\n").unwrap();

        export_history_csv(&[], &csv_path).unwrap();
        let contents = std::fs::read_to_string(&csv_path).unwrap();
        assert!(!contents.contains("stale"));
    }
}
