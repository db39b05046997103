use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Column names of the print log, in order.
pub const CSV_HEADERS: [&str; 16] = [
    "count",
    "timestamp",
    "flow_rate",
    "feed_rate",
    "z_offset",
    "target_hotend",
    "hotend",
    "target_bed",
    "bed",
    "gcode_line_num_no_comments",
    "gcode_cmd",
    "nozzle_tip_coords_x",
    "nozzle_tip_coords_y",
    "flip_h",
    "flip_v",
    "rotate",
];

/// One row of the print log. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub count: u64,
    pub timestamp: String,
    pub flow_rate: i64,
    pub feed_rate: i64,
    pub z_offset: f64,
    #[serde(rename = "target_hotend")]
    pub hotend_target: f64,
    #[serde(rename = "hotend")]
    pub hotend_actual: f64,
    #[serde(rename = "target_bed")]
    pub bed_target: f64,
    #[serde(rename = "bed")]
    pub bed_actual: f64,
    #[serde(rename = "gcode_line_num_no_comments")]
    pub gcode_line: Option<u64>,
    pub gcode_cmd: Option<String>,
    pub nozzle_tip_coords_x: i64,
    pub nozzle_tip_coords_y: i64,
    pub flip_h: bool,
    pub flip_v: bool,
    pub rotate: bool,
}

/// Append-only CSV print log, flushed after every row.
pub struct CsvLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvLog {
    /// Create the log at `path` and write the header row.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| StorageError::io(&path, e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .write_record(CSV_HEADERS)
            .map_err(|e| csv_error(&path, e))?;
        writer.flush().map_err(|e| StorageError::io(&path, e))?;
        Ok(Self { path, writer })
    }

    pub fn append(&mut self, sample: &TelemetrySample) -> Result<(), StorageError> {
        self.writer
            .serialize(sample)
            .map_err(|e| csv_error(&self.path, e))?;
        self.writer
            .flush()
            .map_err(|e| StorageError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the log, returning its path.
    pub fn close(mut self) -> Result<PathBuf, StorageError> {
        self.writer
            .flush()
            .map_err(|e| StorageError::io(&self.path, e))?;
        Ok(self.path)
    }
}

/// Read a print log back into samples, in file order.
pub fn read_samples(path: &Path) -> Result<Vec<TelemetrySample>, StorageError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| csv_error(path, e))?;
    reader
        .deserialize()
        .map(|row| row.map_err(|e| csv_error(path, e)))
        .collect()
}

fn csv_error(path: &Path, err: csv::Error) -> StorageError {
    StorageError::Csv {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// UTC timestamp with millisecond precision, e.g. `2024-01-01T00:00:00.000Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(count: u64, line: Option<u64>, cmd: Option<&str>) -> TelemetrySample {
        TelemetrySample {
            count,
            timestamp: format!("2024-01-01T00:00:0{}.000Z", count),
            flow_rate: 100,
            feed_rate: 95,
            z_offset: -0.125,
            hotend_target: 215.0,
            hotend_actual: 214.3,
            bed_target: 60.0,
            bed_actual: 59.87,
            gcode_line: line,
            gcode_cmd: cmd.map(str::to_string),
            nozzle_tip_coords_x: 10,
            nozzle_tip_coords_y: -4,
            flip_h: true,
            flip_v: false,
            rotate: true,
        }
    }

    #[test]
    fn test_csv_round_trip_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("print_log.csv");
        let rows = vec![
            sample(0, None, None),
            sample(1, Some(12), Some("G1 X10.5 Y3 E0.02")),
            sample(2, Some(40), Some("M106 S255")),
        ];

        let mut log = CsvLog::create(&path).unwrap();
        for row in &rows {
            log.append(row).unwrap();
        }
        let closed = log.close().unwrap();
        assert_eq!(closed, path);

        assert_eq!(read_samples(&path).unwrap(), rows);
    }

    #[test]
    fn test_header_written_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("print_log.csv");
        let _log = CsvLog::create(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim_end(), CSV_HEADERS.join(","));
    }

    #[test]
    fn test_rows_are_durable_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("print_log.csv");
        let mut log = CsvLog::create(&path).unwrap();
        log.append(&sample(0, Some(1), Some("G28"))).unwrap();
        assert_eq!(read_samples(log.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(format_timestamp(at), "2024-01-01T00:00:00.000Z");
    }
}
