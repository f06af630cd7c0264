//! Telemetry ingestion
//!
//! File format (header required):
//!
//! ```text
//! timestamp,point_id,value
//! 2024-03-01T00:00:00Z,PNT-SAT-1,13.5
//! 2024-03-01T00:00:00Z,PNT-FAN-1,true
//! 2024-03-01T00:00:00Z,PNT-MODE,"{""mode"":""cool""}"
//! ```
//!
//! Values parse as boolean, number, JSON object/array, or text. Malformed rows
//! are skipped with a warning and counted.

use crate::error::Result;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use twinrule_model::{PointValue, TimedValue};

/// One `(timestamp, point id, value)` sample
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub point_id: Arc<str>,
    pub value: TimedValue,
}

impl TelemetryRecord {
    pub fn new(point_id: &str, timestamp: DateTime<Utc>, value: impl Into<PointValue>) -> Self {
        Self {
            point_id: Arc::from(point_id),
            value: TimedValue::new(timestamp, value),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.value.timestamp
    }
}

/// Records read from a telemetry file
#[derive(Debug, Clone, Default)]
pub struct TelemetryBatch {
    pub records: Vec<TelemetryRecord>,
    pub skipped: usize,
}

/// Parse one CSV row
pub fn parse_row(row: &StringRecord) -> std::result::Result<TelemetryRecord, String> {
    let (Some(timestamp), Some(point_id), Some(raw)) = (row.get(0), row.get(1), row.get(2)) else {
        return Err(format!("expected 3 columns, found {}", row.len()));
    };
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| format!("bad timestamp '{}': {}", timestamp, e))?
        .with_timezone(&Utc);
    if point_id.is_empty() {
        return Err("empty point id".to_string());
    }
    Ok(TelemetryRecord::new(point_id, timestamp, PointValue::parse_raw(raw)))
}

/// Read every row, skipping malformed ones
pub fn read_csv<R: Read>(reader: R) -> Result<TelemetryBatch> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut batch = TelemetryBatch::default();
    for (index, result) in rdr.records().enumerate() {
        // header is line 1
        let line = index + 2;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!("Telemetry line {}: {}", line, e);
                batch.skipped += 1;
                continue;
            },
        };
        match parse_row(&row) {
            Ok(record) => batch.records.push(record),
            Err(e) => {
                warn!("Telemetry line {}: {}", line, e);
                batch.skipped += 1;
            },
        }
    }
    Ok(batch)
}

pub async fn read_csv_file(path: &Path) -> Result<TelemetryBatch> {
    let content = tokio::fs::read(path).await?;
    let batch = read_csv(content.as_slice())?;
    info!(
        "Read {} telemetry records from {} ({} skipped)",
        batch.records.len(),
        path.display(),
        batch.skipped
    );
    Ok(batch)
}

/// Stable sort by timestamp; rows sharing a timestamp keep file order
pub fn sort_records(records: &mut [TelemetryRecord]) {
    records.sort_by_key(TelemetryRecord::timestamp);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_read_csv_value_kinds_and_bad_rows() {
        let input = "timestamp,point_id,value\n\
            2024-03-01T00:15:00Z,SAT,13.5\n\
            2024-03-01T00:00:00Z,FAN,true\n\
            not-a-date,SAT,1\n\
            2024-03-01T00:30:00Z,MODE,\"{\"\"mode\"\":\"\"cool\"\"}\"\n\
            2024-03-01T00:45:00Z,NOTE,filter dirty\n\
            2024-03-01T01:00:00Z,SAT\n";

        let batch = read_csv(input.as_bytes()).unwrap();
        assert_eq!(batch.records.len(), 4);
        assert_eq!(batch.skipped, 2);
        assert!(logs_contain("bad timestamp"));

        assert_eq!(batch.records[0].value.value, PointValue::Number(13.5));
        assert_eq!(batch.records[1].value.value, PointValue::Bool(true));
        assert_eq!(
            batch.records[2].value.value,
            PointValue::Json(serde_json::json!({"mode": "cool"}))
        );
        assert_eq!(batch.records[3].value.value, PointValue::Text("filter dirty".into()));
    }

    #[test]
    fn test_sort_is_stable() {
        let t = |m| Utc.with_ymd_and_hms(2024, 3, 1, 0, m, 0).unwrap();
        let mut records = vec![
            TelemetryRecord::new("b", t(5), 1.0),
            TelemetryRecord::new("a", t(0), 2.0),
            TelemetryRecord::new("c", t(5), 3.0),
        ];
        sort_records(&mut records);
        let ids: Vec<&str> = records.iter().map(|r| &*r.point_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_read_csv_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "timestamp,point_id,value\n2024-03-01T00:00:00+10:00,SAT,1\n").unwrap();
        let batch = read_csv_file(file.path()).await.unwrap();
        assert_eq!(
            batch.records[0].timestamp(),
            Utc.with_ymd_and_hms(2024, 2, 29, 14, 0, 0).unwrap()
        );
    }
}
