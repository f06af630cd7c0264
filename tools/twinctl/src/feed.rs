//! Live telemetry from a line-oriented reader
//!
//! Rows use the telemetry file layout (`timestamp,point_id,value`). A header
//! row is skipped, malformed rows are logged and skipped.

use csv::{ReaderBuilder, StringRecord, Trim};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use twinrule_engine::{parse_row, TelemetryRecord};

/// Split one CSV line; quoted fields may hold commas
fn split_line(line: &str) -> Option<StringRecord> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(line.as_bytes());
    reader.records().next().and_then(|r| r.ok())
}

fn parse_line(line: &str) -> Option<Result<TelemetryRecord, String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("timestamp,") {
        return None;
    }
    Some(match split_line(line) {
        Some(row) => parse_row(&row),
        None => Err("unreadable row".to_string()),
    })
}

/// Forward rows until EOF or the receiver goes away; returns rows skipped
pub async fn forward<R>(reader: R, tx: mpsc::Sender<TelemetryRecord>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut skipped = 0;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_line(&line) {
            None => continue,
            Some(Ok(record)) => {
                if tx.send(record).await.is_err() {
                    debug!("Engine stopped reading, closing feed");
                    break;
                }
            },
            Some(Err(e)) => {
                warn!("Input line {}: {}", line_no, e);
                skipped += 1;
            },
        }
    }
    Ok(skipped)
}
