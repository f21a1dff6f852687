//! Local CSV sink: one file per table partition.
//!
//! Layout is `{dir}/{table}/date={YYYY-MM-DD}.csv`. Overwrite truncates the
//! partition file, append adds rows after the existing ones. Nulls are written
//! as empty cells.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::{Destination, Row, TableSchema, WarehouseSink, WriteMode};
use crate::error::SinkError;

pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn partition_path(&self, destination: &Destination) -> PathBuf {
        self.dir
            .join(&destination.table)
            .join(format!("date={}.csv", destination.date.format("%Y-%m-%d")))
    }
}

#[async_trait::async_trait]
impl WarehouseSink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write(
        &self,
        destination: &Destination,
        schema: &TableSchema,
        rows: &[Row],
        mode: WriteMode,
    ) -> Result<(), SinkError> {
        let path = self.partition_path(destination);
        let columns: Vec<&'static str> = schema.column_names().collect();
        let rows = rows.to_vec();

        tokio::task::spawn_blocking(move || write_partition(&path, &columns, &rows, mode))
            .await
            .map_err(|e| SinkError::Unavailable(format!("CSV writer task failed: {}", e)))?
    }
}

fn write_partition(
    path: &Path,
    columns: &[&'static str],
    rows: &[Row],
    mode: WriteMode,
) -> Result<(), SinkError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let has_content = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let (file, write_header) = match mode {
        WriteMode::Overwrite => (
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?,
            true,
        ),
        WriteMode::Append => (
            OpenOptions::new().create(true).append(true).open(path)?,
            !has_content,
        ),
    };

    let mut writer = csv::WriterBuilder::new().from_writer(file);
    if write_header {
        writer.write_record(columns)?;
    }

    for row in rows {
        writer.write_record(columns.iter().map(|column| cell(row.get(*column))))?;
    }
    writer.flush()?;

    debug!("Wrote {} rows to {:?} ({:?})", rows.len(), path, mode);
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{FieldSchema, FieldType};
    use chrono::NaiveDate;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldSchema::required("keyword_id", FieldType::String),
            FieldSchema::nullable("rank", FieldType::Integer),
            FieldSchema::required("device", FieldType::String),
        ])
    }

    fn row(id: &str, rank: Value, device: &str) -> Row {
        match json!({"keyword_id": id, "rank": rank, "device": device}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn temp_sink() -> (CsvSink, PathBuf) {
        let dir = std::env::temp_dir().join(format!("rankflux-csv-{}", uuid::Uuid::new_v4()));
        (CsvSink::new(&dir), dir)
    }

    fn destination() -> Destination {
        Destination {
            table: "314469_serps".to_string(),
            campaign_id: "314469".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_overwrite_then_append() {
        let (sink, dir) = temp_sink();
        let dest = destination();

        sink.write(&dest, &schema(), &[row("stale", json!(9), "Desktop")], WriteMode::Overwrite)
            .await
            .unwrap();
        sink.write(&dest, &schema(), &[row("k1", json!(1), "Desktop")], WriteMode::Overwrite)
            .await
            .unwrap();
        sink.write(&dest, &schema(), &[row("k1", Value::Null, "Mobile")], WriteMode::Append)
            .await
            .unwrap();

        let path = sink.partition_path(&dest);
        assert!(path.ends_with("314469_serps/date=2024-10-01.csv"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "keyword_id,rank,device\nk1,1,Desktop\nk1,,Mobile\n");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_append_to_missing_partition_writes_header() {
        let (sink, dir) = temp_sink();
        let dest = destination();

        sink.write(&dest, &schema(), &[row("k2", json!(4), "Mobile")], WriteMode::Append)
            .await
            .unwrap();

        let content = std::fs::read_to_string(sink.partition_path(&dest)).unwrap();
        assert_eq!(content, "keyword_id,rank,device\nk2,4,Mobile\n");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_with_no_rows_clears_partition() {
        let (sink, dir) = temp_sink();
        let dest = destination();

        sink.write(&dest, &schema(), &[row("k1", json!(1), "Desktop")], WriteMode::Overwrite)
            .await
            .unwrap();
        sink.write(&dest, &schema(), &[], WriteMode::Overwrite)
            .await
            .unwrap();

        let content = std::fs::read_to_string(sink.partition_path(&dest)).unwrap();
        assert_eq!(content, "keyword_id,rank,device\n");

        std::fs::remove_dir_all(dir).unwrap();
    }
}
