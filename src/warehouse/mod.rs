//! Schema-validated loading into a partitioned warehouse.
//!
//! Defines the [`WarehouseSink`] trait so destinations (local CSV, BigQuery)
//! can be swapped by configuration, and the [`WarehouseLoader`] that filters
//! invalid rows before anything reaches a sink.

pub mod bigquery;
pub mod csv_sink;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{LoadError, SinkError};

/// One output row keyed by column name.
pub type Row = Map<String, Value>;

/// Column type, named as the warehouse names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Date => value
                .as_str()
                .is_some_and(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    Nullable,
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSchema {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub mode: FieldMode,
}

impl FieldSchema {
    pub const fn nullable(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            mode: FieldMode::Nullable,
        }
    }

    pub const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            mode: FieldMode::Required,
        }
    }
}

/// Fixed, ordered column layout of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// Check one row against the schema, describing the first violation.
    pub fn validate(&self, row: &Row) -> Result<(), String> {
        if let Some(unknown) = row
            .keys()
            .find(|key| !self.fields.iter().any(|f| f.name == key.as_str()))
        {
            return Err(format!("unknown column {}", unknown));
        }

        for field in &self.fields {
            match row.get(field.name) {
                None | Some(Value::Null) => {
                    if field.mode == FieldMode::Required {
                        return Err(format!("{} is required", field.name));
                    }
                }
                Some(value) if !field.field_type.accepts(value) => {
                    return Err(format!(
                        "{} expects {:?}, got {}",
                        field.name, field.field_type, value
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Partition a batch is written to: one table per campaign, one partition per day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Destination {
    pub table: String,
    pub campaign_id: String,
    pub date: NaiveDate,
}

/// How a write treats rows already in the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Replace the partition's contents.
    Overwrite,
    Append,
}

/// Immutable rows bound for one destination partition.
#[derive(Debug, Clone)]
pub struct LoadBatch {
    destination: Destination,
    rows: Vec<Row>,
}

impl LoadBatch {
    pub fn new(destination: Destination, rows: Vec<Row>) -> Self {
        Self { destination, rows }
    }

    /// Serialize typed records into rows; each must serialize to an object.
    pub fn from_records<T: Serialize>(
        destination: Destination,
        records: &[T],
    ) -> Result<Self, serde_json::Error> {
        let rows = records
            .iter()
            .map(|record| match serde_json::to_value(record)? {
                Value::Object(map) => Ok(map),
                other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                    "record serialized to {} instead of an object",
                    other
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { destination, rows })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A destination that can persist validated rows.
#[async_trait::async_trait]
pub trait WarehouseSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(
        &self,
        destination: &Destination,
        schema: &TableSchema,
        rows: &[Row],
        mode: WriteMode,
    ) -> Result<(), SinkError>;
}

/// Result of a successful load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub table: String,
    pub mode: WriteMode,
    pub rows_loaded: usize,
    pub rows_rejected: usize,
}

/// Validates batches and hands the valid rows to a sink.
#[derive(Clone)]
pub struct WarehouseLoader {
    sink: Arc<dyn WarehouseSink>,
    max_bad_records: usize,
}

impl WarehouseLoader {
    pub fn new(sink: Arc<dyn WarehouseSink>, max_bad_records: usize) -> Self {
        Self {
            sink,
            max_bad_records,
        }
    }

    /// Load a batch, skipping up to `max_bad_records` invalid rows.
    ///
    /// Beyond the threshold nothing is written.
    pub async fn load(
        &self,
        batch: &LoadBatch,
        schema: &TableSchema,
        mode: WriteMode,
    ) -> Result<LoadOutcome, LoadError> {
        let destination = batch.destination();
        let mut valid: Vec<Row> = Vec::with_capacity(batch.len());
        let mut rejections: Vec<(usize, String)> = Vec::new();

        for (index, row) in batch.rows().iter().enumerate() {
            match schema.validate(row) {
                Ok(()) => valid.push(row.clone()),
                Err(reason) => rejections.push((index, reason)),
            }
        }

        if rejections.len() > self.max_bad_records {
            let (index, reason) = &rejections[0];
            return Err(LoadError::TooManyBadRecords {
                table: destination.table.clone(),
                rejected: rejections.len(),
                threshold: self.max_bad_records,
                first: format!("row {}: {}", index, reason),
            });
        }

        for (index, reason) in &rejections {
            warn!(table = %destination.table, "Skipping row {}: {}", index, reason);
        }

        self.sink
            .write(destination, schema, &valid, mode)
            .await?;

        info!(
            table = %destination.table,
            date = %destination.date,
            sink = self.sink.name(),
            "Loaded {} rows ({:?}, {} rejected)",
            valid.len(),
            mode,
            rejections.len()
        );

        Ok(LoadOutcome {
            table: destination.table.clone(),
            mode,
            rows_loaded: valid.len(),
            rows_rejected: rejections.len(),
        })
    }
}
