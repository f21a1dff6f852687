//! Group-level metrics: one row per group per campaign and day.
//!
//! The groups data endpoint returns a metrics document per group whose shape
//! varies with the account's enabled features. Identity columns are fixed;
//! everything else is flattened into dotted paths (`ranking.top_3`) and kept
//! as a single JSON object column.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::Campaign;
use crate::schema::{clean_value, id_string};
use crate::warehouse::{Destination, FieldSchema, FieldType, LoadBatch, TableSchema};

/// Keys lifted out of the metrics document into their own columns.
const IDENTITY_KEYS: [&str; 3] = ["group_id", "name", "type"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupDataRow {
    pub campaign_id: String,
    pub location_name: String,
    pub date: NaiveDate,
    pub group_id: String,
    pub group_name: Option<String>,
    pub group_type: Option<String>,
    /// Flattened metrics as a JSON object, keys sorted.
    pub metrics: String,
}

pub fn group_data_schema() -> TableSchema {
    TableSchema::new(vec![
        FieldSchema::required("campaign_id", FieldType::String),
        FieldSchema::nullable("location_name", FieldType::String),
        FieldSchema::required("date", FieldType::Date),
        FieldSchema::required("group_id", FieldType::String),
        FieldSchema::nullable("group_name", FieldType::String),
        FieldSchema::nullable("group_type", FieldType::String),
        FieldSchema::required("metrics", FieldType::String),
    ])
}

/// Flatten nested objects into dotted keys. Arrays and scalars are leaves;
/// `"N/A"` becomes null.
pub fn flatten_fields(record: &Value) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    let Value::Object(root) = record else {
        return fields;
    };

    let mut stack: Vec<(String, &Value)> = root
        .iter()
        .map(|(key, value)| (key.clone(), value))
        .collect();

    while let Some((path, value)) = stack.pop() {
        match value {
            Value::Object(children) if !children.is_empty() => {
                for (key, child) in children {
                    stack.push((format!("{}.{}", path, key), child));
                }
            }
            other => {
                let leaf = clean_value(Some(other)).cloned().unwrap_or(Value::Null);
                fields.insert(path, leaf);
            }
        }
    }
    fields
}

/// Build one row. Records without a group id are skipped.
pub fn group_data_row(
    record: &Value,
    campaign: &Campaign,
    date: NaiveDate,
) -> Result<Option<GroupDataRow>, serde_json::Error> {
    let Some(group_id) = record.get("group_id").and_then(id_string) else {
        return Ok(None);
    };
    let label = |key: &str| {
        clean_value(record.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let mut metrics = flatten_fields(record);
    for key in IDENTITY_KEYS {
        metrics.remove(key);
    }

    Ok(Some(GroupDataRow {
        campaign_id: campaign.id.clone(),
        location_name: campaign.name.clone(),
        date,
        group_id,
        group_name: label("name"),
        group_type: label("type"),
        metrics: serde_json::to_string(&metrics)?,
    }))
}

/// Build the group metrics batch for one campaign and day.
pub fn group_data_batch(
    records: &[Value],
    campaign: &Campaign,
    date: NaiveDate,
    table: &str,
) -> Result<LoadBatch, serde_json::Error> {
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        if let Some(row) = group_data_row(record, campaign, date)? {
            rows.push(row);
        }
    }

    let dropped = records.len() - rows.len();
    if dropped > 0 {
        warn!(
            campaign_id = %campaign.id,
            "Dropped {} group data records without group_id", dropped
        );
    }

    let destination = Destination {
        table: table.to_string(),
        campaign_id: campaign.id.clone(),
        date,
    };
    LoadBatch::from_records(destination, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn campaign() -> Campaign {
        Campaign {
            id: "314470".to_string(),
            name: "Birmingham".to_string(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 2).unwrap()
    }

    fn record() -> Value {
        json!({
            "group_id": 11,
            "name": "Plumbing",
            "type": "folder",
            "keywords_count": 42,
            "search_visibility": {"desktop": 31.5, "mobile": "N/A"},
            "ranking": {"desktop": {"top_3": 4, "top_10": 9}, "mobile": {}},
            "labels": ["core", "local"]
        })
    }

    #[test]
    fn test_flatten_fields_uses_dotted_paths() {
        let fields = flatten_fields(&record());

        assert_eq!(fields["keywords_count"], json!(42));
        assert_eq!(fields["search_visibility.desktop"], json!(31.5));
        assert_eq!(fields["search_visibility.mobile"], Value::Null);
        assert_eq!(fields["ranking.desktop.top_3"], json!(4));
        assert_eq!(fields["ranking.desktop.top_10"], json!(9));
        assert_eq!(fields["ranking.mobile"], json!({}));
        assert_eq!(fields["labels"], json!(["core", "local"]));
        assert!(!fields.contains_key("ranking"));
    }

    #[test]
    fn test_group_data_row_splits_identity_from_metrics() {
        let row = group_data_row(&record(), &campaign(), date()).unwrap().unwrap();

        assert_eq!(row.group_id, "11");
        assert_eq!(row.location_name, "Birmingham");
        assert_eq!(row.group_name.as_deref(), Some("Plumbing"));
        assert_eq!(row.group_type.as_deref(), Some("folder"));

        let metrics: Value = serde_json::from_str(&row.metrics).unwrap();
        assert_eq!(metrics["ranking.desktop.top_3"], json!(4));
        assert!(metrics.get("group_id").is_none());
        assert!(metrics.get("name").is_none());
    }

    #[test]
    fn test_batch_skips_records_without_id_and_validates() {
        let records = vec![record(), json!({"name": "no id", "keywords_count": 3})];
        let batch = group_data_batch(&records, &campaign(), date(), "314470_groups").unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.destination().table, "314470_groups");
        group_data_schema().validate(&batch.rows()[0]).unwrap();
        assert_eq!(batch.rows()[0]["date"], json!("2024-10-02"));
        assert_eq!(batch.rows()[0]["group_id"], json!("11"));
    }
}
