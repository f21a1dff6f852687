//! Keyword snapshot: the full keyword payload flattened into one wide row.
//!
//! Loaded into `{campaign_id}_keywords` next to the SERP table. Upstream
//! marks unknown values with `"N/A"`; those become nulls. Missing metric
//! blocks default to zero, missing landing pages to an empty string.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::Campaign;
use crate::schema::{clean_value, id_string};
use crate::warehouse::{Destination, FieldSchema, FieldType, LoadBatch, TableSchema};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordSnapshotRow {
    pub campaign_id: String,
    pub location_name: String,
    pub date: NaiveDate,
    pub keyword_id: String,
    pub keyword: Option<String>,
    pub main_keyword_id: Option<String>,
    pub search_intent: Option<String>,
    pub labels: Option<String>,
    pub groups: Option<String>,
    pub search_volume: Option<i64>,
    pub year_over_year: Option<f64>,
    pub current_desktop_landing_page: Option<String>,
    pub desired_desktop_landing_page: Option<String>,
    pub current_mobile_landing_page: Option<String>,
    pub desired_mobile_landing_page: Option<String>,
    pub rank_desktop: Option<i64>,
    pub rank_mobile: Option<i64>,
    pub traffic_sessions: Option<i64>,
    pub transactions: Option<i64>,
    pub ecommerce_revenue: Option<f64>,
    pub goal_completions: Option<i64>,
    pub goal_revenue: Option<f64>,
    pub opportunity_score: Option<f64>,
    pub opportunity_difficulty: Option<String>,
    pub opportunity_avg_cpc: Option<f64>,
    pub additional_monthly_sessions: Option<i64>,
}

pub fn snapshot_schema() -> TableSchema {
    let string = |name| FieldSchema::nullable(name, FieldType::String);
    let integer = |name| FieldSchema::nullable(name, FieldType::Integer);
    let float = |name| FieldSchema::nullable(name, FieldType::Float);

    TableSchema::new(vec![
        FieldSchema::required("campaign_id", FieldType::String),
        string("location_name"),
        FieldSchema::required("date", FieldType::Date),
        FieldSchema::required("keyword_id", FieldType::String),
        string("keyword"),
        string("main_keyword_id"),
        string("search_intent"),
        string("labels"),
        string("groups"),
        integer("search_volume"),
        float("year_over_year"),
        string("current_desktop_landing_page"),
        string("desired_desktop_landing_page"),
        string("current_mobile_landing_page"),
        string("desired_mobile_landing_page"),
        integer("rank_desktop"),
        integer("rank_mobile"),
        integer("traffic_sessions"),
        integer("transactions"),
        float("ecommerce_revenue"),
        integer("goal_completions"),
        float("goal_revenue"),
        float("opportunity_score"),
        string("opportunity_difficulty"),
        float("opportunity_avg_cpc"),
        integer("additional_monthly_sessions"),
    ])
}

/// How a field behaves when the upstream omits it entirely.
#[derive(Clone, Copy)]
enum Missing {
    Null,
    Zero,
    Empty,
}

/// Flatten one raw keyword record. Records without a keyword id are skipped.
pub fn snapshot_row(record: &Value, campaign: &Campaign, date: NaiveDate) -> Option<KeywordSnapshotRow> {
    let keyword_id = record.get("keyword_id").and_then(id_string)?;
    let at = |pointer: &str| record.pointer(pointer);

    Some(KeywordSnapshotRow {
        campaign_id: campaign.id.clone(),
        location_name: campaign.name.clone(),
        date,
        keyword_id,
        keyword: text(at("/keyword"), Missing::Null),
        main_keyword_id: clean_value(at("/main_keyword_id")).and_then(id_string),
        search_intent: text(at("/search_intent"), Missing::Null),
        labels: text(at("/labels"), Missing::Null),
        groups: text(at("/groups"), Missing::Null),
        search_volume: integer(at("/search_data/search_volume"), Missing::Zero),
        year_over_year: float(at("/search_data/year_over_year"), Missing::Zero),
        current_desktop_landing_page: text(at("/landing_pages/desktop/current"), Missing::Empty),
        desired_desktop_landing_page: text(at("/landing_pages/desktop/desired"), Missing::Empty),
        current_mobile_landing_page: text(at("/landing_pages/mobile/current"), Missing::Empty),
        desired_mobile_landing_page: text(at("/landing_pages/mobile/desired"), Missing::Empty),
        rank_desktop: integer(at("/ranking_data/desktop/rank"), Missing::Null),
        rank_mobile: integer(at("/ranking_data/mobile/rank"), Missing::Null),
        traffic_sessions: integer(at("/traffic_data/sessions"), Missing::Zero),
        transactions: integer(at("/traffic_data/ecommerce/transactions"), Missing::Zero),
        ecommerce_revenue: float(at("/traffic_data/ecommerce/revenue"), Missing::Zero),
        goal_completions: integer(at("/traffic_data/goals/completions"), Missing::Zero),
        goal_revenue: float(at("/traffic_data/goals/revenue"), Missing::Zero),
        opportunity_score: float(at("/opportunity/score"), Missing::Zero),
        opportunity_difficulty: text(at("/opportunity/difficulty"), Missing::Empty),
        opportunity_avg_cpc: float(at("/opportunity/avg_cpc"), Missing::Zero),
        additional_monthly_sessions: integer(
            at("/opportunity/additional_monthly_sessions"),
            Missing::Zero,
        ),
    })
}

/// Build the snapshot batch for one campaign and day.
pub fn snapshot_batch(
    records: &[Value],
    campaign: &Campaign,
    date: NaiveDate,
    table: &str,
) -> Result<LoadBatch, serde_json::Error> {
    let rows: Vec<KeywordSnapshotRow> = records
        .iter()
        .filter_map(|record| snapshot_row(record, campaign, date))
        .collect();

    let dropped = records.len() - rows.len();
    if dropped > 0 {
        warn!(
            campaign_id = %campaign.id,
            "Dropped {} snapshot records without keyword_id", dropped
        );
    }

    let destination = Destination {
        table: table.to_string(),
        campaign_id: campaign.id.clone(),
        date,
    };
    LoadBatch::from_records(destination, &rows)
}

fn text(value: Option<&Value>, missing: Missing) -> Option<String> {
    let Some(value) = value else {
        return match missing {
            Missing::Empty => Some(String::new()),
            _ => None,
        };
    };
    match clean_value(Some(value))? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn integer(value: Option<&Value>, missing: Missing) -> Option<i64> {
    let Some(value) = value else {
        return matches!(missing, Missing::Zero).then_some(0);
    };
    match clean_value(Some(value))? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float(value: Option<&Value>, missing: Missing) -> Option<f64> {
    let Some(value) = value else {
        return matches!(missing, Missing::Zero).then_some(0.0);
    };
    match clean_value(Some(value))? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn campaign() -> Campaign {
        Campaign {
            id: "314477".to_string(),
            name: "Belfast".to_string(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 1).unwrap()
    }

    fn full_record() -> Value {
        json!({
            "keyword_id": 901,
            "keyword": "emergency plumber",
            "main_keyword_id": "N/A",
            "search_intent": "transactional",
            "labels": ["priority", "local"],
            "groups": "11,12",
            "search_data": {"search_volume": 1900, "year_over_year": -0.12},
            "landing_pages": {
                "desktop": {"current": "https://example.com/plumbing", "desired": "N/A"},
                "mobile": {"current": "https://example.com/m/plumbing", "desired": ""}
            },
            "ranking_data": {"desktop": {"rank": 4}, "mobile": {"rank": "N/A"}},
            "traffic_data": {
                "sessions": 320,
                "ecommerce": {"transactions": 5, "revenue": 412.5},
                "goals": {"completions": "N/A", "revenue": 0}
            },
            "opportunity": {"score": 71.2, "difficulty": "medium", "avg_cpc": 3.1, "additional_monthly_sessions": 140}
        })
    }

    #[test]
    fn test_snapshot_row_flattens_nested_blocks() {
        let row = snapshot_row(&full_record(), &campaign(), date()).unwrap();

        assert_eq!(row.keyword_id, "901");
        assert_eq!(row.location_name, "Belfast");
        assert_eq!(row.main_keyword_id, None);
        assert_eq!(row.labels.as_deref(), Some("priority,local"));
        assert_eq!(row.search_volume, Some(1900));
        assert_eq!(row.year_over_year, Some(-0.12));
        assert_eq!(row.desired_desktop_landing_page, None);
        assert_eq!(row.desired_mobile_landing_page.as_deref(), Some(""));
        assert_eq!(row.rank_desktop, Some(4));
        assert_eq!(row.rank_mobile, None);
        assert_eq!(row.transactions, Some(5));
        assert_eq!(row.ecommerce_revenue, Some(412.5));
        assert_eq!(row.goal_completions, None);
        assert_eq!(row.opportunity_difficulty.as_deref(), Some("medium"));
        assert_eq!(row.additional_monthly_sessions, Some(140));
    }

    #[test]
    fn test_missing_blocks_take_defaults() {
        let row = snapshot_row(&json!({"keyword_id": "7", "keyword": "bare"}), &campaign(), date()).unwrap();

        assert_eq!(row.search_volume, Some(0));
        assert_eq!(row.traffic_sessions, Some(0));
        assert_eq!(row.opportunity_score, Some(0.0));
        assert_eq!(row.current_desktop_landing_page.as_deref(), Some(""));
        assert_eq!(row.opportunity_difficulty.as_deref(), Some(""));
        assert_eq!(row.rank_desktop, None);
        assert_eq!(row.labels, None);
    }

    #[test]
    fn test_batch_skips_records_without_id_and_validates() {
        let records = vec![full_record(), json!({"keyword": "orphan"})];
        let batch = snapshot_batch(&records, &campaign(), date(), "314477_keywords").unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.destination().table, "314477_keywords");
        let schema = snapshot_schema();
        schema.validate(&batch.rows()[0]).unwrap();
        assert_eq!(batch.rows()[0]["date"], json!("2024-10-01"));
    }
}
