//! Merge per-device top results onto augmented keywords.

use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::warn;

use crate::config::Campaign;
use crate::schema::{AugmentedKeyword, Device, SerpRecord, SerpResult};
use crate::warehouse::{Destination, FieldSchema, FieldType, LoadBatch, TableSchema};

/// Column layout of the `{campaign_id}_serps` table.
pub fn serp_schema() -> TableSchema {
    TableSchema::new(vec![
        FieldSchema::required("campaign_id", FieldType::String),
        FieldSchema::nullable("location_name", FieldType::String),
        FieldSchema::required("date", FieldType::Date),
        FieldSchema::required("keyword_id", FieldType::String),
        FieldSchema::nullable("keyword", FieldType::String),
        FieldSchema::nullable("main_keyword_id", FieldType::String),
        FieldSchema::nullable("search_intent", FieldType::String),
        FieldSchema::nullable("groups", FieldType::String),
        FieldSchema::nullable("search_volume", FieldType::Integer),
        FieldSchema::nullable("rank", FieldType::Integer),
        FieldSchema::nullable("domain", FieldType::String),
        FieldSchema::nullable("landing_page", FieldType::String),
        FieldSchema::nullable("title", FieldType::String),
        FieldSchema::nullable("description", FieldType::String),
        FieldSchema::nullable("variant_flag", FieldType::Boolean),
        FieldSchema::nullable("group_name", FieldType::String),
        FieldSchema::nullable("parent_group_id", FieldType::String),
        FieldSchema::nullable("main_keyword", FieldType::String),
        FieldSchema::required("device", FieldType::String),
    ])
}

/// Left join of `results` onto `keywords` for one device.
///
/// Every keyword appears at least once; unranked keywords carry null SERP
/// fields. Results for keyword ids outside `keywords` are dropped.
pub fn merge(
    keywords: &[AugmentedKeyword],
    results: &[SerpResult],
    device: Device,
    campaign: &Campaign,
    date: NaiveDate,
    table: &str,
) -> Result<LoadBatch, serde_json::Error> {
    let mut by_keyword: HashMap<&str, Vec<&SerpResult>> = HashMap::new();
    for result in results {
        by_keyword
            .entry(result.keyword_id.as_str())
            .or_default()
            .push(result);
    }

    let mut records = Vec::with_capacity(keywords.len().max(results.len()));
    for keyword in keywords {
        match by_keyword.remove(keyword.keyword_id.as_str()) {
            Some(matched) => {
                for result in matched {
                    records.push(record(keyword, Some(result), device, campaign, date));
                }
            }
            None => records.push(record(keyword, None, device, campaign, date)),
        }
    }

    let orphans: usize = by_keyword.values().map(Vec::len).sum();
    if orphans > 0 {
        warn!(
            campaign_id = %campaign.id,
            device = device.as_str(),
            "Dropped {} SERP results for keywords outside this fetch",
            orphans
        );
    }

    let destination = Destination {
        table: table.to_string(),
        campaign_id: campaign.id.clone(),
        date,
    };
    LoadBatch::from_records(destination, &records)
}

fn record(
    keyword: &AugmentedKeyword,
    result: Option<&SerpResult>,
    device: Device,
    campaign: &Campaign,
    date: NaiveDate,
) -> SerpRecord {
    SerpRecord {
        campaign_id: campaign.id.clone(),
        location_name: campaign.name.clone(),
        date,
        keyword_id: keyword.keyword_id.clone(),
        keyword: keyword.keyword.clone(),
        main_keyword_id: keyword.main_keyword_id.clone(),
        search_intent: result.and_then(|r| r.search_intent.clone()),
        groups: keyword.groups.clone(),
        search_volume: keyword.search_volume,
        rank: result.and_then(|r| r.rank),
        domain: result.and_then(|r| r.domain.clone()),
        landing_page: result.and_then(|r| r.landing_page.clone()),
        title: result.and_then(|r| r.title.clone()),
        description: result.and_then(|r| r.description.clone()),
        variant_flag: keyword.variant_flag,
        group_name: keyword.group_name.clone(),
        parent_group_id: keyword.parent_group_id.clone(),
        main_keyword: keyword.main_keyword.clone(),
        device: device.label().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn campaign() -> Campaign {
        Campaign {
            id: "314469".to_string(),
            name: "London".to_string(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 1).unwrap()
    }

    fn keyword(id: &str, main: Option<&str>) -> AugmentedKeyword {
        AugmentedKeyword {
            keyword_id: id.to_string(),
            keyword: format!("keyword {}", id),
            main_keyword_id: main.map(str::to_string),
            search_volume: Some(880),
            variant_flag: main.is_some(),
            groups: "11,12".to_string(),
            group_name: "Shoes, Boots".to_string(),
            parent_group_id: "10".to_string(),
            main_keyword: main.map(|m| format!("keyword {}", m)),
        }
    }

    fn result(keyword_id: &str, rank: Option<u32>, domain: &str) -> SerpResult {
        SerpResult {
            keyword_id: keyword_id.to_string(),
            device: Device::Mobile,
            rank,
            domain: Some(domain.to_string()),
            landing_page: Some(format!("https://{}/", domain)),
            title: Some("Title".to_string()),
            description: None,
            search_intent: Some("commercial".to_string()),
        }
    }

    #[test]
    fn test_unranked_keyword_has_null_serp_fields() {
        let batch = merge(
            &[keyword("K1", None)],
            &[],
            Device::Desktop,
            &campaign(),
            date(),
            "314469_serps",
        )
        .unwrap();

        assert_eq!(batch.len(), 1);
        let row = &batch.rows()[0];
        for column in ["rank", "domain", "landing_page", "title", "description", "search_intent"] {
            assert_eq!(row[column], Value::Null, "{} should be null", column);
        }
        assert_eq!(row["keyword"], json!("keyword K1"));
        assert_eq!(row["group_name"], json!("Shoes, Boots"));
        assert_eq!(row["search_volume"], json!(880));
        assert_eq!(row["device"], json!("Desktop"));
        assert_eq!(row["date"], json!("2024-10-01"));
        assert_eq!(row["location_name"], json!("London"));
    }

    #[test]
    fn test_one_row_per_result_in_keyword_order() {
        let keywords = vec![keyword("K1", None), keyword("K2", Some("K1"))];
        let results = vec![
            result("K2", Some(3), "b.example"),
            result("K1", Some(1), "a.example"),
            result("K2", Some(7), "c.example"),
        ];
        let batch = merge(&keywords, &results, Device::Mobile, &campaign(), date(), "t").unwrap();

        let rows: Vec<(&str, i64)> = batch
            .rows()
            .iter()
            .map(|r| (r["keyword_id"].as_str().unwrap(), r["rank"].as_i64().unwrap()))
            .collect();
        assert_eq!(rows, vec![("K1", 1), ("K2", 3), ("K2", 7)]);
        assert!(batch.rows().iter().all(|r| r["device"] == json!("Mobile")));
        assert_eq!(batch.rows()[1]["main_keyword"], json!("keyword K1"));
        assert_eq!(batch.rows()[1]["variant_flag"], json!(true));
    }

    #[test]
    fn test_orphan_results_are_dropped() {
        let batch = merge(
            &[keyword("K1", None)],
            &[result("K9", Some(2), "x.example")],
            Device::Mobile,
            &campaign(),
            date(),
            "t",
        )
        .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.rows()[0]["keyword_id"], json!("K1"));
        assert_eq!(batch.rows()[0]["rank"], Value::Null);
    }

    #[test]
    fn test_rows_cover_every_schema_column() {
        let schema = serp_schema();
        let batch = merge(
            &[keyword("K1", None), keyword("K2", Some("K404"))],
            &[result("K1", None, "a.example")],
            Device::Desktop,
            &campaign(),
            date(),
            "t",
        )
        .unwrap();

        for row in batch.rows() {
            schema.validate(row).unwrap();
            let mut expected: Vec<&str> = schema.column_names().collect();
            expected.sort_unstable();
            let mut actual: Vec<&str> = row.keys().map(String::as_str).collect();
            actual.sort_unstable();
            assert_eq!(actual, expected);
        }
        assert_eq!(batch.destination().campaign_id, "314469");
    }
}
