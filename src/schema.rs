//! Domain records assembled by the pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device a SERP snapshot was taken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Desktop,
    Mobile,
}

impl Device {
    /// Load order within one run: the first device overwrites the partition.
    pub const ALL: [Device; 2] = [Device::Desktop, Device::Mobile];

    /// Query parameter value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Desktop => "desktop",
            Device::Mobile => "mobile",
        }
    }

    /// Label stamped on output rows.
    pub fn label(&self) -> &'static str {
        match self {
            Device::Desktop => "Desktop",
            Device::Mobile => "Mobile",
        }
    }
}

/// A tracked keyword as fetched for one campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub id: String,
    pub text: String,
    pub main_keyword_id: Option<String>,
    pub search_volume: Option<u64>,
    /// Group ids in upstream order, without duplicates.
    pub group_memberships: Vec<String>,
}

impl Keyword {
    pub fn is_variant(&self) -> bool {
        self.main_keyword_id.is_some()
    }
}

/// One group from the flattened tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatGroupRow {
    pub group_id: String,
    pub group_name: String,
    pub group_type: String,
    pub parent_id: Option<String>,
}

/// One ranked result for a keyword on a device.
#[derive(Debug, Clone, PartialEq)]
pub struct SerpResult {
    pub keyword_id: String,
    pub device: Device,
    pub rank: Option<u32>,
    pub domain: Option<String>,
    pub landing_page: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub search_intent: Option<String>,
}

/// Keyword joined with its groups and main keyword, before SERP data.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedKeyword {
    pub keyword_id: String,
    pub keyword: String,
    pub main_keyword_id: Option<String>,
    pub search_volume: Option<u64>,
    pub variant_flag: bool,
    /// Raw membership ids, comma separated.
    pub groups: String,
    /// Resolved group names, `", "`-joined in order of first occurrence.
    pub group_name: String,
    /// Parent ids of those groups, `", "`-joined in order of first occurrence.
    pub parent_group_id: String,
    pub main_keyword: Option<String>,
}

/// Final wide row written to the SERP table. Field order is column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SerpRecord {
    pub campaign_id: String,
    pub location_name: String,
    pub date: NaiveDate,
    pub keyword_id: String,
    pub keyword: String,
    pub main_keyword_id: Option<String>,
    pub search_intent: Option<String>,
    pub groups: String,
    pub search_volume: Option<u64>,
    pub rank: Option<u32>,
    pub domain: Option<String>,
    pub landing_page: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub variant_flag: bool,
    pub group_name: String,
    pub parent_group_id: String,
    pub main_keyword: Option<String>,
    pub device: String,
}

/// Normalize an upstream identifier (string or number) to a string.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Upstream marks unknown values with the literal `"N/A"`.
pub fn clean_value(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s == "N/A" => None,
        Some(v) => Some(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_string_accepts_numbers_and_strings() {
        assert_eq!(id_string(&json!(314477)), Some("314477".to_string()));
        assert_eq!(id_string(&json!(" 42 ")), Some("42".to_string()));
        assert_eq!(id_string(&json!("")), None);
        assert_eq!(id_string(&json!(null)), None);
        assert_eq!(id_string(&json!({"id": 1})), None);
    }

    #[test]
    fn test_clean_value_nulls_not_available() {
        let na = json!("N/A");
        let zero = json!(0);
        assert_eq!(clean_value(Some(&na)), None);
        assert_eq!(clean_value(Some(&zero)), Some(&zero));
        assert_eq!(clean_value(None), None);
    }

    #[test]
    fn test_device_labels() {
        assert_eq!(Device::Desktop.as_str(), "desktop");
        assert_eq!(Device::Mobile.label(), "Mobile");
        assert_eq!(Device::ALL[0], Device::Desktop);
    }
}
