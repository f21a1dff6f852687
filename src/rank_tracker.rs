//! Rank-tracker REST API client and payload normalization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{ApiConfig, Campaign};
use crate::error::FetchError;
use crate::groups::GroupNode;
use crate::paging::{PagedFetch, RetryPolicy};
use crate::schema::{clean_value, id_string, Device, Keyword, SerpResult};

const KEYWORDS_PATH: &str = "/keywords";
const GROUPS_PATH: &str = "/groups";
const GROUP_DATA_PATH: &str = "/groups/data";
const TOP_RESULTS_PATH: &str = "/keywords/top-results";

/// Raw upstream answer. Non-200 bodies are carried as a JSON string.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

/// GET access to the rank-tracker API.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn get(&self, path: &str, query: &[(String, String)])
        -> Result<UpstreamResponse, FetchError>;
}

/// HTTP client for the rank-tracker API.
///
/// Requests from every concurrent pipeline run share one permit pool so the
/// upstream quota is respected regardless of campaign concurrency.
#[derive(Clone)]
pub struct RankTrackerClient {
    client: Client,
    base_url: String,
    api_key: String,
    permits: Arc<Semaphore>,
}

impl RankTrackerClient {
    pub fn new(config: &ApiConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            permits: Arc::new(Semaphore::new(config.max_in_flight_requests)),
        })
    }
}

#[async_trait]
impl UpstreamApi for RankTrackerClient {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<UpstreamResponse, FetchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let url = format!("{}{}", self.base_url, path);
        debug!("Requesting {} {:?}", url, query);

        let resp = self
            .client
            .get(&url)
            .header("Accept", "*/*")
            .header("Authorization", &self.api_key)
            .query(query)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            return Ok(UpstreamResponse {
                status,
                body: Value::String(text),
            });
        }

        let bytes = resp.bytes().await?;
        let body = decode_body(&bytes)?;
        Ok(UpstreamResponse { status, body })
    }
}

/// Parse a 200 body.
///
/// serde_json refuses input nested deeper than 128 levels. A group level
/// costs two (the node object and its `subgroups` array), so a group tree
/// more than about 60 levels deep fails here as `Decode` before
/// `groups::flatten` sees it.
pub fn decode_body(bytes: &[u8]) -> Result<Value, FetchError> {
    serde_json::from_slice(bytes).map_err(|e| FetchError::Decode(e.to_string()))
}

/// Paginated keyword listing for one campaign and day.
pub fn keyword_fetch(
    api: Arc<dyn UpstreamApi>,
    campaign: &Campaign,
    date: NaiveDate,
    policy: RetryPolicy,
) -> PagedFetch {
    let day = date.format("%Y-%m-%d").to_string();
    let filters = vec![
        ("campaign_id".to_string(), campaign.id.clone()),
        ("start_date".to_string(), day.clone()),
        ("end_date".to_string(), day),
        ("include_all_groups".to_string(), "true".to_string()),
    ];
    PagedFetch::new(api, "keywords", KEYWORDS_PATH, filters, policy)
}

/// Paginated top results for one campaign, device and day.
pub fn serp_fetch(
    api: Arc<dyn UpstreamApi>,
    campaign: &Campaign,
    device: Device,
    date: NaiveDate,
    policy: RetryPolicy,
) -> PagedFetch {
    let filters = vec![
        ("campaign_id".to_string(), campaign.id.clone()),
        ("device".to_string(), device.as_str().to_string()),
        ("date".to_string(), date.format("%Y-%m-%d").to_string()),
    ];
    PagedFetch::new(
        api,
        format!("top-results/{}", device.as_str()),
        TOP_RESULTS_PATH,
        filters,
        policy,
    )
}

/// Fetch the campaign's group forest.
pub async fn fetch_groups(
    api: &dyn UpstreamApi,
    campaign: &Campaign,
) -> Result<Vec<GroupNode>, FetchError> {
    let query = vec![("campaign_id".to_string(), campaign.id.clone())];
    let resp = api.get(GROUPS_PATH, &query).await?;

    if resp.status != 200 {
        return Err(FetchError::Upstream {
            status: resp.status,
            message: resp.body.as_str().unwrap_or_default().to_string(),
        });
    }

    let roots: Vec<GroupNode> = serde_json::from_value(resp.body)?;
    Ok(roots)
}

/// Fetch per-group metrics for one campaign and day.
///
/// The endpoint answers with an array of group documents; a single object is
/// accepted as a one-element array.
pub async fn fetch_group_data(
    api: &dyn UpstreamApi,
    campaign: &Campaign,
    date: NaiveDate,
) -> Result<Vec<Value>, FetchError> {
    let day = date.format("%Y-%m-%d").to_string();
    let query = vec![
        ("campaign_id".to_string(), campaign.id.clone()),
        ("start_date".to_string(), day.clone()),
        ("end_date".to_string(), day),
    ];
    let resp = api.get(GROUP_DATA_PATH, &query).await?;

    if resp.status != 200 {
        return Err(FetchError::Upstream {
            status: resp.status,
            message: resp.body.as_str().unwrap_or_default().to_string(),
        });
    }

    match resp.body {
        Value::Array(records) => Ok(records),
        Value::Object(_) => Ok(vec![resp.body]),
        Value::Null => Ok(Vec::new()),
        _ => Err(FetchError::Decode(
            "group data: expected an array or object".to_string(),
        )),
    }
}

/// Normalize one keyword record. Records without a keyword id are unusable.
pub fn parse_keyword(record: &Value) -> Option<Keyword> {
    let id = record.get("keyword_id").and_then(id_string)?;

    Some(Keyword {
        id,
        text: text_field(record, "keyword").unwrap_or_default(),
        main_keyword_id: clean_value(record.get("main_keyword_id")).and_then(id_string),
        search_volume: clean_value(record.pointer("/search_data/search_volume"))
            .and_then(Value::as_u64),
        group_memberships: parse_group_ids(record.get("groups")),
    })
}

/// Normalize a page of keyword records, dropping the ones without an id.
pub fn parse_keywords(records: &[Value]) -> Vec<Keyword> {
    let keywords: Vec<Keyword> = records.iter().filter_map(parse_keyword).collect();
    let dropped = records.len() - keywords.len();
    if dropped > 0 {
        warn!("Dropped {} keyword records without keyword_id", dropped);
    }
    keywords
}

/// `groups` arrives as a comma separated id string; arrays are tolerated.
fn parse_group_ids(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match clean_value(value) {
        Some(Value::String(s)) => s.split(',').map(|id| id.trim().to_string()).collect(),
        Some(Value::Array(items)) => items.iter().filter_map(id_string).collect(),
        Some(other) => id_string(other).into_iter().collect(),
        None => Vec::new(),
    };

    let mut ids: Vec<String> = Vec::with_capacity(raw.len());
    for id in raw {
        if !id.is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Flatten top-result entries into one row per ranked result.
pub fn parse_serp_records(records: &[Value], device: Device) -> Vec<SerpResult> {
    let mut results = Vec::new();
    let mut dropped = 0usize;

    for entry in records {
        let Some(keyword_id) = entry.get("keyword_id").and_then(id_string) else {
            dropped += 1;
            continue;
        };

        let Some(top) = entry.get("top_100_results").and_then(Value::as_array) else {
            continue;
        };

        for result in top {
            results.push(SerpResult {
                keyword_id: keyword_id.clone(),
                device,
                rank: parse_rank(result.get("rank")),
                domain: text_field(result, "domain"),
                landing_page: text_field(result, "landing_page"),
                title: text_field(result, "title"),
                description: text_field(result, "description"),
                search_intent: text_field(result, "search_intent"),
            });
        }
    }

    if dropped > 0 {
        warn!(
            device = device.as_str(),
            "Dropped {} SERP entries without keyword_id", dropped
        );
    }
    results
}

/// Ranks start at 1; anything else means unranked.
fn parse_rank(value: Option<&Value>) -> Option<u32> {
    let rank = match clean_value(value)? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(rank).ok().filter(|r| *r >= 1)
}

fn text_field(record: &Value, key: &str) -> Option<String> {
    clean_value(record.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}
