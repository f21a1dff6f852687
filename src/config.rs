//! Pipeline configuration.
//!
//! Loaded once from a JSON file (`configs/pipeline.json` by default) and passed
//! into the pipeline. Secrets come from the environment, never from the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::paging::RetryPolicy;

const DEFAULT_BASE_URL: &str = "https://apigw.seomonitor.com/v3/rank-tracker/v3.0";

/// Environment variable holding the upstream API key.
pub const API_KEY_VAR: &str = "RANK_TRACKER_API_KEY";

/// Top-level configuration for a pipeline deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub api: ApiConfig,
    pub campaigns: Vec<Campaign>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub load: LoadConfig,
    pub sink: SinkConfig,
    /// Campaign/date runs processed at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upper bound on one campaign/date run before it is abandoned.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

/// Upstream rank-tracker API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(skip)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Shared across all concurrent runs.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            max_in_flight_requests: default_max_in_flight(),
        }
    }
}

/// A tracked location/market.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Campaign {
    #[serde(deserialize_with = "de_campaign_id")]
    pub id: String,
    pub name: String,
}

/// Pagination and retry settings per resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_keyword_page_size")]
    pub keyword_page_size: u32,
    #[serde(default = "default_serp_page_size")]
    pub serp_page_size: u32,
    /// Circuit breaker against runaway SERP pagination.
    #[serde(default = "default_serp_max_offset")]
    pub serp_max_offset: u64,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Consecutive retryable responses at one offset before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_inter_page_delay_ms")]
    pub inter_page_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            keyword_page_size: default_keyword_page_size(),
            serp_page_size: default_serp_page_size(),
            serp_max_offset: default_serp_max_offset(),
            retry_delay_secs: default_retry_delay_secs(),
            max_retries: default_max_retries(),
            inter_page_delay_ms: default_inter_page_delay_ms(),
        }
    }
}

impl FetchConfig {
    pub fn keyword_policy(&self) -> RetryPolicy {
        RetryPolicy::keywords(self.keyword_page_size)
    }

    pub fn serp_policy(&self) -> RetryPolicy {
        RetryPolicy::serp(self.serp_page_size)
            .with_max_offset(self.serp_max_offset)
            .with_retry_delay(Duration::from_secs(self.retry_delay_secs))
            .with_max_retries(self.max_retries)
            .with_inter_page_delay(Duration::from_millis(self.inter_page_delay_ms))
    }
}

/// Load settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Invalid rows skipped before a batch fails.
    #[serde(default = "default_max_bad_records")]
    pub max_bad_records: usize,
    /// `{campaign_id}` is replaced with the campaign id.
    #[serde(default = "default_serp_table")]
    pub serp_table: String,
    /// Keyword snapshot table; the snapshot is skipped when unset.
    #[serde(default)]
    pub snapshot_table: Option<String>,
    /// Group metrics table; group data is not fetched when unset.
    #[serde(default)]
    pub group_data_table: Option<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_bad_records: default_max_bad_records(),
            serp_table: default_serp_table(),
            snapshot_table: None,
            group_data_table: None,
        }
    }
}

/// Resolve a `{campaign_id}` table template.
pub fn table_name(template: &str, campaign_id: &str) -> String {
    template.replace("{campaign_id}", campaign_id)
}

/// Destination warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Partitioned CSV files under a local directory.
    Csv { dir: PathBuf },
    /// BigQuery load jobs authenticated with a service account key.
    Bigquery {
        project_id: String,
        dataset_id: String,
        key_path: PathBuf,
    },
}

impl PipelineConfig {
    /// Load the config file and pull secrets from the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {:?}", path))?;

        let mut config = Self::from_json(&content)
            .with_context(|| format!("Failed to parse pipeline config: {:?}", path))?;

        config.api.api_key = std::env::var(API_KEY_VAR)
            .with_context(|| format!("{} environment variable not set", API_KEY_VAR))?;

        info!(
            "Loaded pipeline config from {:?}: {} campaigns",
            path,
            config.campaigns.len()
        );
        Ok(config)
    }

    /// Parse and validate a config document (without secrets).
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.campaigns.is_empty() {
            anyhow::bail!("No campaigns configured");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.api.max_in_flight_requests == 0 {
            anyhow::bail!("api.max_in_flight_requests must be at least 1");
        }
        if self.fetch.keyword_page_size == 0 || self.fetch.serp_page_size == 0 {
            anyhow::bail!("Page sizes must be positive");
        }
        if !self.load.serp_table.contains("{campaign_id}") {
            anyhow::bail!(
                "load.serp_table must contain {{campaign_id}}: {}",
                self.load.serp_table
            );
        }
        let optional_tables = [
            ("load.snapshot_table", &self.load.snapshot_table),
            ("load.group_data_table", &self.load.group_data_table),
        ];
        for (key, template) in optional_tables {
            if let Some(template) = template {
                if !template.contains("{campaign_id}") {
                    anyhow::bail!("{} must contain {{campaign_id}}: {}", key, template);
                }
            }
        }
        Ok(())
    }

    pub fn campaign(&self, id: &str) -> Option<&Campaign> {
        self.campaigns.iter().find(|c| c.id == id)
    }
}

fn de_campaign_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Text(String),
        Number(u64),
    }

    Ok(match IdRepr::deserialize(deserializer)? {
        IdRepr::Text(s) => s,
        IdRepr::Number(n) => n.to_string(),
    })
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_in_flight() -> usize {
    4
}

fn default_concurrency() -> usize {
    2
}

fn default_run_timeout_secs() -> u64 {
    30 * 60
}

fn default_keyword_page_size() -> u32 {
    1000
}

fn default_serp_page_size() -> u32 {
    100
}

fn default_serp_max_offset() -> u64 {
    10_000
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    10
}

fn default_inter_page_delay_ms() -> u64 {
    1000
}

fn default_max_bad_records() -> usize {
    10
}

fn default_serp_table() -> String {
    "{campaign_id}_serps".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let json = r#"{
            "campaigns": [{"id": 313717, "name": "United Kingdom"}, {"id": "314477", "name": "Belfast"}],
            "sink": {"kind": "csv", "dir": "out"}
        }"#;
        let config = PipelineConfig::from_json(json).unwrap();

        assert_eq!(config.campaigns[0].id, "313717");
        assert_eq!(config.campaigns[1].id, "314477");
        assert_eq!(config.fetch.keyword_page_size, 1000);
        assert_eq!(config.fetch.serp_page_size, 100);
        assert_eq!(config.fetch.serp_max_offset, 10_000);
        assert_eq!(config.load.max_bad_records, 10);
        assert_eq!(config.api.request_timeout_secs, 120);
        assert!(config.load.snapshot_table.is_none());
        assert!(config.load.group_data_table.is_none());
        assert!(matches!(config.sink, SinkConfig::Csv { .. }));
        assert_eq!(config.campaign("314477").unwrap().name, "Belfast");
    }

    #[test]
    fn test_bigquery_sink() {
        let json = r#"{
            "campaigns": [{"id": 1, "name": "A"}],
            "sink": {"kind": "bigquery", "project_id": "p", "dataset_id": "d", "key_path": "sa.json"}
        }"#;
        let config = PipelineConfig::from_json(json).unwrap();
        match config.sink {
            SinkConfig::Bigquery { project_id, dataset_id, .. } => {
                assert_eq!(project_id, "p");
                assert_eq!(dataset_id, "d");
            }
            other => panic!("unexpected sink {:?}", other),
        }
    }

    #[test]
    fn test_rejects_empty_campaigns() {
        let json = r#"{"campaigns": [], "sink": {"kind": "csv", "dir": "out"}}"#;
        assert!(PipelineConfig::from_json(json).is_err());
    }

    #[test]
    fn test_rejects_table_without_placeholder() {
        let json = r#"{
            "campaigns": [{"id": 1, "name": "A"}],
            "load": {"serp_table": "serps"},
            "sink": {"kind": "csv", "dir": "out"}
        }"#;
        assert!(PipelineConfig::from_json(json).is_err());
    }

    #[test]
    fn test_bundled_config_parses() {
        let config = PipelineConfig::from_json(include_str!("../configs/pipeline.json")).unwrap();
        assert_eq!(config.campaigns.len(), 12);
        assert_eq!(config.campaign("313717").unwrap().name, "United Kingdom");
        assert_eq!(config.load.snapshot_table.as_deref(), Some("{campaign_id}_keywords"));
        assert_eq!(config.load.group_data_table.as_deref(), Some("{campaign_id}_groups"));
    }

    #[test]
    fn test_rejects_group_data_table_without_placeholder() {
        let json = r#"{
            "campaigns": [{"id": 1, "name": "A"}],
            "load": {"group_data_table": "groups"},
            "sink": {"kind": "csv", "dir": "out"}
        }"#;
        let err = PipelineConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("load.group_data_table"), "{}", err);
    }

    #[test]
    fn test_table_name() {
        assert_eq!(table_name("{campaign_id}_serps", "314469"), "314469_serps");
    }

    #[test]
    fn test_serp_policy_from_config() {
        let fetch = FetchConfig {
            serp_max_offset: 500,
            max_retries: 3,
            ..FetchConfig::default()
        };
        let policy = fetch.serp_policy();
        assert_eq!(policy.page_size, 100);
        assert_eq!(policy.max_offset, Some(500));
        assert_eq!(policy.max_retries, 3);
        assert!(policy.retryable_statuses.contains(&524));
    }
}
