//! Per campaign/date orchestration of fetch, flatten, join and load.
//!
//! Each (campaign, date) combination is independent: they run concurrently
//! up to `concurrency`, each bounded by `run_timeout_secs`, and a failure in
//! one never stops the others. Within a combination the desktop batch
//! overwrites the partition and the mobile batch is appended after it.
//! Keyword, group and group data fetches all run before the first write, so
//! a rejected API key never truncates a partition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::augment::augment;
use crate::config::{table_name, Campaign, PipelineConfig};
use crate::error::PipelineError;
use crate::group_data::{group_data_batch, group_data_schema};
use crate::groups::flatten;
use crate::paging::FetchSummary;
use crate::rank_tracker::{
    fetch_group_data, fetch_groups, keyword_fetch, parse_keywords, parse_serp_records,
    serp_fetch, UpstreamApi,
};
use crate::schema::Device;
use crate::serp::{merge, serp_schema};
use crate::snapshot::{snapshot_batch, snapshot_schema};
use crate::warehouse::{LoadOutcome, WarehouseLoader, WarehouseSink, WriteMode};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed { error: String },
}

/// Outcome of one campaign/date combination.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignDateReport {
    pub campaign_id: String,
    pub location_name: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub status: RunStatus,
    pub fetches: Vec<FetchSummary>,
    pub loads: Vec<LoadOutcome>,
    pub elapsed_ms: u64,
}

impl CampaignDateReport {
    fn new(campaign: &Campaign, date: NaiveDate) -> Self {
        Self {
            campaign_id: campaign.id.clone(),
            location_name: campaign.name.clone(),
            date,
            status: RunStatus::Succeeded,
            fetches: Vec::new(),
            loads: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded)
    }
}

/// Aggregated outcome of one trigger.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<CampaignDateReport>,
}

pub struct Pipeline {
    api: Arc<dyn UpstreamApi>,
    loader: WarehouseLoader,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        api: Arc<dyn UpstreamApi>,
        sink: Arc<dyn WarehouseSink>,
    ) -> Self {
        let loader = WarehouseLoader::new(sink, config.load.max_bad_records);
        Self {
            api,
            loader,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Look up campaigns by id; `None` selects every configured campaign.
    pub fn resolve_campaigns(&self, ids: Option<&[String]>) -> Result<Vec<Campaign>, PipelineError> {
        match ids {
            None => Ok(self.config.campaigns.clone()),
            Some(ids) => ids
                .iter()
                .map(|id| {
                    self.config
                        .campaign(id)
                        .cloned()
                        .ok_or_else(|| PipelineError::UnknownCampaign(id.clone()))
                })
                .collect(),
        }
    }

    /// Run every campaign for every date. Results keep input order
    /// (campaign-major, then date).
    pub async fn run(&self, campaigns: &[Campaign], dates: &[NaiveDate]) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timeout = Duration::from_secs(self.config.run_timeout_secs);

        let jobs: Vec<(usize, Campaign, NaiveDate)> = campaigns
            .iter()
            .flat_map(|campaign| dates.iter().map(move |date| (campaign.clone(), *date)))
            .enumerate()
            .map(|(index, (campaign, date))| (index, campaign, date))
            .collect();

        info!(
            %run_id,
            "Starting run: {} campaigns x {} dates (concurrency {})",
            campaigns.len(),
            dates.len(),
            self.config.concurrency
        );

        let mut results: Vec<(usize, CampaignDateReport)> = stream::iter(jobs)
            .map(|(index, campaign, date)| async move {
                let started = Instant::now();
                let mut report = CampaignDateReport::new(&campaign, date);

                let outcome =
                    tokio::time::timeout(timeout, self.run_campaign_date(&campaign, date, &mut report))
                        .await
                        .unwrap_or_else(|_| Err(PipelineError::TimedOut(timeout.as_secs())));

                if let Err(e) = outcome {
                    error!(campaign_id = %campaign.id, %date, "Run failed: {}", e);
                    report.status = RunStatus::Failed {
                        error: e.to_string(),
                    };
                }
                report.elapsed_ms = started.elapsed().as_millis() as u64;
                (index, report)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        let results: Vec<CampaignDateReport> = results.into_iter().map(|(_, r)| r).collect();
        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        let failed = results.len() - succeeded;

        info!(%run_id, "Run finished: {} succeeded, {} failed", succeeded, failed);

        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
            results,
        }
    }

    /// Fetch, join and load one campaign for one day.
    ///
    /// Fetch summaries and load outcomes are recorded into `report` as they
    /// complete, so a failed or timed-out run still shows its progress.
    async fn run_campaign_date(
        &self,
        campaign: &Campaign,
        date: NaiveDate,
        report: &mut CampaignDateReport,
    ) -> Result<(), PipelineError> {
        info!(campaign_id = %campaign.id, %date, "Fetching keywords for {}", campaign.name);

        let fetch = &self.config.fetch;
        let (records, summary) =
            keyword_fetch(self.api.clone(), campaign, date, fetch.keyword_policy())
                .drain()
                .await
                .into_records()?;
        report.fetches.push(summary);
        let keywords = parse_keywords(&records);

        let roots = fetch_groups(self.api.as_ref(), campaign).await?;
        let groups = flatten(&roots)?;
        let augmented = augment(&keywords, &groups);
        info!(
            campaign_id = %campaign.id,
            %date,
            "{} keywords, {} groups",
            augmented.len(),
            groups.len()
        );

        // Fetched before the first write.
        let group_data = match &self.config.load.group_data_table {
            Some(template) => Some((
                table_name(template, &campaign.id),
                fetch_group_data(self.api.as_ref(), campaign, date).await?,
            )),
            None => None,
        };

        let table = table_name(&self.config.load.serp_table, &campaign.id);
        let schema = serp_schema();
        for (position, device) in Device::ALL.into_iter().enumerate() {
            let (serp_records, summary) =
                serp_fetch(self.api.clone(), campaign, device, date, fetch.serp_policy())
                    .drain()
                    .await
                    .into_records()?;
            report.fetches.push(summary);

            let results = parse_serp_records(&serp_records, device);
            let batch = merge(&augmented, &results, device, campaign, date, &table)?;
            let mode = if position == 0 {
                WriteMode::Overwrite
            } else {
                WriteMode::Append
            };
            let outcome = self.loader.load(&batch, &schema, mode).await?;
            report.loads.push(outcome);
        }

        if let Some(template) = &self.config.load.snapshot_table {
            let table = table_name(template, &campaign.id);
            let batch = snapshot_batch(&records, campaign, date, &table)?;
            let outcome = self
                .loader
                .load(&batch, &snapshot_schema(), WriteMode::Overwrite)
                .await?;
            report.loads.push(outcome);
        }

        if let Some((table, group_records)) = group_data {
            let batch = group_data_batch(&group_records, campaign, date, &table)?;
            let outcome = self
                .loader
                .load(&batch, &group_data_schema(), WriteMode::Overwrite)
                .await?;
            report.loads.push(outcome);
        }

        Ok(())
    }
}

/// Every day from `start` to `end`, inclusive. Empty when `end < start`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    if end < start {
        warn!("Empty date range: {} is after {}", start, end);
        return Vec::new();
    }
    start.iter_days().take_while(|day| *day <= end).collect()
}
