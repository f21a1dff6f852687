//! Rankflux Ingest - rank-tracker keyword and SERP ingestion into a partitioned warehouse.

mod augment;
mod config;
mod error;
mod group_data;
mod groups;
mod paging;
mod pipeline;
mod rank_tracker;
mod schema;
mod serp;
mod snapshot;
mod warehouse;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use config::{PipelineConfig, SinkConfig};
use pipeline::{date_range, Pipeline, RunReport};
use rank_tracker::RankTrackerClient;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warehouse::bigquery::BigQuerySink;
use warehouse::csv_sink::CsvSink;
use warehouse::WarehouseSink;

/// Upper bound on dates in one backfill request.
const MAX_BACKFILL_DAYS: usize = 366;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "rankflux_ingest=debug,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("PIPELINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("configs/pipeline.json"));
    let config = PipelineConfig::load(&config_path)?;

    let client = RankTrackerClient::new(&config.api)?;
    info!("Rank tracker client initialized ({})", config.api.base_url);

    let sink: Arc<dyn WarehouseSink> = match &config.sink {
        SinkConfig::Csv { dir } => {
            info!("Writing partitions under {:?}", dir);
            Arc::new(CsvSink::new(dir))
        }
        SinkConfig::Bigquery {
            project_id,
            dataset_id,
            key_path,
        } => {
            info!("Loading into BigQuery dataset {}.{}", project_id, dataset_id);
            Arc::new(BigQuerySink::from_key_file(
                project_id.as_str(),
                dataset_id.as_str(),
                key_path,
            )?)
        }
    };

    let state = AppState {
        pipeline: Arc::new(Pipeline::new(config, Arc::new(client), sink)),
    };
    info!(
        "Pipeline ready: {} campaigns, concurrency {}",
        state.pipeline.config().campaigns.len(),
        state.pipeline.config().concurrency
    );

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/run", post(run))
        .route("/backfill", post(backfill))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Run server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    /// Defaults to today (UTC).
    date: Option<NaiveDate>,
    /// Defaults to every configured campaign.
    campaigns: Option<Vec<String>>,
}

/// Ingest one day for the selected campaigns.
async fn run(
    State(state): State<AppState>,
    body: Option<Json<RunRequest>>,
) -> Result<Json<RunReport>, (StatusCode, String)> {
    let Json(request) = body.unwrap_or_default();
    let date = request.date.unwrap_or_else(|| Utc::now().date_naive());

    trigger(&state, request.campaigns.as_deref(), &[date]).await
}

#[derive(Debug, Deserialize)]
struct BackfillRequest {
    start_date: NaiveDate,
    end_date: NaiveDate,
    campaigns: Option<Vec<String>>,
}

/// Ingest every day in an inclusive range.
async fn backfill(
    State(state): State<AppState>,
    Json(request): Json<BackfillRequest>,
) -> Result<Json<RunReport>, (StatusCode, String)> {
    let dates = date_range(request.start_date, request.end_date);
    if dates.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "end_date {} is before start_date {}",
                request.end_date, request.start_date
            ),
        ));
    }
    if dates.len() > MAX_BACKFILL_DAYS {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "Backfill spans {} days; at most {} per request",
                dates.len(),
                MAX_BACKFILL_DAYS
            ),
        ));
    }

    trigger(&state, request.campaigns.as_deref(), &dates).await
}

async fn trigger(
    state: &AppState,
    campaign_ids: Option<&[String]>,
    dates: &[NaiveDate],
) -> Result<Json<RunReport>, (StatusCode, String)> {
    let campaigns = state
        .pipeline
        .resolve_campaigns(campaign_ids)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let report = state.pipeline.run(&campaigns, dates).await;
    if report.failed > 0 {
        error!(
            "Run {} finished with {} failed campaign/date combinations",
            report.run_id, report.failed
        );
    }
    Ok(Json(report))
}
