//! BigQuery sink using multipart load jobs.
//!
//! Rows are uploaded as newline-delimited JSON straight into a day partition
//! (`table$YYYYMMDD`), so `WRITE_TRUNCATE` replaces only that partition.
//! Authentication uses a service account key exchanged for an OAuth2 token.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Destination, Row, TableSchema, WarehouseSink, WriteMode};
use crate::error::SinkError;

const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_URL: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
const BOUNDARY: &str = "rankflux_load_boundary";

#[derive(Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

pub struct BigQuerySink {
    client: Client,
    project_id: String,
    dataset_id: String,
    sa_key: ServiceAccountKey,
    token_cache: Arc<Mutex<Option<CachedToken>>>,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl BigQuerySink {
    /// Build a sink from a service account JSON key file.
    pub fn from_key_file(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        key_path: &Path,
    ) -> anyhow::Result<Self> {
        let key_json = std::fs::read_to_string(key_path)
            .with_context(|| format!("Failed to read service account key: {:?}", key_path))?;
        let sa_key: ServiceAccountKey = serde_json::from_str(&key_json)
            .with_context(|| format!("Failed to parse service account key: {:?}", key_path))?;

        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(120)).build()?,
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            sa_key,
            token_cache: Arc::new(Mutex::new(None)),
            poll_interval: Duration::from_secs(2),
            job_timeout: Duration::from_secs(600),
        })
    }

    /// Get a valid OAuth2 access token, refreshing if expired.
    async fn access_token(&self) -> Result<String, SinkError> {
        let now = chrono::Utc::now().timestamp();
        {
            let cache = self
                .token_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(ref cached) = *cache {
                if now < cached.expires_at - 60 {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let claims = json!({
            "iss": self.sa_key.client_email,
            "scope": BIGQUERY_SCOPE,
            "aud": TOKEN_URI,
            "iat": now,
            "exp": now + 3600,
        });
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let encoding_key =
            jsonwebtoken::EncodingKey::from_rsa_pem(self.sa_key.private_key.as_bytes()).map_err(
                |e| SinkError::Unavailable(format!("Invalid service account private key: {}", e)),
            )?;
        let jwt = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| SinkError::Unavailable(format!("Failed to encode JWT: {}", e)))?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let resp: TokenResponse = self
            .client
            .post(TOKEN_URI)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let token = resp.access_token.clone();
        let mut cache = self
            .token_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cache = Some(CachedToken {
            access_token: resp.access_token,
            expires_at: now + resp.expires_in,
        });

        Ok(token)
    }

    fn job_config(
        &self,
        job_id: &str,
        destination: &Destination,
        schema: &TableSchema,
        mode: WriteMode,
        fingerprint: &str,
    ) -> Value {
        json!({
            "jobReference": {
                "projectId": self.project_id,
                "jobId": job_id,
            },
            "configuration": {
                "labels": { "batch_sha256": fingerprint },
                "load": {
                    "destinationTable": {
                        "projectId": self.project_id,
                        "datasetId": self.dataset_id,
                        "tableId": partition_table_id(destination),
                    },
                    "schema": { "fields": schema.fields },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": write_disposition(mode),
                    "createDisposition": "CREATE_IF_NEEDED",
                    "timePartitioning": { "type": "DAY", "field": "date" },
                    "maxBadRecords": 0,
                }
            }
        })
    }

    async fn submit(&self, token: &str, config: &Value, ndjson: &[u8]) -> Result<(), SinkError> {
        let url = format!(
            "{}/projects/{}/jobs?uploadType=multipart",
            UPLOAD_URL, self.project_id
        );
        let body = multipart_body(config, ndjson)
            .map_err(|e| SinkError::Unavailable(format!("Failed to encode job config: {}", e)))?;

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header(
                "Content-Type",
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SinkError::Unavailable(format!(
                "BigQuery job submission failed ({}): {}",
                status, text
            )));
        }
        Ok(())
    }

    /// Poll until the job is DONE. Timeout is `job_timeout`.
    async fn wait_for_job(&self, token: &str, job_id: &str) -> Result<JobStatus, SinkError> {
        let url = format!("{}/projects/{}/jobs/{}", API_URL, self.project_id, job_id);
        let deadline = tokio::time::Instant::now() + self.job_timeout;

        loop {
            let job: JobResource = self
                .client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if job.status.state == "DONE" {
                if let Some(error) = job.status.error_result {
                    return Err(SinkError::JobFailed {
                        job_id: job_id.to_string(),
                        message: error.message.unwrap_or(error.reason.unwrap_or_default()),
                    });
                }
                return Ok(job.status);
            }
            debug!("BigQuery job {} is {}... waiting", job_id, job.status.state);

            if tokio::time::Instant::now() >= deadline {
                return Err(SinkError::Unavailable(format!(
                    "Timed out waiting for load job {} (last state: {})",
                    job_id, job.status.state
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait::async_trait]
impl WarehouseSink for BigQuerySink {
    fn name(&self) -> &str {
        "bigquery"
    }

    async fn write(
        &self,
        destination: &Destination,
        schema: &TableSchema,
        rows: &[Row],
        mode: WriteMode,
    ) -> Result<(), SinkError> {
        let ndjson = to_ndjson(rows)
            .map_err(|e| SinkError::Unavailable(format!("Failed to encode rows: {}", e)))?;
        let fingerprint = fingerprint(&ndjson);
        let job_id = format!(
            "rankflux_{}_{}",
            sanitize(&destination.table),
            Uuid::new_v4().simple()
        );

        let token = self.access_token().await?;
        let config = self.job_config(&job_id, destination, schema, mode, &fingerprint);
        self.submit(&token, &config, &ndjson).await?;
        self.wait_for_job(&token, &job_id).await?;

        info!(
            "BigQuery job {} loaded {} rows into {}.{} ({:?})",
            job_id,
            rows.len(),
            self.dataset_id,
            partition_table_id(destination),
            mode
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct JobResource {
    status: JobStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<JobError>,
}

#[derive(Debug, Deserialize)]
struct JobError {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn write_disposition(mode: WriteMode) -> &'static str {
    match mode {
        WriteMode::Overwrite => "WRITE_TRUNCATE",
        WriteMode::Append => "WRITE_APPEND",
    }
}

/// Day-partition decorator for the destination table.
fn partition_table_id(destination: &Destination) -> String {
    format!(
        "{}${}",
        destination.table,
        destination.date.format("%Y%m%d")
    )
}

fn to_ndjson(rows: &[Row]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Label-safe content hash of the uploaded rows.
fn fingerprint(ndjson: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ndjson);
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

fn sanitize(table: &str) -> String {
    table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn multipart_body(config: &Value, ndjson: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::with_capacity(ndjson.len() + 1024);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
            b = BOUNDARY
        )
        .as_bytes(),
    );
    serde_json::to_writer(&mut body, config)?;
    body.extend_from_slice(
        format!(
            "\r\n--{b}\r\nContent-Type: application/octet-stream\r\n\r\n",
            b = BOUNDARY
        )
        .as_bytes(),
    );
    body.extend_from_slice(ndjson);
    body.extend_from_slice(format!("\r\n--{b}--\r\n", b = BOUNDARY).as_bytes());
    Ok(body)
}
