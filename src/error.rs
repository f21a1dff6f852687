//! Error types for each pipeline stage.

use thiserror::Error;

/// Upstream retrieval failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("{resource} still returning {status} at offset {offset} after {attempts} attempts")]
    RetriesExhausted {
        resource: String,
        offset: u64,
        status: u16,
        attempts: u32,
    },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Decode(err.to_string())
    }
}

/// Malformed hierarchical data.
#[derive(Debug, Error)]
pub enum StructureError {
    #[error("Group at depth {depth} (name {name:?}) has no group_id")]
    MissingGroupId { depth: usize, name: Option<String> },
}

/// Destination write failures.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Load job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::Unavailable(err.to_string())
    }
}

/// Batch load failures.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{rejected} rows violate the schema of {table} (max bad records {threshold}); first: {first}")]
    TooManyBadRecords {
        table: String,
        rejected: usize,
        threshold: usize,
        first: String,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Failure of one campaign/date run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Group tree invalid: {0}")]
    Structure(#[from] StructureError),

    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    #[error("Row serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Run timed out after {0}s")]
    TimedOut(u64),

    #[error("Unknown campaign: {0}")]
    UnknownCampaign(String),
}
