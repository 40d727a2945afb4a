use std::collections::BTreeSet;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeridianError>;

/// Error kinds surfaced to callers of the core. Parsing/config errors are fatal at
/// Warehouse construction; planning and execution errors are fatal per-Report unless
/// the caller passed `allow_partial`.
#[derive(Debug, Error)]
pub enum MeridianError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid field config: {0}")]
    InvalidFieldConfig(String),
    #[error("invalid datasource config: {0}")]
    InvalidDataSourceConfig(String),
    #[error("invalid warehouse config: {0}")]
    InvalidWarehouseConfig(String),

    /// The planner could not satisfy every requested metric at the requested grain.
    #[error("unsupported grain: metric(s) {metrics:?} cannot be satisfied at grain {grain:?}")]
    UnsupportedGrainError {
        metrics: Vec<String>,
        grain: BTreeSet<String>,
    },

    #[error("datasource query '{datasource}' timed out after {timeout_secs}s")]
    DataSourceQueryTimeout {
        datasource: String,
        timeout_secs: u64,
    },

    #[error("datasource query against '{datasource}' failed: {source}")]
    FailedExecutionError { datasource: String, source: String },

    #[error("report killed")]
    ReportKilled,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("validation error: {0}")]
    Validation(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("sql generation error: {0}")]
    Sql(String),
    #[error("execution error: {0}")]
    Execution(String),

    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeridianError {
    pub fn unsupported_grain(
        metrics: impl IntoIterator<Item = String>,
        grain: BTreeSet<String>,
    ) -> Self {
        MeridianError::UnsupportedGrainError {
            metrics: metrics.into_iter().collect(),
            grain,
        }
    }
}
