pub mod backends;
pub mod combined;
pub mod combined_formula;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod expr_parser;
pub mod expr_utils;
pub mod flows;
pub mod metadata_store;
pub mod pagination;
pub mod planner;
pub mod query_builder;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod schema_cache;
pub mod schema_graph;
pub mod sql_ast;
pub mod subreport;
pub mod validation;

use std::path::Path;

use crate::error::Result;
use crate::registry::FlowRegistry;

/// Load semantic definitions from disk and validate them with the provided validator.
pub async fn load_and_validate<P: AsRef<Path>>(
    flow_dir: P,
    validator: &crate::validation::Validator,
) -> Result<FlowRegistry> {
    let mut registry = FlowRegistry::load_from_dir(flow_dir)?;
    validator.validate_registry(&mut registry).await?;
    Ok(registry)
}

pub use crate::validation::Validator;
pub use backends::{BackendConnection, ConnectionManager};
pub use combined::{CombinedResult, RollupMode, TechnicalKind, TechnicalMode, TechnicalSpec};
pub use config::GlobalConfig;
pub use report::{CombineSpec, DataSourceQuery, Report, ReportResult, ReportState, Warehouse};
#[cfg(feature = "duckdb")]
pub use backends::DuckDbConnection;
#[cfg(feature = "postgres")]
pub use backends::PostgresConnection;
#[cfg(feature = "bigquery")]
pub use backends::BigQueryConnection;
pub use error::MeridianError;
pub use executor::QueryResult;
pub use flows::{QueryRequest, SemanticFlow, SemanticTable};
pub use metadata_store::{InMemoryMetadataStore, MetadataStore, StoredReport, StoredWarehouse};
#[cfg(feature = "duckdb")]
pub use metadata_store::DuckDbMetadataStore;
pub use planner::{plan_report, AdHocFormulaDimension, AdHocFormulaMetric, ReportParams};
pub use query_builder::SqlBuilder;
pub use registry::{DimensionInfo, FlowSchema, FlowSummary, MeasureInfo};
pub use schema_cache::TableSchema;
pub use schema_graph::TableSet;
pub use subreport::{ReportStore, SubreportDef};

// Dialect re-exports
pub use dialect::Dialect;
#[cfg(feature = "duckdb")]
pub use dialect::DuckDbDialect;
#[cfg(feature = "postgres")]
pub use dialect::PostgresDialect;
#[cfg(feature = "bigquery")]
pub use dialect::BigQueryDialect;
