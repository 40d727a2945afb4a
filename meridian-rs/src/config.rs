//! Ambient configuration.
//!
//! Two independent surfaces: [`GlobalConfig`] is environment-driven and process-wide
//! (§6.2), loaded once and handed explicitly to a [`crate::report::Warehouse`] at
//! construction rather than hidden behind a lazy global, so tests can run with
//! distinct configs in the same process. [`MeridianConfig`] is a TOML-based
//! execution-tuning layer (pool sizes, per-backend knobs) with global defaults and
//! per-datasource overrides, independent of the declarative warehouse catalogue
//! (§6.1), which lives in [`crate::report`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeridianError, Result};

/// Query execution mode (§6.2 `DATASOURCE_QUERY_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    #[default]
    Sequential,
    Multithread,
}

/// Process-wide, environment-driven configuration (§6.2). Immutable once built.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub debug: bool,
    pub log_level: String,
    pub load_table_chunk_size: usize,
    pub db_url: Option<String>,
    pub adhoc_datasource_directory: Option<String>,
    pub datasource_query_mode: QueryMode,
    pub datasource_query_timeout: Duration,
    pub datasource_query_workers: usize,
    pub datasource_max_joins: usize,
    pub datasource_max_join_candidates: usize,
    pub datasource_contexts: HashMap<String, HashMap<String, String>>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_string(),
            load_table_chunk_size: 10_000,
            db_url: None,
            adhoc_datasource_directory: None,
            datasource_query_mode: QueryMode::Sequential,
            datasource_query_timeout: Duration::from_secs(60),
            datasource_query_workers: 4,
            datasource_max_joins: 3,
            datasource_max_join_candidates: 100,
            datasource_contexts: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Build from the process environment. Unrecognized or malformed values fall
    /// back to the default for that key rather than failing construction; only the
    /// declarative Warehouse config is fatal-on-error (§7).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("DEBUG") {
            cfg.debug = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Ok(v) = std::env::var("LOAD_TABLE_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.load_table_chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("DB_URL") {
            cfg.db_url = Some(v);
        }
        if let Ok(v) = std::env::var("ADHOC_DATASOURCE_DIRECTORY") {
            cfg.adhoc_datasource_directory = Some(v);
        }
        if let Ok(v) = std::env::var("DATASOURCE_QUERY_MODE") {
            cfg.datasource_query_mode = match v.to_lowercase().as_str() {
                "multithread" | "multithreaded" => QueryMode::Multithread,
                _ => QueryMode::Sequential,
            };
        }
        if let Ok(v) = std::env::var("DATASOURCE_QUERY_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                cfg.datasource_query_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("DATASOURCE_QUERY_WORKERS") {
            if let Ok(n) = v.parse() {
                cfg.datasource_query_workers = n;
            }
        }
        if let Ok(v) = std::env::var("DATASOURCE_MAX_JOINS") {
            if let Ok(n) = v.parse() {
                cfg.datasource_max_joins = n;
            }
        }
        if let Ok(v) = std::env::var("DATASOURCE_MAX_JOIN_CANDIDATES") {
            if let Ok(n) = v.parse() {
                cfg.datasource_max_join_candidates = n;
            }
        }
        // DATASOURCE_CONTEXTS: JSON object of {datasource: {var: value}}, used to
        // interpolate `{user}`/`{host}`/... placeholders in connection URLs.
        if let Ok(v) = std::env::var("DATASOURCE_CONTEXTS") {
            if let Ok(parsed) = serde_json::from_str::<HashMap<String, HashMap<String, String>>>(&v)
            {
                cfg.datasource_contexts = parsed;
            } else {
                tracing::warn!("DATASOURCE_CONTEXTS is not valid JSON, ignoring");
            }
        }

        tracing::debug!(?cfg.datasource_query_mode, workers = cfg.datasource_query_workers, "loaded global config");
        cfg
    }

    /// Interpolate `{placeholder}` tokens in a connection URL template using the
    /// named datasource's context bag.
    pub fn interpolate(&self, datasource: &str, template: &str) -> String {
        let Some(ctx) = self.datasource_contexts.get(datasource) else {
            return template.to_string();
        };
        let mut out = template.to_string();
        for (k, v) in ctx {
            out = out.replace(&format!("{{{k}}}"), v);
        }
        out
    }
}

/// Root of the TOML-based execution-tuning layer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub defaults: GlobalDefaults,
    #[serde(default)]
    pub datasources: HashMap<String, DatasourceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub pool: PoolConfig,
    pub schema_cache: SchemaCacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    pub timeout_ms: u64,
    pub max_row_limit: u64,
    pub default_row_limit: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemaCacheConfig {
    pub ttl_secs: u64,
    pub max_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasourceConfig {
    pub query: Option<QueryConfig>,
    pub pool: Option<PoolConfig>,
    pub schema_cache: Option<SchemaCacheConfig>,
    pub bigquery: Option<BigQueryConfig>,
    pub duckdb: Option<DuckDbConfig>,
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BigQueryConfig {
    pub use_query_cache: bool,
    pub maximum_bytes_billed: i64,
    pub max_concurrent_queries: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DuckDbConfig {
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub pool_size: usize,
    pub statement_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_row_limit: 0,
            default_row_limit: 1_000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 16,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_size: 1000,
        }
    }
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            use_query_cache: true,
            maximum_bytes_billed: 0,
            max_concurrent_queries: 30,
        }
    }
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self { max_concurrency: 16 }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            statement_timeout_ms: 30_000,
        }
    }
}

impl MeridianConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&contents)
            .map_err(|e| MeridianError::InvalidWarehouseConfig(format!("config: {e}")))
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| MeridianError::InvalidWarehouseConfig(format!("config: {e}")))
    }

    /// 1. `MERIDIAN_CONFIG` env var, 2. `./meridian.toml`, 3. user config dir, 4. defaults.
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("MERIDIAN_CONFIG") {
            if let Ok(cfg) = Self::from_file(&path) {
                tracing::info!(path = %path, "loaded config from MERIDIAN_CONFIG");
                return cfg;
            }
        }
        if let Ok(cfg) = Self::from_file("meridian.toml") {
            tracing::info!("loaded config from ./meridian.toml");
            return cfg;
        }
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("meridian").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }
        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    pub fn for_datasource(&self, name: &str) -> ResolvedDatasourceConfig {
        ResolvedDatasourceConfig::merge(&self.defaults, self.datasources.get(name))
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedDatasourceConfig {
    pub query: QueryConfig,
    pub pool: PoolConfig,
    pub schema_cache: SchemaCacheConfig,
    pub bigquery: BigQueryConfig,
    pub duckdb: DuckDbConfig,
    pub postgres: PostgresConfig,
}

impl ResolvedDatasourceConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&DatasourceConfig>) -> Self {
        match override_cfg {
            Some(ds) => Self {
                query: ds.query.clone().unwrap_or_else(|| defaults.query.clone()),
                pool: ds.pool.clone().unwrap_or_else(|| defaults.pool.clone()),
                schema_cache: ds
                    .schema_cache
                    .clone()
                    .unwrap_or_else(|| defaults.schema_cache.clone()),
                bigquery: ds.bigquery.clone().unwrap_or_default(),
                duckdb: ds.duckdb.clone().unwrap_or_default(),
                postgres: ds.postgres.clone().unwrap_or_default(),
            },
            None => Self {
                query: defaults.query.clone(),
                pool: defaults.pool.clone(),
                schema_cache: defaults.schema_cache.clone(),
                bigquery: BigQueryConfig::default(),
                duckdb: DuckDbConfig::default(),
                postgres: PostgresConfig::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = MeridianConfig::default();
        assert_eq!(cfg.defaults.query.timeout_ms, 30_000);
        assert_eq!(cfg.defaults.pool.size, 16);
    }

    #[test]
    fn parse_toml_overrides() {
        let toml = r#"
[defaults.query]
timeout_ms = 60000
max_row_limit = 50000

[datasources.warehouse_bq.bigquery]
use_query_cache = false
maximum_bytes_billed = 1073741824
"#;
        let cfg = MeridianConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.defaults.query.timeout_ms, 60_000);
        let resolved = cfg.for_datasource("warehouse_bq");
        assert!(!resolved.bigquery.use_query_cache);
        assert_eq!(resolved.bigquery.maximum_bytes_billed, 1_073_741_824);
    }

    #[test]
    fn datasource_override_falls_back_to_default() {
        let toml = "[defaults.pool]\nsize = 8\n\n[datasources.prod.pool]\nsize = 32\n";
        let cfg = MeridianConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.for_datasource("unknown").pool.size, 8);
        assert_eq!(cfg.for_datasource("prod").pool.size, 32);
    }

    #[test]
    fn global_config_env_overrides() {
        std::env::set_var("DATASOURCE_QUERY_WORKERS", "12");
        std::env::set_var("DATASOURCE_QUERY_MODE", "multithread");
        let cfg = GlobalConfig::from_env();
        assert_eq!(cfg.datasource_query_workers, 12);
        assert_eq!(cfg.datasource_query_mode, QueryMode::Multithread);
        std::env::remove_var("DATASOURCE_QUERY_WORKERS");
        std::env::remove_var("DATASOURCE_QUERY_MODE");
    }
}
