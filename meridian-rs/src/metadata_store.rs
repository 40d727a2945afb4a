//! Report-spec metadata store (§6.6, §6.3 `save`/`save_report`/`execute_id`/`delete`).
//!
//! Two tables: `warehouses(id, name, config_url, params_hash)` and
//! `reports(id, warehouse_id, params_json)`. Params are stored verbatim —
//! `execute_id` re-plans from the stored JSON rather than caching a plan, so
//! a warehouse schema change is picked up by every saved report
//! automatically. This is deliberately narrower than a general persistence
//! layer (§1 Non-goals: "a persistent metadata store beyond report-spec
//! save/load").

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{MeridianError, Result};

fn hash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone)]
pub struct StoredWarehouse {
    pub id: String,
    pub name: String,
    pub config_url: String,
    pub params_hash: u64,
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub id: String,
    pub warehouse_id: String,
    /// Verbatim request params, serialized. Re-parsed and re-planned on
    /// every `execute_id` call rather than cached.
    pub params_json: String,
}

/// Storage surface for the two §6.6 tables. `save`/`save_report`/`delete`
/// are the write path named in §6.3; `get_report`/`get_warehouse` back
/// `execute_id`.
pub trait MetadataStore: Send + Sync {
    fn save_warehouse(&self, name: &str, config_url: &str) -> Result<String>;
    fn save_report(&self, warehouse_id: &str, params_json: &str) -> Result<String>;
    fn get_report(&self, spec_id: &str) -> Result<StoredReport>;
    fn get_warehouse(&self, warehouse_id: &str) -> Result<StoredWarehouse>;
    fn delete_report(&self, spec_id: &str) -> Result<()>;
}

/// Process-local store, suitable for tests and for single-process
/// deployments where `DB_URL` (§6.2) is unset. Writes are serialized behind
/// a mutex so concurrent `save`/`delete` calls observe a consistent
/// pre-or-post-commit state (§5 "Shared-resource policy").
#[derive(Default)]
pub struct InMemoryMetadataStore {
    warehouses: Mutex<HashMap<String, StoredWarehouse>>,
    reports: Mutex<HashMap<String, StoredReport>>,
    next_warehouse_id: Mutex<u64>,
    next_report_id: Mutex<u64>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn save_warehouse(&self, name: &str, config_url: &str) -> Result<String> {
        let mut next = self.next_warehouse_id.lock().expect("lock poisoned");
        let id = format!("wh_{}", *next);
        *next += 1;
        drop(next);

        let record = StoredWarehouse {
            id: id.clone(),
            name: name.to_string(),
            config_url: config_url.to_string(),
            params_hash: hash_str(config_url),
        };
        self.warehouses
            .lock()
            .expect("lock poisoned")
            .insert(id.clone(), record);
        Ok(id)
    }

    fn save_report(&self, warehouse_id: &str, params_json: &str) -> Result<String> {
        if !self
            .warehouses
            .lock()
            .expect("lock poisoned")
            .contains_key(warehouse_id)
        {
            return Err(MeridianError::Validation(format!(
                "unknown warehouse id '{warehouse_id}'"
            )));
        }
        let mut next = self.next_report_id.lock().expect("lock poisoned");
        let id = format!("rpt_{}", *next);
        *next += 1;
        drop(next);

        let record = StoredReport {
            id: id.clone(),
            warehouse_id: warehouse_id.to_string(),
            params_json: params_json.to_string(),
        };
        self.reports
            .lock()
            .expect("lock poisoned")
            .insert(id.clone(), record);
        Ok(id)
    }

    fn get_report(&self, spec_id: &str) -> Result<StoredReport> {
        self.reports
            .lock()
            .expect("lock poisoned")
            .get(spec_id)
            .cloned()
            .ok_or_else(|| MeridianError::Validation(format!("report spec '{spec_id}' not found")))
    }

    fn get_warehouse(&self, warehouse_id: &str) -> Result<StoredWarehouse> {
        self.warehouses
            .lock()
            .expect("lock poisoned")
            .get(warehouse_id)
            .cloned()
            .ok_or_else(|| {
                MeridianError::Validation(format!("warehouse '{warehouse_id}' not found"))
            })
    }

    fn delete_report(&self, spec_id: &str) -> Result<()> {
        self.reports
            .lock()
            .expect("lock poisoned")
            .remove(spec_id)
            .map(|_| ())
            .ok_or_else(|| MeridianError::Validation(format!("report spec '{spec_id}' not found")))
    }
}

/// DuckDB-backed store (`DB_URL`, §6.2): persists the two tables to a file so
/// saved reports survive process restarts. Mirrors the pooling-free,
/// single-connection style `backends::duckdb` uses for schema introspection.
#[cfg(feature = "duckdb")]
pub mod duckdb_store {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub struct DuckDbMetadataStore {
        conn: StdMutex<duckdb::Connection>,
    }

    impl DuckDbMetadataStore {
        pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
            let conn = duckdb::Connection::open(path.as_ref())
                .map_err(|e| MeridianError::Execution(format!("open metadata store: {e}")))?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS warehouses (
                    id VARCHAR PRIMARY KEY,
                    name VARCHAR NOT NULL,
                    config_url VARCHAR NOT NULL,
                    params_hash UBIGINT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS reports (
                    id VARCHAR PRIMARY KEY,
                    warehouse_id VARCHAR NOT NULL,
                    params_json VARCHAR NOT NULL
                );
                CREATE SEQUENCE IF NOT EXISTS warehouse_id_seq START 1;
                CREATE SEQUENCE IF NOT EXISTS report_id_seq START 1;",
            )
            .map_err(|e| MeridianError::Execution(format!("create metadata tables: {e}")))?;
            Ok(Self {
                conn: StdMutex::new(conn),
            })
        }
    }

    impl MetadataStore for DuckDbMetadataStore {
        fn save_warehouse(&self, name: &str, config_url: &str) -> Result<String> {
            let conn = self.conn.lock().expect("lock poisoned");
            let seq: i64 = conn
                .query_row("SELECT nextval('warehouse_id_seq')", [], |r| r.get(0))
                .map_err(|e| MeridianError::Execution(format!("next warehouse id: {e}")))?;
            let id = format!("wh_{seq}");
            conn.execute(
                "INSERT INTO warehouses (id, name, config_url, params_hash) VALUES (?, ?, ?, ?)",
                duckdb::params![id, name, config_url, hash_str(config_url)],
            )
            .map_err(|e| MeridianError::Execution(format!("save warehouse: {e}")))?;
            Ok(id)
        }

        fn save_report(&self, warehouse_id: &str, params_json: &str) -> Result<String> {
            let conn = self.conn.lock().expect("lock poisoned");
            let exists: i64 = conn
                .query_row(
                    "SELECT count(*) FROM warehouses WHERE id = ?",
                    duckdb::params![warehouse_id],
                    |r| r.get(0),
                )
                .map_err(|e| MeridianError::Execution(format!("check warehouse: {e}")))?;
            if exists == 0 {
                return Err(MeridianError::Validation(format!(
                    "unknown warehouse id '{warehouse_id}'"
                )));
            }
            let seq: i64 = conn
                .query_row("SELECT nextval('report_id_seq')", [], |r| r.get(0))
                .map_err(|e| MeridianError::Execution(format!("next report id: {e}")))?;
            let id = format!("rpt_{seq}");
            conn.execute(
                "INSERT INTO reports (id, warehouse_id, params_json) VALUES (?, ?, ?)",
                duckdb::params![id, warehouse_id, params_json],
            )
            .map_err(|e| MeridianError::Execution(format!("save report: {e}")))?;
            Ok(id)
        }

        fn get_report(&self, spec_id: &str) -> Result<StoredReport> {
            let conn = self.conn.lock().expect("lock poisoned");
            conn.query_row(
                "SELECT id, warehouse_id, params_json FROM reports WHERE id = ?",
                duckdb::params![spec_id],
                |r| {
                    Ok(StoredReport {
                        id: r.get(0)?,
                        warehouse_id: r.get(1)?,
                        params_json: r.get(2)?,
                    })
                },
            )
            .map_err(|_| MeridianError::Validation(format!("report spec '{spec_id}' not found")))
        }

        fn get_warehouse(&self, warehouse_id: &str) -> Result<StoredWarehouse> {
            let conn = self.conn.lock().expect("lock poisoned");
            conn.query_row(
                "SELECT id, name, config_url, params_hash FROM warehouses WHERE id = ?",
                duckdb::params![warehouse_id],
                |r| {
                    Ok(StoredWarehouse {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        config_url: r.get(2)?,
                        params_hash: r.get(3)?,
                    })
                },
            )
            .map_err(|_| MeridianError::Validation(format!("warehouse '{warehouse_id}' not found")))
        }

        fn delete_report(&self, spec_id: &str) -> Result<()> {
            let conn = self.conn.lock().expect("lock poisoned");
            let changed = conn
                .execute("DELETE FROM reports WHERE id = ?", duckdb::params![spec_id])
                .map_err(|e| MeridianError::Execution(format!("delete report: {e}")))?;
            if changed == 0 {
                return Err(MeridianError::Validation(format!(
                    "report spec '{spec_id}' not found"
                )));
            }
            Ok(())
        }
    }
}

#[cfg(feature = "duckdb")]
pub use duckdb_store::DuckDbMetadataStore;
