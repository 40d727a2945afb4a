//! Warehouse facade and Report state machine (§3.5, §3.7, §4.6).
//!
//! [`Warehouse`] bundles the per-datasource [`FlowRegistry`]/[`ConnectionManager`]
//! pairs this crate already builds per §4.1–§4.4 with the ambient
//! [`GlobalConfig`] (§6.2), and exposes the request-scoped [`Report`] that
//! drives one or more DataSource-layer queries (the drill-across of the
//! Glossary) through the [`crate::combined`] engine.
//!
//! The Planner (§4.3) proper — automatic TableSet/Join selection per metric —
//! lives in [`crate::query_builder`] for a single flow/datasource. A `Report`
//! here is handed one resolved [`QueryRequest`] per DataSource it needs to
//! query (the planner's output), and is responsible for the concurrency model
//! (§5), the state machine (§4.6), and feeding results into the Combined
//! Layer (§4.5).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use crate::backends::ConnectionManager;
use crate::combined::{
    self, CombinedResult, DsFrame, FormulaDimensionSpec, FormulaMetricSpec, MetricSpec, OrderSpec,
    RollupMode, TechnicalSpec,
};
use crate::config::{GlobalConfig, QueryMode};
use crate::error::{MeridianError, Result};
use crate::executor::QueryResult;
use crate::flows::{Filter, QueryRequest, SemanticFlow};
use crate::metadata_store::MetadataStore;
use crate::planner::{plan_report, ReportParams};
use crate::registry::FlowRegistry;
use crate::subreport::{resolve_subreport_criteria, ReportStore};

/// Bundles the Field Registry + Schema Graph (as `FlowRegistry`) for every
/// DataSource alongside their live connections and the process-wide config.
/// Built once; administrative mutation is the caller's responsibility to
/// serialize (§5 "Shared-resource policy").
pub struct Warehouse {
    pub registry: FlowRegistry,
    pub connections: ConnectionManager,
    pub global_config: GlobalConfig,
    /// DataSource names in declared priority order (§3.5), highest first.
    /// Breaks ties when the Planner (§4.3 step 6) finds a metric equally
    /// satisfiable from more than one DataSource. A datasource absent from
    /// this list sorts after every listed one, by name.
    pub datasource_priority: Vec<String>,
}

impl Warehouse {
    pub fn new(registry: FlowRegistry, connections: ConnectionManager, global_config: GlobalConfig) -> Self {
        Self {
            registry,
            connections,
            global_config,
            datasource_priority: Vec::new(),
        }
    }

    pub fn with_datasource_priority(mut self, priority: Vec<String>) -> Self {
        self.datasource_priority = priority;
        self
    }

    /// Rank of `datasource` for tie-breaking (§4.2/§4.3): lower sorts first.
    /// Listed datasources rank by position; unlisted ones all rank after,
    /// ordered lexicographically among themselves.
    pub fn datasource_rank(&self, datasource: &str) -> (usize, &str) {
        match self.datasource_priority.iter().position(|d| d == datasource) {
            Some(idx) => (idx, ""),
            None => (self.datasource_priority.len(), datasource),
        }
    }

    /// Begin a new request-scoped Report. Each call gets an independent
    /// Combined Layer and kill flag; the Warehouse itself is read-only from
    /// here on (§5).
    pub fn report(self: &Arc<Self>) -> Report {
        Report::new(Arc::clone(self))
    }

    /// The full Report API entry point (§6.3): resolve any subreport
    /// criteria, plan the grain-satisfying DataSource queries (§4.3), and run
    /// them through to a combined result. `store` resolves `in report`
    /// criteria that reference a stored report by id; pass `None` when a
    /// Report only uses inline subreports.
    pub async fn run_report(
        self: &Arc<Self>,
        params: ReportParams,
        store: Option<&dyn ReportStore>,
    ) -> Result<ReportResult> {
        let criteria = resolve_subreport_criteria(self, store, params.criteria).await?;
        let params = ReportParams { criteria, ..params };
        let (plans, spec) = plan_report(self, &params)?;
        self.report().execute(plans, spec).await
    }

    /// §6.3 `save_report(params) → spec_id`: persists the params verbatim
    /// under `warehouse_id`. Does not plan or run anything.
    pub fn save_report(
        &self,
        metadata: &dyn MetadataStore,
        warehouse_id: &str,
        params: &ReportParams,
    ) -> Result<String> {
        let params_json = serde_json::to_string(params)?;
        metadata.save_report(warehouse_id, &params_json)
    }

    /// §6.3 `execute_id(spec_id)`: loads the saved params and re-plans from
    /// scratch (§6.6 "execution recomputes the plan") rather than replaying a
    /// cached plan, so a schema change since the save is picked up.
    pub async fn execute_id(
        self: &Arc<Self>,
        metadata: &dyn MetadataStore,
        store: Option<&dyn ReportStore>,
        spec_id: &str,
    ) -> Result<ReportResult> {
        let stored = metadata.get_report(spec_id)?;
        let params: ReportParams = serde_json::from_str(&stored.params_json)?;
        self.run_report(params, store).await
    }
}

/// One resolved DataSource-layer query: which flow/datasource to run, plus
/// how the Combined Layer should treat each of its output columns.
///
/// `flow` is the resolved [`SemanticFlow`] (chosen TableSet + join chain) to
/// run `request` against. The Planner (§4.3) synthesizes this per-Report
/// rather than requiring it to be pre-registered under the Warehouse's
/// shared [`FlowRegistry`], since a Report must not mutate the Warehouse
/// (§5). A hand-authored, registry-resident flow works too — callers that
/// already know which flow they want can clone it out of the registry.
#[derive(Clone)]
pub struct DataSourceQuery {
    pub source_name: String,
    pub flow: SemanticFlow,
    pub request: QueryRequest,
    /// Grain dimension names this plan's result is keyed on. Must be a
    /// subset of (or equal to) the Report's declared grain.
    pub grain: Vec<String>,
}

/// Everything the Combined Layer needs beyond the raw per-plan rows:
/// metric semantics, formula fields, technicals, rollup mode, ordering,
/// limit, and pivot — i.e. the non-DataSource part of a `Report::execute`
/// call (§6.3).
#[derive(Clone, Default)]
pub struct CombineSpec {
    pub metrics: Vec<MetricSpec>,
    pub formula_metrics: Vec<FormulaMetricSpec>,
    pub formula_dimensions: Vec<FormulaDimensionSpec>,
    pub technicals: Vec<TechnicalSpec>,
    pub rollup: Option<RollupMode>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<usize>,
    pub pivot: Vec<String>,
    /// Post-combine, HAVING-style filters (§6.3 `row_filters`), applied to
    /// the combined frame right after `combine()` — distinct from the
    /// `criteria` that compile into each plan's DataSource-layer WHERE.
    pub row_filters: Vec<Filter>,
    /// Missing metrics become NULL with a warning instead of aborting the
    /// whole Report (§7 "Propagation policy").
    pub allow_partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportState {
    Created = 0,
    Ready = 1,
    Planning = 2,
    Queued = 3,
    Running = 4,
    Combining = 5,
    Finished = 6,
    Failed = 7,
    Killed = 8,
}

impl ReportState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReportState::Created,
            1 => ReportState::Ready,
            2 => ReportState::Planning,
            3 => ReportState::Queued,
            4 => ReportState::Running,
            5 => ReportState::Combining,
            6 => ReportState::Finished,
            7 => ReportState::Failed,
            _ => ReportState::Killed,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, ReportState::Finished | ReportState::Failed | ReportState::Killed)
    }
}

/// Per-DataSource-plan timing, surfaced on the final Result (§6.4).
#[derive(Debug, Clone)]
pub struct PlanTiming {
    pub source_name: String,
    pub elapsed: Duration,
}

pub struct ReportResult {
    pub combined: CombinedResult,
    /// Pivoted projection of `combined`, present only when the spec named a
    /// non-empty `pivot` (§4.5, §6.3).
    pub pivoted: Option<QueryResult>,
    pub timings: Vec<PlanTiming>,
    pub warnings: Vec<String>,
}

/// Request-scoped orchestrator. Holds no state shared with other Reports
/// (§5 "Combined Layer ... never shared between Reports"); `kill()` only
/// flips a cooperative flag checked at the suspension points named in §5.
pub struct Report {
    warehouse: Arc<Warehouse>,
    state: AtomicU8,
    kill_requested: AtomicBool,
}

impl Report {
    fn new(warehouse: Arc<Warehouse>) -> Self {
        Self {
            warehouse,
            state: AtomicU8::new(ReportState::Created as u8),
            kill_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ReportState {
        ReportState::from_u8(self.state.load(AtomicOrdering::SeqCst))
    }

    /// Cooperative cancellation (§4.6). Idempotent; a no-op on a terminal
    /// state. Honored at the next suspension point in [`Report::execute`].
    pub fn kill(&self) {
        if !self.state().is_terminal() {
            self.kill_requested.store(true, AtomicOrdering::SeqCst);
        }
    }

    fn set_state(&self, s: ReportState) {
        self.state.store(s as u8, AtomicOrdering::SeqCst);
    }

    fn check_killed(&self) -> Result<()> {
        if self.kill_requested.load(AtomicOrdering::SeqCst) {
            self.set_state(ReportState::Killed);
            return Err(MeridianError::ReportKilled);
        }
        Ok(())
    }

    /// Drive the full request lifecycle: run every DataSource-layer plan
    /// (sequential or bounded worker pool per §4.4/§5), then assemble the
    /// Combined Layer result (§4.5).
    #[tracing::instrument(skip(self, plans, spec), fields(plans = plans.len()))]
    pub async fn execute(&self, plans: Vec<DataSourceQuery>, spec: CombineSpec) -> Result<ReportResult> {
        self.set_state(ReportState::Ready);
        self.check_killed()?;

        self.set_state(ReportState::Planning);
        let grain = combined_grain(&plans);
        self.check_killed()?;

        self.set_state(ReportState::Queued);
        let mode = self.warehouse.global_config.datasource_query_mode;
        let timeout = self.warehouse.global_config.datasource_query_timeout;

        self.set_state(ReportState::Running);
        let outcomes = match mode {
            QueryMode::Sequential => self.run_sequential(&plans, timeout).await?,
            QueryMode::Multithread => self.run_multithreaded(&plans, timeout).await?,
        };
        self.check_killed()?;

        self.set_state(ReportState::Combining);
        let mut frames = Vec::with_capacity(outcomes.len());
        let mut timings = Vec::with_capacity(outcomes.len());
        let mut warnings = Vec::new();
        for (plan, outcome) in plans.iter().zip(outcomes.into_iter()) {
            timings.push(PlanTiming {
                source_name: plan.source_name.clone(),
                elapsed: outcome.elapsed,
            });
            match outcome.result {
                Ok(qr) => frames.push(DsFrame {
                    source_name: plan.source_name.clone(),
                    grain: plan.grain.clone(),
                    rows: qr.rows,
                }),
                Err(e) if spec.allow_partial => {
                    warnings.push(format!(
                        "datasource '{}' query failed, continuing with allow_partial: {}",
                        plan.source_name, e
                    ));
                }
                Err(e) => {
                    self.set_state(ReportState::Failed);
                    return Err(e);
                }
            }
        }

        let mut combined_result = combined::combine(
            &frames,
            &grain,
            &spec.metrics,
            &spec.formula_metrics,
            &spec.formula_dimensions,
        )?;
        combined_result.warnings.extend(warnings.clone());

        if !spec.row_filters.is_empty() {
            combined::apply_row_filters(&mut combined_result, &spec.row_filters)?;
        }
        if !spec.technicals.is_empty() {
            combined::apply_technicals(
                &mut combined_result,
                &spec.technicals,
                &spec.metrics,
                &spec.formula_metrics,
            );
        }
        if let Some(mode) = spec.rollup {
            combined::apply_rollups(
                &mut combined_result,
                mode,
                &spec.metrics,
                &spec.formula_metrics,
                &spec.formula_dimensions,
            );
        }
        combined::apply_order(&mut combined_result, &spec.order_by);
        if let Some(limit) = spec.limit {
            combined::apply_limit(&mut combined_result, limit);
        }

        let pivoted = if !spec.pivot.is_empty() {
            Some(combined::apply_pivot(&combined_result, &spec.pivot))
        } else {
            None
        };

        self.set_state(ReportState::Finished);
        Ok(ReportResult {
            combined: combined_result,
            pivoted,
            timings,
            warnings,
        })
    }

    async fn run_sequential(
        &self,
        plans: &[DataSourceQuery],
        timeout: Duration,
    ) -> Result<Vec<PlanOutcome>> {
        let mut out = Vec::with_capacity(plans.len());
        for plan in plans {
            self.check_killed()?;
            out.push(self.run_one(plan, timeout).await);
        }
        Ok(out)
    }

    async fn run_multithreaded(
        &self,
        plans: &[DataSourceQuery],
        timeout: Duration,
    ) -> Result<Vec<PlanOutcome>> {
        let workers = self.warehouse.global_config.datasource_query_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut futures = Vec::with_capacity(plans.len());
        for plan in plans {
            let semaphore = Arc::clone(&semaphore);
            let plan = plan.clone();
            let warehouse = Arc::clone(&self.warehouse);
            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                run_plan(&warehouse, &plan, timeout).await
            });
        }
        // Submitted together, joined together: suspension point (b) of §5.
        Ok(futures::future::join_all(futures).await)
    }

    async fn run_one(&self, plan: &DataSourceQuery, timeout: Duration) -> PlanOutcome {
        run_plan(&self.warehouse, plan, timeout).await
    }
}

struct PlanOutcome {
    result: Result<QueryResult>,
    elapsed: Duration,
}

async fn run_plan(warehouse: &Warehouse, plan: &DataSourceQuery, timeout: Duration) -> PlanOutcome {
    let start = Instant::now();
    let fut = crate::runtime::run_query_with_flow(
        &warehouse.registry,
        &warehouse.connections,
        &plan.flow,
        &plan.request,
    );
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(MeridianError::DataSourceQueryTimeout {
            datasource: plan.source_name.clone(),
            timeout_secs: timeout.as_secs(),
        }),
    };
    PlanOutcome {
        result,
        elapsed: start.elapsed(),
    }
}

/// The grain a multi-plan Report combines on is the union of every plan's
/// declared grain columns, in first-seen order (stable, deterministic —
/// matches §4.2's enumeration-order guarantee).
fn combined_grain(plans: &[DataSourceQuery]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for plan in plans {
        for d in &plan.grain {
            if seen.insert(d.clone()) {
                out.push(d.clone());
            }
        }
    }
    out
}

/// Helper: build a single-source `DsFrame`-free external result directly,
/// used by callers that already have one query's raw rows and want the
/// sentinel-aware display projection without going through a full Report.
pub fn rows_to_query_result(columns: Vec<String>, rows: Vec<Map<String, Value>>) -> QueryResult {
    QueryResult {
        columns: columns
            .into_iter()
            .map(|name| crate::executor::ColumnMeta { name })
            .collect(),
        rows,
    }
}
