//! Grain-satisfaction planner (§4.3, the Planner, Component C).
//!
//! Given a Report's requested metrics, dimensions and criteria, find a legal
//! [`crate::schema_graph::TableSet`] per leaf metric in every DataSource that
//! can satisfy them, group metrics that can share a query, and emit the
//! [`DataSourceQuery`] plans [`crate::report::Report::execute`] runs plus the
//! [`CombineSpec`] describing how the Combined Layer should treat them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::combined::{FormulaDimensionSpec, FormulaMetricSpec, MetricSpec, OrderSpec, RollupMode, TechnicalSpec};
use crate::combined_formula::{self, CombinedFormula};
use crate::error::{MeridianError, Result};
use crate::flows::{Aggregation, Filter, SemanticTable};
use crate::registry::FlowRegistry;
use crate::report::{CombineSpec, DataSourceQuery, Warehouse};
use crate::schema_graph::{self, TableSet};

/// An ad-hoc, request-scoped FormulaMetric (§3.1 "AdHocField"): a brace-syntax
/// formula supplied directly in a report's params rather than declared on any
/// table. Never leaks beyond the Report that defines it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocFormulaMetric {
    pub name: String,
    pub formula: String,
    pub rounding: Option<i32>,
}

/// An ad-hoc, request-scoped FormulaDimension (§3.1, §4.5 item 3): a
/// brace-syntax formula over other dimensions already at the report grain,
/// evaluated at the Combined Layer rather than the DataSource layer. Cannot
/// be filtered on directly (§7 "criteria on a FormulaDimension") — filter on
/// the dimensions it's computed from instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocFormulaDimension {
    pub name: String,
    pub formula: String,
}

/// The full Report API surface (§6.3) the Planner consumes. Serializable
/// verbatim into the metadata store's `reports.params_json` column (§6.6):
/// `save_report`/`execute_id` round-trip this type rather than a derived plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportParams {
    pub metrics: Vec<String>,
    pub ad_hoc_formula_metrics: Vec<AdHocFormulaMetric>,
    pub dimensions: Vec<String>,
    pub ad_hoc_formula_dimensions: Vec<AdHocFormulaDimension>,
    pub criteria: Vec<Filter>,
    pub rollup: Option<RollupMode>,
    pub technicals: Vec<TechnicalSpec>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<usize>,
    /// Dimensions to pivot the combined result on (§4.5, §6.3).
    pub pivot: Vec<String>,
    /// Post-combine, HAVING-style filters (§6.3), distinct from `criteria`.
    pub row_filters: Vec<Filter>,
    pub allow_partial: bool,
}

/// One leaf metric's usable (table, TableSet) options, alongside the
/// DataSource that owns the table.
struct MetricCandidates {
    metric: String,
    options: Vec<CandidateTableSet>,
}

#[derive(Clone)]
struct CandidateTableSet {
    data_source: String,
    table_set: TableSet,
}

/// Plan a Report end to end: resolve the grain, expand ad-hoc formulas to
/// their leaf dependencies, find a covering TableSet per leaf metric per
/// DataSource, greedily group metrics that can share a query, and emit the
/// plans plus the Combined Layer spec that consumes their output.
pub fn plan_report(warehouse: &Warehouse, params: &ReportParams) -> Result<(Vec<DataSourceQuery>, CombineSpec)> {
    let registry = &warehouse.registry;

    // §7: a FormulaDimension can't be filtered on directly — criteria must
    // target the real dimensions it's computed from.
    let formula_dim_names: BTreeSet<String> = params
        .ad_hoc_formula_dimensions
        .iter()
        .map(|f| f.name.clone())
        .collect();
    for c in &params.criteria {
        if formula_dim_names.contains(&c.field) {
            return Err(MeridianError::UnsupportedOperation(format!(
                "cannot filter on FormulaDimension '{}'; filter on the dimensions it's computed from instead",
                c.field
            )));
        }
    }

    // §4.3 step 1: grain = D ∪ fields_in(K) ∪ fields_in(formula_deps(M)).
    let mut grain_vec: Vec<String> = Vec::new();
    let mut grain_set: BTreeSet<String> = BTreeSet::new();
    for d in &params.dimensions {
        if grain_set.insert(d.clone()) {
            grain_vec.push(d.clone());
        }
    }
    for c in &params.criteria {
        if grain_set.insert(c.field.clone()) {
            grain_vec.push(c.field.clone());
        }
    }

    // Expand ad-hoc formula dimensions to their leaf dependencies, which join
    // the grain the same way a formula metric's dependencies join the leaf
    // metric set below.
    let mut formula_dimensions = Vec::with_capacity(params.ad_hoc_formula_dimensions.len());
    let mut formula_dim_map: std::collections::HashMap<String, CombinedFormula> = std::collections::HashMap::new();
    for f in &params.ad_hoc_formula_dimensions {
        let parsed = combined_formula::parse_combined_formula(&f.formula)?;
        formula_dim_map.insert(f.name.clone(), parsed);
    }
    for f in &params.ad_hoc_formula_dimensions {
        let deps = combined_formula::expand_formula_deps(&f.name, &formula_dim_map)?;
        for dep in deps {
            if grain_set.insert(dep.clone()) {
                grain_vec.push(dep);
            }
        }
        formula_dimensions.push(FormulaDimensionSpec {
            name: f.name.clone(),
            formula: formula_dim_map.remove(&f.name).expect("just inserted"),
        });
    }

    // Expand ad-hoc formula metrics to their leaf (non-formula) dependencies.
    let mut formula_metrics = Vec::with_capacity(params.ad_hoc_formula_metrics.len());
    let mut leaf_metrics: Vec<String> = params.metrics.clone();
    let mut seen_leaf: BTreeSet<String> = leaf_metrics.iter().cloned().collect();

    let mut formula_map: std::collections::HashMap<String, CombinedFormula> = std::collections::HashMap::new();
    for f in &params.ad_hoc_formula_metrics {
        let parsed = combined_formula::parse_combined_formula(&f.formula)?;
        formula_map.insert(f.name.clone(), parsed);
    }
    for f in &params.ad_hoc_formula_metrics {
        let deps = combined_formula::expand_formula_deps(&f.name, &formula_map)?;
        for dep in deps {
            if seen_leaf.insert(dep.clone()) {
                leaf_metrics.push(dep);
            }
        }
        formula_metrics.push(FormulaMetricSpec {
            name: f.name.clone(),
            formula: formula_map.remove(&f.name).expect("just inserted"),
            rounding: f.rounding,
        });
    }

    if leaf_metrics.is_empty() {
        return plan_pure_dimension_report(
            warehouse,
            params,
            &grain_vec,
            &grain_set,
            formula_metrics,
            formula_dimensions,
        );
    }

    // §4.3 step 2: candidates per leaf metric, filtered by required_grain and
    // grain reachability.
    let max_joins = warehouse.global_config.datasource_max_joins;
    let max_candidates = warehouse.global_config.datasource_max_join_candidates;

    let mut all_candidates = Vec::with_capacity(leaf_metrics.len());
    let mut unsupported = Vec::new();

    for metric in &leaf_metrics {
        let declaring_tables: Vec<&SemanticTable> = registry
            .tables
            .values()
            .filter(|t| t.measures.contains_key(metric))
            .collect();

        if declaring_tables.is_empty() {
            unsupported.push(metric.clone());
            continue;
        }

        // required_grain(m) ⊆ grain(R) — a measure-level check, independent
        // of which table ultimately produces it.
        let measure_required_grain_ok = declaring_tables.iter().all(|t| {
            let measure = &t.measures[metric];
            measure.required_grain.iter().all(|rg| grain_set.contains(rg))
        });
        if !measure_required_grain_ok {
            unsupported.push(metric.clone());
            continue;
        }

        let mut options = Vec::new();
        let mut sorted_tables: Vec<&SemanticTable> = declaring_tables;
        sorted_tables.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));

        for table in sorted_tables {
            let measure = &table.measures[metric];
            if measure.is_weighted() {
                let Some(weighting_name) = &measure.weighting_metric else {
                    continue;
                };
                if !table.measures.contains_key(weighting_name) {
                    // Weighted measures are resolved within a single query;
                    // the weighting metric must live on the same table.
                    continue;
                }
            }

            let covers = schema_graph::enumerate_joins_for_grain(
                registry,
                &table.name,
                &grain_set,
                max_joins,
                max_candidates,
            );
            if let Some(best) = covers.into_iter().next() {
                options.push(CandidateTableSet {
                    data_source: table.data_source.clone(),
                    table_set: best,
                });
            }
        }

        if options.is_empty() {
            unsupported.push(metric.clone());
            continue;
        }

        all_candidates.push(MetricCandidates {
            metric: metric.clone(),
            options,
        });
    }

    if !unsupported.is_empty() {
        return Err(MeridianError::unsupported_grain(unsupported, grain_set));
    }

    // §4.3 step 3: greedy bipartite cover, rarest metric first, preferring
    // whichever already-assigned TableSet has the most metrics on it.
    all_candidates.sort_by(|a, b| {
        a.options
            .len()
            .cmp(&b.options.len())
            .then_with(|| a.metric.cmp(&b.metric))
    });

    #[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
    struct GroupKey {
        data_source: String,
        metric_table: String,
        joined_tables: Vec<String>,
    }

    let mut group_counts: BTreeMap<GroupKey, usize> = BTreeMap::new();
    let mut assignment: Vec<(String, GroupKey)> = Vec::new();

    for candidate in &all_candidates {
        let best = candidate
            .options
            .iter()
            .max_by(|a, b| {
                let key_a = GroupKey {
                    data_source: a.data_source.clone(),
                    metric_table: a.table_set.metric_table.clone(),
                    joined_tables: a.table_set.joined_tables.clone(),
                };
                let key_b = GroupKey {
                    data_source: b.data_source.clone(),
                    metric_table: b.table_set.metric_table.clone(),
                    joined_tables: b.table_set.joined_tables.clone(),
                };
                let reuse_a = group_counts.get(&key_a).copied().unwrap_or(0);
                let reuse_b = group_counts.get(&key_b).copied().unwrap_or(0);
                reuse_a
                    .cmp(&reuse_b)
                    .then_with(|| {
                        // §4.3 step 6: DataSource priority, then join count,
                        // then lexicographic.
                        warehouse
                            .datasource_rank(&b.data_source)
                            .cmp(&warehouse.datasource_rank(&a.data_source))
                    })
                    .then_with(|| b.table_set.join_count().cmp(&a.table_set.join_count()).reverse())
                    .then_with(|| key_b.metric_table.cmp(&key_a.metric_table).reverse())
            })
            .expect("non-empty options");

        let key = GroupKey {
            data_source: best.data_source.clone(),
            metric_table: best.table_set.metric_table.clone(),
            joined_tables: best.table_set.joined_tables.clone(),
        };
        *group_counts.entry(key.clone()).or_insert(0) += 1;
        assignment.push((candidate.metric.clone(), key));
    }

    // Group metrics by their assigned TableSet, preserving deterministic
    // (data_source, metric_table, joined_tables) key ordering.
    let mut groups: BTreeMap<GroupKey, Vec<String>> = BTreeMap::new();
    for (metric, key) in assignment {
        groups.entry(key).or_default().push(metric);
    }

    let mut plans = Vec::with_capacity(groups.len());
    let mut metric_specs = Vec::new();

    for (idx, (key, mut metrics)) in groups.into_iter().enumerate() {
        metrics.sort();
        let table_set = TableSet {
            metric_table: key.metric_table.clone(),
            joined_tables: key.joined_tables.clone(),
        };
        let flow_name = format!("__planner_{}_{}", key.metric_table, idx);
        let flow = schema_graph::build_flow_for_tableset(registry, &table_set, &flow_name)?;

        for metric in &metrics {
            metric_specs.push(build_metric_spec(registry, metric));
        }

        let request = crate::flows::QueryRequest {
            flow: flow_name,
            dimensions: grain_vec.clone(),
            measures: metrics,
            filters: params.criteria.clone(),
            order: Vec::new(),
            limit: None,
            offset: None,
            page_size: None,
            cursor: None,
        };

        plans.push(DataSourceQuery {
            source_name: key.data_source.clone(),
            flow,
            request,
            grain: grain_vec.clone(),
        });
    }

    // Deterministic plan ordering: by DataSource priority, then name.
    plans.sort_by(|a, b| {
        warehouse
            .datasource_rank(&a.source_name)
            .cmp(&warehouse.datasource_rank(&b.source_name))
            .then_with(|| a.flow.name.cmp(&b.flow.name))
    });

    let spec = CombineSpec {
        metrics: metric_specs,
        formula_metrics,
        formula_dimensions,
        technicals: params.technicals.clone(),
        rollup: params.rollup,
        order_by: params.order_by.clone(),
        limit: params.limit,
        pivot: params.pivot.clone(),
        row_filters: params.row_filters.clone(),
        allow_partial: params.allow_partial,
    };

    Ok((plans, spec))
}

/// §4.3 step 4: a report with no metrics becomes a single query against the
/// smallest TableSet (across every DataSource) that covers the grain.
fn plan_pure_dimension_report(
    warehouse: &Warehouse,
    params: &ReportParams,
    grain_vec: &[String],
    grain_set: &BTreeSet<String>,
    formula_metrics: Vec<FormulaMetricSpec>,
    formula_dimensions: Vec<FormulaDimensionSpec>,
) -> Result<(Vec<DataSourceQuery>, CombineSpec)> {
    let registry = &warehouse.registry;
    let max_joins = warehouse.global_config.datasource_max_joins;
    let max_candidates = warehouse.global_config.datasource_max_join_candidates;

    if grain_vec.is_empty() {
        return Err(MeridianError::Validation(
            "report has no metrics and no dimensions".to_string(),
        ));
    }

    let mut best: Option<(TableSet, &SemanticTable)> = None;
    let mut tables: Vec<&SemanticTable> = registry.tables.values().collect();
    tables.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));

    for table in tables {
        let covers = schema_graph::enumerate_joins_for_grain(registry, &table.name, grain_set, max_joins, max_candidates);
        if let Some(candidate) = covers.into_iter().next() {
            let better = match &best {
                None => true,
                Some((current, current_table)) => {
                    let rank = warehouse
                        .datasource_rank(&table.data_source)
                        .cmp(&warehouse.datasource_rank(&current_table.data_source));
                    match rank {
                        std::cmp::Ordering::Less => true,
                        std::cmp::Ordering::Greater => false,
                        std::cmp::Ordering::Equal => candidate.join_count() < current.join_count(),
                    }
                }
            };
            if better {
                best = Some((candidate, table));
            }
        }
    }

    let Some((table_set, table)) = best else {
        return Err(MeridianError::unsupported_grain(
            Vec::<String>::new(),
            grain_set.clone(),
        ));
    };

    let flow_name = "__planner_pure_dimension".to_string();
    let flow = schema_graph::build_flow_for_tableset(registry, &table_set, &flow_name)?;

    let request = crate::flows::QueryRequest {
        flow: flow_name,
        dimensions: grain_vec.to_vec(),
        measures: Vec::new(),
        filters: params.criteria.clone(),
        order: Vec::new(),
        limit: None,
        offset: None,
        page_size: None,
        cursor: None,
    };

    let plan = DataSourceQuery {
        source_name: table.data_source.clone(),
        flow,
        request,
        grain: grain_vec.to_vec(),
    };

    let spec = CombineSpec {
        metrics: Vec::new(),
        formula_metrics,
        formula_dimensions,
        technicals: params.technicals.clone(),
        rollup: params.rollup,
        order_by: params.order_by.clone(),
        limit: params.limit,
        pivot: params.pivot.clone(),
        row_filters: params.row_filters.clone(),
        allow_partial: params.allow_partial,
    };

    Ok((vec![plan], spec))
}

fn build_metric_spec(registry: &FlowRegistry, metric: &str) -> MetricSpec {
    let declaring = registry.tables.values().find(|t| t.measures.contains_key(metric));
    let Some(table) = declaring else {
        return MetricSpec {
            name: metric.to_string(),
            aggregation: Aggregation::Sum,
            ifnull: None,
            rounding: None,
        };
    };
    let measure = &table.measures[metric];
    let aggregation = measure.agg.clone().unwrap_or(Aggregation::Sum);
    MetricSpec {
        name: metric.to_string(),
        aggregation,
        ifnull: measure.ifnull,
        rounding: measure.rounding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ConnectionManager;
    use crate::config::GlobalConfig;
    use crate::flows::{Aggregation as Agg, Dimension, Expr, Measure, TableKind};
    use crate::registry::FlowRegistry;
    use std::collections::BTreeMap as Map;
    use std::sync::Arc;

    fn dim(col: &str) -> Dimension {
        Dimension {
            expr: Expr::Column { column: col.to_string() },
            data_type: None,
            description: None,
        }
    }

    fn measure(col: &str, agg: Agg) -> Measure {
        Measure {
            expr: Some(Expr::Column { column: col.to_string() }),
            agg: Some(agg),
            formula: None,
            filter: None,
            post_expr: None,
            data_type: None,
            description: None,
            weighting_metric: None,
            required_grain: Vec::new(),
            ifnull: None,
            rounding: None,
            divisors: None,
        }
    }

    fn sample_warehouse() -> Warehouse {
        let mut partners_dims = Map::new();
        partners_dims.insert("partner_name".to_string(), dim("name"));
        let partners = SemanticTable {
            data_source: "ds1".to_string(),
            name: "partners".to_string(),
            table: "public.partners".to_string(),
            primary_keys: vec!["partner_id".to_string()],
            time_dimension: None,
            smallest_time_grain: None,
            dimensions: partners_dims,
            measures: Map::new(),
            description: None,
            table_kind: TableKind::Dimension,
            parent: None,
            siblings: Vec::new(),
            incomplete_dimensions: Vec::new(),
            priority: 0,
        };

        let mut campaigns_dims = Map::new();
        campaigns_dims.insert("campaign_name".to_string(), dim("name"));
        let mut campaigns_measures = Map::new();
        campaigns_measures.insert("leads".to_string(), measure("lead_count", Agg::Sum));
        let campaigns = SemanticTable {
            data_source: "ds1".to_string(),
            name: "campaigns".to_string(),
            table: "public.campaigns".to_string(),
            primary_keys: vec!["campaign_id".to_string()],
            time_dimension: None,
            smallest_time_grain: None,
            dimensions: campaigns_dims,
            measures: campaigns_measures,
            description: None,
            table_kind: TableKind::Metric,
            parent: Some("partners".to_string()),
            siblings: Vec::new(),
            incomplete_dimensions: Vec::new(),
            priority: 0,
        };

        let mut sales_measures = Map::new();
        sales_measures.insert("revenue".to_string(), measure("amount", Agg::Sum));
        let sales = SemanticTable {
            data_source: "ds1".to_string(),
            name: "sales".to_string(),
            table: "public.sales".to_string(),
            primary_keys: vec!["sale_id".to_string()],
            time_dimension: None,
            smallest_time_grain: None,
            dimensions: Map::new(),
            measures: sales_measures,
            description: None,
            table_kind: TableKind::Metric,
            parent: Some("campaigns".to_string()),
            siblings: Vec::new(),
            incomplete_dimensions: Vec::new(),
            priority: 0,
        };

        let registry = FlowRegistry::from_parts(vec![partners, campaigns, sales], vec![]);
        Warehouse::new(registry, ConnectionManager::new(), GlobalConfig::default())
    }

    #[test]
    fn plans_single_datasource_query_for_reachable_metrics() {
        let warehouse = Arc::new(sample_warehouse());
        let params = ReportParams {
            metrics: vec!["leads".to_string(), "revenue".to_string()],
            dimensions: vec!["partner_name".to_string()],
            ..Default::default()
        };
        let (plans, spec) = plan_report(&warehouse, &params).unwrap();
        assert!(!plans.is_empty());
        assert_eq!(spec.metrics.len(), 2);
        for plan in &plans {
            assert!(plan.request.dimensions.contains(&"partner_name".to_string()));
        }
    }

    #[test]
    fn fails_when_metric_lives_below_the_requested_dimension() {
        // `sale_id` only lives on `sales`, a child of `campaigns`; `leads`
        // lives on `campaigns` and cannot fan out downward to acquire it.
        let warehouse = Arc::new(sample_warehouse());
        let params = ReportParams {
            metrics: vec!["leads".to_string()],
            dimensions: vec!["sale_id".to_string()],
            ..Default::default()
        };
        let err = plan_report(&warehouse, &params).unwrap_err();
        assert!(matches!(err, MeridianError::UnsupportedGrainError { .. }));
    }

    #[test]
    fn ad_hoc_formula_plans_its_dependencies_as_leaf_metrics() {
        let warehouse = Arc::new(sample_warehouse());
        let params = ReportParams {
            metrics: vec!["revenue".to_string()],
            ad_hoc_formula_metrics: vec![AdHocFormulaMetric {
                name: "my_rpl".to_string(),
                formula: "{revenue}/{leads}".to_string(),
                rounding: Some(2),
            }],
            dimensions: vec!["partner_name".to_string()],
            ..Default::default()
        };
        let (plans, spec) = plan_report(&warehouse, &params).unwrap();
        assert!(!plans.is_empty());
        assert_eq!(spec.formula_metrics.len(), 1);
        assert_eq!(spec.formula_metrics[0].name, "my_rpl");
        // Both `revenue` (explicit) and `leads` (formula dependency) must be
        // planned as real leaf metrics.
        let all_measures: BTreeSet<String> = plans.iter().flat_map(|p| p.request.measures.iter().cloned()).collect();
        assert!(all_measures.contains("revenue"));
        assert!(all_measures.contains("leads"));
    }

    #[test]
    fn ad_hoc_formula_dimension_expands_its_dependencies_into_the_grain() {
        let warehouse = Arc::new(sample_warehouse());
        let params = ReportParams {
            metrics: vec!["revenue".to_string()],
            dimensions: vec!["campaign_name".to_string()],
            ad_hoc_formula_dimensions: vec![AdHocFormulaDimension {
                name: "partner_and_campaign".to_string(),
                formula: "{campaign_name}+{partner_name}".to_string(),
            }],
            ..Default::default()
        };
        let (plans, spec) = plan_report(&warehouse, &params).unwrap();
        assert_eq!(spec.formula_dimensions.len(), 1);
        assert_eq!(spec.formula_dimensions[0].name, "partner_and_campaign");
        for plan in &plans {
            assert!(plan.request.dimensions.contains(&"partner_name".to_string()));
            assert!(plan.request.dimensions.contains(&"campaign_name".to_string()));
        }
    }

    #[test]
    fn criteria_on_a_formula_dimension_is_rejected() {
        let warehouse = Arc::new(sample_warehouse());
        let params = ReportParams {
            dimensions: vec!["campaign_name".to_string()],
            ad_hoc_formula_dimensions: vec![AdHocFormulaDimension {
                name: "partner_and_campaign".to_string(),
                formula: "{campaign_name}+{partner_name}".to_string(),
            }],
            criteria: vec![Filter {
                field: "partner_and_campaign".to_string(),
                op: crate::flows::FilterOp::Eq,
                value: serde_json::Value::from("whatever"),
            }],
            ..Default::default()
        };
        let err = plan_report(&warehouse, &params).unwrap_err();
        assert!(matches!(err, MeridianError::UnsupportedOperation(_)));
    }

    #[test]
    fn pure_dimension_report_has_no_metrics() {
        let warehouse = Arc::new(sample_warehouse());
        let params = ReportParams {
            dimensions: vec!["partner_name".to_string()],
            ..Default::default()
        };
        let (plans, spec) = plan_report(&warehouse, &params).unwrap();
        assert_eq!(plans.len(), 1);
        assert!(plans[0].request.measures.is_empty());
        assert!(spec.metrics.is_empty());
    }
}
