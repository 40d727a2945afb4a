//! Subreport criteria resolution (§6.3 `in report`/`not in report`).
//!
//! A subreport criterion names another report — stored by id, or specified
//! inline — whose result values become the parent's `IN`/`NOT IN` list. The
//! subreport runs to completion at Report construction time, before the
//! parent's own plans are built, so the query builder only ever sees literal
//! [`FilterOp::In`]/[`FilterOp::NotIn`] filters (see
//! [`crate::query_builder::filters`]).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{MeridianError, Result};
use crate::flows::{Filter, FilterOp};
use crate::planner::{plan_report, ReportParams};
use crate::report::Warehouse;

/// A stored subreport definition, as looked up by id through a [`ReportStore`].
#[derive(Debug, Clone)]
pub struct SubreportDef {
    pub dimensions: Vec<String>,
    #[allow(dead_code)]
    pub metrics: Vec<String>,
    pub criteria: Vec<Filter>,
    /// Which result column's values become the parent's literal list.
    /// Defaults to the parent criterion's own field when absent.
    pub field: Option<String>,
}

/// Resolves stored subreport ids to their definition (§6.6's `reports` table).
/// The metadata store itself is caller-owned; this crate only needs read
/// access to the one definition a criterion names.
pub trait ReportStore: Send + Sync {
    fn get(&self, report_id: &str) -> Option<SubreportDef>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubreportValue {
    StoredId { report_id: String },
    Inline(InlineSubreport),
}

#[derive(Debug, Deserialize)]
struct InlineSubreport {
    #[serde(default)]
    dimensions: Vec<String>,
    #[serde(default)]
    metrics: Vec<String>,
    #[serde(default)]
    criteria: Vec<Filter>,
    #[serde(default)]
    field: Option<String>,
}

fn parse_subreport_value(value: &Value, store: Option<&dyn ReportStore>) -> Result<SubreportDef> {
    let parsed: SubreportValue = serde_json::from_value(value.clone())
        .map_err(|e| MeridianError::Validation(format!("invalid subreport criterion: {e}")))?;
    match parsed {
        SubreportValue::StoredId { report_id } => {
            let store = store.ok_or_else(|| {
                MeridianError::Validation(format!(
                    "subreport '{report_id}' referenced by id but no report store was provided"
                ))
            })?;
            store.get(&report_id).ok_or_else(|| {
                MeridianError::Validation(format!("stored subreport '{report_id}' not found"))
            })
        }
        SubreportValue::Inline(inline) => Ok(SubreportDef {
            dimensions: inline.dimensions,
            metrics: inline.metrics,
            criteria: inline.criteria,
            field: inline.field,
        }),
    }
}

/// Run every `in report`/`not in report` criterion to completion and replace
/// it with a literal `In`/`NotIn` filter over the values it produced.
/// Non-subreport criteria pass through unchanged.
pub async fn resolve_subreport_criteria(
    warehouse: &Arc<Warehouse>,
    store: Option<&dyn ReportStore>,
    criteria: Vec<Filter>,
) -> Result<Vec<Filter>> {
    let mut resolved = Vec::with_capacity(criteria.len());
    for filter in criteria {
        match filter.op {
            FilterOp::InReport | FilterOp::NotInReport => {
                let def = parse_subreport_value(&filter.value, store)?;
                let projection_field = def.field.clone().unwrap_or_else(|| filter.field.clone());

                let mut dimensions = def.dimensions.clone();
                if !dimensions.iter().any(|d| d == &projection_field) {
                    dimensions.push(projection_field.clone());
                }

                let params = ReportParams {
                    metrics: Vec::new(),
                    dimensions,
                    criteria: def.criteria,
                    ..Default::default()
                };

                let (plans, spec) = plan_report(warehouse, &params)?;
                let report = warehouse.report();
                let result = report.execute(plans, spec).await?;

                let mut values: Vec<Value> = Vec::new();
                let mut seen = std::collections::HashSet::new();
                for row in &result.combined.rows {
                    if let Some(v) = row.get(&projection_field) {
                        if v.is_null() {
                            continue;
                        }
                        let key = serde_json::to_string(v).unwrap_or_default();
                        if seen.insert(key) {
                            values.push(v.clone());
                        }
                    }
                }

                let op = if matches!(filter.op, FilterOp::InReport) {
                    FilterOp::In
                } else {
                    FilterOp::NotIn
                };
                resolved.push(Filter {
                    field: filter.field,
                    op,
                    value: Value::Array(values),
                });
            }
            _ => resolved.push(filter),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticStore(SubreportDef);

    impl ReportStore for StaticStore {
        fn get(&self, _report_id: &str) -> Option<SubreportDef> {
            Some(self.0.clone())
        }
    }

    impl Clone for SubreportDef {
        fn clone(&self) -> Self {
            SubreportDef {
                dimensions: self.dimensions.clone(),
                metrics: self.metrics.clone(),
                criteria: self.criteria.clone(),
                field: self.field.clone(),
            }
        }
    }

    #[tokio::test]
    async fn non_subreport_filters_pass_through_unparsed() {
        let filter = Filter {
            field: "partner_name".to_string(),
            op: FilterOp::Eq,
            value: Value::from("Partner A"),
        };
        let warehouse = Arc::new(Warehouse::new(
            crate::registry::FlowRegistry::from_parts(Vec::new(), Vec::new()),
            crate::backends::ConnectionManager::new(),
            crate::config::GlobalConfig::default(),
        ));
        let resolved = resolve_subreport_criteria(&warehouse, None, vec![filter])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(matches!(resolved[0].op, FilterOp::Eq));
    }

    #[test]
    fn missing_store_for_stored_id_is_an_error() {
        let value = serde_json::json!({"report_id": "r1"});
        let err = parse_subreport_value(&value, None).unwrap_err();
        assert!(matches!(err, MeridianError::Validation(_)));
    }

    #[test]
    fn unknown_stored_id_is_an_error() {
        let store = StaticStore(SubreportDef {
            dimensions: vec!["partner_id".to_string()],
            metrics: Vec::new(),
            criteria: Vec::new(),
            field: None,
        });
        let value = serde_json::json!({"report_id": "does-not-match"});
        // StaticStore always resolves, so instead verify a genuinely empty
        // store surfaces the not-found error.
        struct EmptyStore;
        impl ReportStore for EmptyStore {
            fn get(&self, _report_id: &str) -> Option<SubreportDef> {
                None
            }
        }
        let empty = EmptyStore;
        let err = parse_subreport_value(&value, Some(&empty)).unwrap_err();
        assert!(matches!(err, MeridianError::Validation(_)));
        // Sanity: the populated store does resolve.
        assert!(parse_subreport_value(&value, Some(&store)).is_ok());
    }

    #[test]
    fn inline_subreport_parses_without_a_store() {
        let value = serde_json::json!({
            "dimensions": ["partner_id"],
            "criteria": [{"field": "region", "op": "=", "value": "west"}],
        });
        let def = parse_subreport_value(&value, None).unwrap();
        assert_eq!(def.dimensions, vec!["partner_id".to_string()]);
        assert_eq!(def.criteria.len(), 1);
    }
}
