//! Combined-Layer Engine (§4.5).
//!
//! Request-scoped assembly of one or more DataSource-layer result frames into
//! a single tabular [`CombinedResult`], keyed on the report grain. Implements
//! the row-oriented variant documented as the fallback in SPEC_FULL.md's
//! "Combined Layer engine choice" note: the join/coalesce/formula/weighted-mean
//! steps and the rollup/technical passes operate directly on in-memory rows
//! rather than through a second SQL dialect, since §4.5 itself specifies
//! Technicals and Rollups as post-SQL, in-memory passes, and the "FULL OUTER
//! JOIN" semantics it asks for reduce to a plain key-merge once everything is
//! already grouped at the report grain.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::combined_formula::{eval_combined_formula, expand_formula_deps, CombinedFormula};
use crate::error::{MeridianError, Result};
use crate::executor::{ColumnMeta, QueryResult};
use crate::flows::{Aggregation, Filter, FilterOp};

/// The in-band rollup marker (§6.5). Reserved so it never collides with a
/// legitimate dimension value.
pub const ROLLUP_SENTINEL: char = '\u{10FFFF}';

pub fn rollup_sentinel() -> Value {
    Value::String(ROLLUP_SENTINEL.to_string())
}

fn is_sentinel(v: &Value) -> bool {
    matches!(v, Value::String(s) if s.chars().count() == 1 && s.starts_with(ROLLUP_SENTINEL))
}

/// One DataSource-layer result, already aggregated to the report grain.
///
/// Mean-aggregated metrics are expected to carry two raw companion columns,
/// `{name}__num` and `{name}__den` (the weighted-mean numerator/denominator
/// of §4.1; for an unweighted mean these are simply `SUM(x)` and `COUNT(x)`),
/// so that rollups can re-derive a correct mean rather than averaging
/// already-averaged values.
#[derive(Debug, Clone)]
pub struct DsFrame {
    pub source_name: String,
    pub grain: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollupMode {
    Totals,
    All,
    Levels(usize),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum TechnicalMode {
    Group,
    All,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum TechnicalKind {
    Mean(usize),
    Sum(usize),
    CumSum,
    Diff,
    PctChange,
    Boll(usize),
    Rank,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSpec {
    pub metric: String,
    pub kind: TechnicalKind,
    pub mode: TechnicalMode,
}

/// A metric as seen by the Combined Layer: name, how it aggregates, and the
/// defaulting/formatting rules applied once DS-layer results are merged.
#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub name: String,
    pub aggregation: Aggregation,
    /// `ifnull` default (§3.1). Only meaningful for Sum/Count-family
    /// aggregations; a `Mean` left un-filled stays NULL per §8's boundary
    /// behavior ("All-NULL metric after combine").
    pub ifnull: Option<f64>,
    pub rounding: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct FormulaMetricSpec {
    pub name: String,
    pub formula: CombinedFormula,
    pub rounding: Option<i32>,
}

/// A dimension computed at the Combined Layer from other dimensions already
/// present at the report grain (§3.1, §4.5 item 3). Unlike a declared
/// dimension it is not part of the grain/group key — it is evaluated once per
/// row after dims are merged, the same way a [`FormulaMetricSpec`] is
/// evaluated after metrics are coalesced.
#[derive(Debug, Clone)]
pub struct FormulaDimensionSpec {
    pub name: String,
    pub formula: CombinedFormula,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub column: String,
    pub direction: OrderDirection,
}

/// Assembled result of combining one or more `DsFrame`s at a common grain.
#[derive(Debug, Clone)]
pub struct CombinedResult {
    pub dims: Vec<String>,
    pub metrics: Vec<String>,
    /// Names of [`FormulaDimensionSpec`]s evaluated into these rows. Not part
    /// of `dims`: they don't participate in the grain/group key, only in
    /// output projection.
    pub formula_dimensions: Vec<String>,
    /// Each row carries dim + metric columns, plus internal `__num`/`__den`
    /// companions for Mean metrics (stripped by [`CombinedResult::to_query_result`]).
    pub rows: Vec<Map<String, Value>>,
    /// Indices into `rows` that are rollup rows rather than raw grain rows.
    pub rollup_row_indices: Vec<usize>,
    pub warnings: Vec<String>,
}

impl CombinedResult {
    /// Project to the external `QueryResult` shape: dims + declared metrics
    /// only, internal bookkeeping columns stripped.
    pub fn to_query_result(&self) -> QueryResult {
        let mut columns: Vec<ColumnMeta> = self
            .dims
            .iter()
            .chain(self.formula_dimensions.iter())
            .chain(self.metrics.iter())
            .map(|c| ColumnMeta { name: c.clone() })
            .collect();
        columns.dedup_by(|a, b| a.name == b.name);
        let rows = self
            .rows
            .iter()
            .map(|r| {
                let mut out = Map::new();
                for col in self.dims.iter().chain(self.formula_dimensions.iter()).chain(self.metrics.iter()) {
                    out.insert(col.clone(), r.get(col).cloned().unwrap_or(Value::Null));
                }
                out
            })
            .collect();
        QueryResult { columns, rows }
    }

    /// Display projection (§6.4): the rollup sentinel becomes the literal
    /// token `"Totals"` in every dimension cell it appears in.
    pub fn to_display_query_result(&self) -> QueryResult {
        let mut result = self.to_query_result();
        for row in &mut result.rows {
            for col in &self.dims {
                if let Some(v) = row.get(col) {
                    if is_sentinel(v) {
                        row.insert(col.clone(), Value::String("Totals".to_string()));
                    }
                }
            }
        }
        result
    }
}

fn dim_key(row: &Map<String, Value>, dims: &[String]) -> String {
    dims.iter()
        .map(|d| serde_json::to_string(row.get(d).unwrap_or(&Value::Null)).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\u{1}")
}

/// Merge DS-layer frames into one row set keyed on `dims`, coalescing
/// overlapping metric columns and reconstructing formula fields.
///
/// This implements §4.5 items 1–4: the FULL OUTER JOIN is a key-merge since
/// every frame is already grouped at `dims`; coalescing applies each metric's
/// `ifnull`; weighted/plain means are reconstructed from their `__num`/`__den`
/// companions; formula fields are evaluated last so they can see reconstructed
/// values of the metrics they depend on.
pub fn combine(
    frames: &[DsFrame],
    dims: &[String],
    metrics: &[MetricSpec],
    formula_metrics: &[FormulaMetricSpec],
    formula_dimensions: &[FormulaDimensionSpec],
) -> Result<CombinedResult> {
    let mut merged: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    let mut warnings = Vec::new();

    for frame in frames {
        for row in &frame.rows {
            let key = dim_key(row, dims);
            let entry = merged.entry(key).or_insert_with(|| {
                let mut base = Map::new();
                for d in dims {
                    base.insert(d.clone(), row.get(d).cloned().unwrap_or(Value::Null));
                }
                base
            });
            for (col, val) in row.iter() {
                if dims.contains(col) {
                    continue;
                }
                if entry.contains_key(col) && entry.get(col) != Some(&Value::Null) {
                    warnings.push(format!(
                        "column '{}' produced by more than one datasource at this grain; keeping the first value seen (source '{}')",
                        col, frame.source_name
                    ));
                    continue;
                }
                entry.insert(col.clone(), val.clone());
            }
        }
    }

    let mut rows: Vec<Map<String, Value>> = merged.into_values().collect();

    for row in &mut rows {
        for m in metrics {
            match m.aggregation {
                Aggregation::Avg | Aggregation::Median => {
                    let num_col = format!("{}__num", m.name);
                    let den_col = format!("{}__den", m.name);
                    if row.contains_key(&num_col) || row.contains_key(&den_col) {
                        let num = row.get(&num_col).and_then(Value::as_f64);
                        let den = row.get(&den_col).and_then(Value::as_f64);
                        let value = match (num, den) {
                            (Some(n), Some(d)) if d != 0.0 => Some(n / d),
                            _ => None,
                        };
                        row.insert(
                            m.name.clone(),
                            value.map(Value::from).unwrap_or(Value::Null),
                        );
                    } else {
                        // The DataSource query already reconstructed the mean
                        // (§4.1's weighted-mean algebra resolved in-query); take
                        // it as-is. No `ifnull` default for MEAN (§8 boundary
                        // behavior: missing means stay NULL even if declared).
                        let value = row.get(&m.name).and_then(Value::as_f64);
                        row.insert(
                            m.name.clone(),
                            value.map(Value::from).unwrap_or(Value::Null),
                        );
                    }
                }
                _ => {
                    let raw = row.get(&m.name).and_then(Value::as_f64);
                    let value = match (raw, m.ifnull) {
                        (Some(v), _) => Some(v),
                        (None, Some(default)) => Some(default),
                        (None, None) => None,
                    };
                    row.insert(
                        m.name.clone(),
                        value.map(Value::from).unwrap_or(Value::Null),
                    );
                }
            }
            if let Some(rounding) = m.rounding {
                round_in_place(row, &m.name, rounding);
            }
        }
    }

    // FormulaDimensions are evaluated first so a FormulaMetric may reference
    // one (both resolve against the same row map).
    for spec in &formula_dimensions_in_dependency_order(formula_dimensions)? {
        for row in &mut rows {
            let value = eval_combined_formula(&spec.formula, row);
            row.insert(
                spec.name.clone(),
                value.map(Value::from).unwrap_or(Value::Null),
            );
        }
    }

    // Formula fields: expand to leaves and evaluate bottom-up so a formula
    // referencing another formula (depth-bounded, §4.1) sees a resolved value.
    for spec in &formula_metrics_in_dependency_order(formula_metrics)? {
        for row in &mut rows {
            let value = eval_combined_formula(&spec.formula, row);
            row.insert(
                spec.name.clone(),
                value.map(Value::from).unwrap_or(Value::Null),
            );
            if let Some(rounding) = spec.rounding {
                round_in_place(row, &spec.name, rounding);
            }
        }
    }

    rows.sort_by(|a, b| cmp_rows_by_dims(a, b, dims));

    let metric_names: Vec<String> = metrics
        .iter()
        .map(|m| m.name.clone())
        .chain(formula_metrics.iter().map(|f| f.name.clone()))
        .collect();

    let formula_dimension_names: Vec<String> =
        formula_dimensions.iter().map(|f| f.name.clone()).collect();

    Ok(CombinedResult {
        dims: dims.to_vec(),
        metrics: metric_names,
        formula_dimensions: formula_dimension_names,
        rows,
        rollup_row_indices: Vec::new(),
        warnings,
    })
}

/// Topologically order formula metrics so dependencies (including
/// formula-on-formula chains) are evaluated before dependents.
fn formula_metrics_in_dependency_order(
    formula_metrics: &[FormulaMetricSpec],
) -> Result<Vec<FormulaMetricSpec>> {
    let table: HashMap<String, CombinedFormula> = formula_metrics
        .iter()
        .map(|f| (f.name.clone(), f.formula.clone()))
        .collect();
    // Depth of a formula = 1 + max depth of its direct formula refs.
    fn depth(
        name: &str,
        table: &HashMap<String, CombinedFormula>,
        memo: &mut HashMap<String, usize>,
        stack: &mut Vec<String>,
    ) -> Result<usize> {
        if let Some(d) = memo.get(name) {
            return Ok(*d);
        }
        if stack.contains(&name.to_string()) {
            return Err(MeridianError::InvalidFieldConfig(format!(
                "circular formula reference involving '{}'",
                name
            )));
        }
        let formula = match table.get(name) {
            None => {
                memo.insert(name.to_string(), 0);
                return Ok(0);
            }
            Some(f) => f,
        };
        stack.push(name.to_string());
        let mut max_child = 0usize;
        for dep in formula.direct_refs() {
            max_child = max_child.max(depth(&dep, table, memo, stack)?);
        }
        stack.pop();
        let d = max_child + 1;
        memo.insert(name.to_string(), d);
        Ok(d)
    }

    let mut memo = HashMap::new();
    let mut stack = Vec::new();
    let mut with_depth = Vec::new();
    for spec in formula_metrics {
        let d = depth(&spec.name, &table, &mut memo, &mut stack)?;
        if d > crate::combined_formula::MAX_FORMULA_DEPTH {
            return Err(MeridianError::InvalidFieldConfig(format!(
                "formula '{}' exceeds max expansion depth",
                spec.name
            )));
        }
        with_depth.push((d, spec.clone()));
    }
    with_depth.sort_by_key(|(d, _)| *d);
    Ok(with_depth.into_iter().map(|(_, s)| s).collect())
}

/// Topologically order formula dimensions the same way formula metrics are
/// ordered, so a formula dimension referencing another sees a resolved value.
fn formula_dimensions_in_dependency_order(
    formula_dimensions: &[FormulaDimensionSpec],
) -> Result<Vec<FormulaDimensionSpec>> {
    let table: HashMap<String, CombinedFormula> = formula_dimensions
        .iter()
        .map(|f| (f.name.clone(), f.formula.clone()))
        .collect();
    fn depth(
        name: &str,
        table: &HashMap<String, CombinedFormula>,
        memo: &mut HashMap<String, usize>,
        stack: &mut Vec<String>,
    ) -> Result<usize> {
        if let Some(d) = memo.get(name) {
            return Ok(*d);
        }
        if stack.contains(&name.to_string()) {
            return Err(MeridianError::InvalidFieldConfig(format!(
                "circular formula reference involving '{}'",
                name
            )));
        }
        let formula = match table.get(name) {
            None => {
                memo.insert(name.to_string(), 0);
                return Ok(0);
            }
            Some(f) => f,
        };
        stack.push(name.to_string());
        let mut max_child = 0usize;
        for dep in formula.direct_refs() {
            max_child = max_child.max(depth(&dep, table, memo, stack)?);
        }
        stack.pop();
        let d = max_child + 1;
        memo.insert(name.to_string(), d);
        Ok(d)
    }

    let mut memo = HashMap::new();
    let mut stack = Vec::new();
    let mut with_depth = Vec::new();
    for spec in formula_dimensions {
        let d = depth(&spec.name, &table, &mut memo, &mut stack)?;
        if d > crate::combined_formula::MAX_FORMULA_DEPTH {
            return Err(MeridianError::InvalidFieldConfig(format!(
                "formula '{}' exceeds max expansion depth",
                spec.name
            )));
        }
        with_depth.push((d, spec.clone()));
    }
    with_depth.sort_by_key(|(d, _)| *d);
    Ok(with_depth.into_iter().map(|(_, s)| s).collect())
}

fn round_in_place(row: &mut Map<String, Value>, col: &str, rounding: i32) {
    if let Some(v) = row.get(col).and_then(Value::as_f64) {
        let factor = 10f64.powi(rounding);
        let rounded = (v * factor).round() / factor;
        row.insert(col.to_string(), Value::from(rounded));
    }
}

fn cmp_value_loose(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn cmp_dim_value(a: &Value, b: &Value) -> Ordering {
    match (is_sentinel(a), is_sentinel(b)) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => cmp_value_loose(a, b),
    }
}

fn cmp_rows_by_dims(a: &Map<String, Value>, b: &Map<String, Value>, dims: &[String]) -> Ordering {
    for d in dims {
        let ord = cmp_dim_value(
            a.get(d).unwrap_or(&Value::Null),
            b.get(d).unwrap_or(&Value::Null),
        );
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

// ---------------------------------------------------------------------------
// Row filters (§6.3 `row_filters`)
// ---------------------------------------------------------------------------

/// Post-combine, HAVING-style filtering of the combined frame (§6.3
/// `row_filters`) — distinct from `criteria`, which compiles into DS-layer
/// WHERE clauses before aggregation. Runs immediately after `combine()`, in
/// logical-query-processing order ahead of technicals/rollups, so a window
/// function never sees a row its own filter would have dropped.
pub fn apply_row_filters(result: &mut CombinedResult, filters: &[Filter]) -> Result<()> {
    if filters.is_empty() {
        return Ok(());
    }
    let old_rollups: std::collections::HashSet<usize> =
        result.rollup_row_indices.iter().copied().collect();
    let mut rows = Vec::with_capacity(result.rows.len());
    let mut rollup_row_indices = Vec::new();
    for (i, row) in result.rows.drain(..).enumerate() {
        let mut keep = true;
        for f in filters {
            if !row_filter_matches(&row, f)? {
                keep = false;
                break;
            }
        }
        if keep {
            if old_rollups.contains(&i) {
                rollup_row_indices.push(rows.len());
            }
            rows.push(row);
        }
    }
    result.rows = rows;
    result.rollup_row_indices = rollup_row_indices;
    Ok(())
}

fn row_filter_matches(row: &Map<String, Value>, filter: &Filter) -> Result<bool> {
    let actual = row.get(&filter.field).cloned().unwrap_or(Value::Null);
    Ok(match filter.op {
        FilterOp::Eq => values_equal(&actual, &filter.value),
        FilterOp::Neq => !values_equal(&actual, &filter.value),
        FilterOp::Gt => cmp_value_loose(&actual, &filter.value) == Ordering::Greater,
        FilterOp::Gte => matches!(cmp_value_loose(&actual, &filter.value), Ordering::Greater | Ordering::Equal),
        FilterOp::Lt => cmp_value_loose(&actual, &filter.value) == Ordering::Less,
        FilterOp::Lte => matches!(cmp_value_loose(&actual, &filter.value), Ordering::Less | Ordering::Equal),
        FilterOp::In => value_in_list(&actual, &filter.value),
        FilterOp::NotIn => !value_in_list(&actual, &filter.value),
        FilterOp::Like => sql_like(&actual, &filter.value, false),
        FilterOp::NotLike => !sql_like(&actual, &filter.value, false),
        FilterOp::ILike => sql_like(&actual, &filter.value, true),
        FilterOp::Between => value_between(&actual, &filter.value),
        FilterOp::NotBetween => !value_between(&actual, &filter.value),
        FilterOp::IsNull => actual.is_null(),
        FilterOp::IsNotNull => !actual.is_null(),
        FilterOp::InReport | FilterOp::NotInReport => {
            return Err(MeridianError::UnsupportedOperation(
                "row_filters must have 'in report'/'not in report' criteria resolved to a literal In/NotIn before combining".to_string(),
            ));
        }
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    cmp_value_loose(a, b) == Ordering::Equal
}

fn value_in_list(actual: &Value, list: &Value) -> bool {
    match list {
        Value::Array(items) => items.iter().any(|v| values_equal(actual, v)),
        other => values_equal(actual, other),
    }
}

fn value_between(actual: &Value, bounds: &Value) -> bool {
    let (low, high) = match bounds {
        Value::Array(items) if items.len() == 2 => (&items[0], &items[1]),
        _ => return false,
    };
    matches!(cmp_value_loose(actual, low), Ordering::Greater | Ordering::Equal)
        && matches!(cmp_value_loose(actual, high), Ordering::Less | Ordering::Equal)
}

/// SQL `LIKE`/`ILIKE` semantics: `%` matches any run of characters, `_`
/// matches exactly one.
fn sql_like(actual: &Value, pattern: &Value, case_insensitive: bool) -> bool {
    let Value::String(pattern) = pattern else {
        return false;
    };
    let text = value_label(actual);
    let (text, pattern) = if case_insensitive {
        (text.to_lowercase(), pattern.to_lowercase())
    } else {
        (text, pattern.clone())
    };
    like_match(text.as_bytes(), pattern.as_bytes())
}

fn like_match(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'%') => {
            like_match(text, &pattern[1..])
                || (!text.is_empty() && like_match(&text[1..], pattern))
        }
        Some(b'_') => !text.is_empty() && like_match(&text[1..], &pattern[1..]),
        Some(&c) => !text.is_empty() && text[0] == c && like_match(&text[1..], &pattern[1..]),
    }
}

// ---------------------------------------------------------------------------
// Technicals (§3.6, §4.5)
// ---------------------------------------------------------------------------

/// Apply technicals in declared metric order, in place, over rows already
/// sorted by grain. `group` mode partitions on every dimension but the last;
/// `all` mode is a single partition.
///
/// §4.5: "Rounding is applied after the technical." `metrics`/`formula_metrics`
/// are consulted only to look up the metric's own declared `rounding`; the
/// technical's output replaces the metric's raw aggregated value (§3.6) and
/// is re-rounded the same way `combine()` rounds the raw value.
pub fn apply_technicals(
    result: &mut CombinedResult,
    specs: &[TechnicalSpec],
    metrics: &[MetricSpec],
    formula_metrics: &[FormulaMetricSpec],
) {
    for spec in specs {
        let partitions = partition_indices(&result.rows, &result.dims, spec.mode);
        for indices in partitions {
            apply_technical_to_partition(result, &indices, spec);
        }
        if let Some(rounding) = rounding_for(metrics, formula_metrics, &spec.metric) {
            for row in &mut result.rows {
                round_in_place(row, &spec.metric, rounding);
            }
        }
    }
}

fn rounding_for(metrics: &[MetricSpec], formula_metrics: &[FormulaMetricSpec], name: &str) -> Option<i32> {
    metrics
        .iter()
        .find(|m| m.name == name)
        .and_then(|m| m.rounding)
        .or_else(|| {
            formula_metrics
                .iter()
                .find(|f| f.name == name)
                .and_then(|f| f.rounding)
        })
}

fn partition_indices(
    rows: &[Map<String, Value>],
    dims: &[String],
    mode: TechnicalMode,
) -> Vec<Vec<usize>> {
    match mode {
        TechnicalMode::All => vec![(0..rows.len()).collect()],
        TechnicalMode::Group => {
            let partition_dims: &[String] = if dims.is_empty() {
                dims
            } else {
                &dims[..dims.len() - 1]
            };
            let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, row) in rows.iter().enumerate() {
                let key = dim_key(row, partition_dims);
                groups.entry(key).or_default().push(i);
            }
            groups.into_values().collect()
        }
    }
}

fn apply_technical_to_partition(result: &mut CombinedResult, indices: &[usize], spec: &TechnicalSpec) {
    let values: Vec<Option<f64>> = indices
        .iter()
        .map(|&i| result.rows[i].get(&spec.metric).and_then(Value::as_f64))
        .collect();

    let out: Vec<Option<f64>> = match spec.kind {
        TechnicalKind::Mean(n) => rolling(&values, n, |w| w.iter().sum::<f64>() / w.len() as f64),
        TechnicalKind::Sum(n) => rolling(&values, n, |w| w.iter().sum::<f64>()),
        TechnicalKind::Boll(n) => rolling(&values, n, |w| w.iter().sum::<f64>() / w.len() as f64),
        TechnicalKind::CumSum => {
            let mut running = 0.0;
            values
                .iter()
                .map(|v| {
                    if let Some(v) = v {
                        running += v;
                        Some(running)
                    } else {
                        None
                    }
                })
                .collect()
        }
        TechnicalKind::Diff => {
            let mut out = Vec::with_capacity(values.len());
            for i in 0..values.len() {
                if i == 0 {
                    out.push(None);
                } else {
                    out.push(match (values[i], values[i - 1]) {
                        (Some(cur), Some(prev)) => Some(cur - prev),
                        _ => None,
                    });
                }
            }
            out
        }
        TechnicalKind::PctChange => {
            let mut out = Vec::with_capacity(values.len());
            for i in 0..values.len() {
                if i == 0 {
                    out.push(None);
                } else {
                    out.push(match (values[i], values[i - 1]) {
                        (Some(cur), Some(prev)) if prev != 0.0 => Some((cur - prev) / prev),
                        _ => None,
                    });
                }
            }
            out
        }
        TechnicalKind::Rank => {
            let mut ranked: Vec<(usize, f64)> = values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.map(|v| (i, v)))
                .collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
            let mut ranks = vec![None; values.len()];
            let mut rank = 0usize;
            let mut prev_value: Option<f64> = None;
            for (pos, (i, v)) in ranked.iter().enumerate() {
                if prev_value != Some(*v) {
                    rank = pos + 1;
                    prev_value = Some(*v);
                }
                ranks[*i] = Some(rank as f64);
            }
            ranks
        }
    };

    for (pos, &row_idx) in indices.iter().enumerate() {
        result.rows[row_idx].insert(
            spec.metric.clone(),
            out[pos].map(Value::from).unwrap_or(Value::Null),
        );
    }
}

/// Trailing window of size `n`; positions before the window is full are NULL
/// (§8 scenario 6: "the first four rows are NULL" for `mean(5)`).
fn rolling(values: &[Option<f64>], n: usize, f: impl Fn(&[f64]) -> f64) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        if i + 1 < n {
            out.push(None);
            continue;
        }
        let window = &values[i + 1 - n..=i];
        if window.iter().any(Option::is_none) {
            out.push(None);
        } else {
            let w: Vec<f64> = window.iter().map(|v| v.unwrap()).collect();
            out.push(Some(f(&w)));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Rollups (§4.5, §6.5)
// ---------------------------------------------------------------------------

/// Which prefix lengths (number of leading real dims retained, the rest
/// collapsed to the sentinel) get a rollup row for a grain of `n` dimensions.
fn rollup_prefixes(n: usize, mode: RollupMode) -> Vec<usize> {
    match mode {
        RollupMode::Totals => {
            if n == 0 {
                vec![]
            } else {
                vec![0]
            }
        }
        RollupMode::All => (0..n).collect(),
        RollupMode::Levels(k) => {
            let k = k.min(n);
            if k == 0 {
                vec![]
            } else {
                (n - k..n).collect()
            }
        }
    }
}

/// Append rollup rows at the requested prefix levels. Constituent aggregation
/// follows each metric's own aggregation semantics (§4.5 item: "Aggregation
/// across a rollup follows the metric's own aggregation").
pub fn apply_rollups(
    result: &mut CombinedResult,
    mode: RollupMode,
    metrics: &[MetricSpec],
    formula_metrics: &[FormulaMetricSpec],
    formula_dimensions: &[FormulaDimensionSpec],
) {
    let n = result.dims.len();
    let base_rows = result.rows.clone();
    if base_rows.is_empty() {
        // §8 boundary behavior: empty result set omits rollups.
        return;
    }

    for &p in &rollup_prefixes(n, mode) {
        let prefix_dims = &result.dims[..p];
        let mut groups: BTreeMap<String, Vec<&Map<String, Value>>> = BTreeMap::new();
        for row in &base_rows {
            let key = dim_key(row, prefix_dims);
            groups.entry(key).or_default().push(row);
        }
        for (_, members) in groups {
            let mut out_row = Map::new();
            for (i, d) in result.dims.iter().enumerate() {
                let value = if i < p {
                    members[0].get(d).cloned().unwrap_or(Value::Null)
                } else {
                    rollup_sentinel()
                };
                out_row.insert(d.clone(), value);
            }
            for m in metrics {
                aggregate_rollup_metric(&mut out_row, &members, m);
            }
            for f in formula_dimensions {
                let value = eval_combined_formula(&f.formula, &out_row);
                out_row.insert(f.name.clone(), value.map(Value::from).unwrap_or(Value::Null));
            }
            for f in formula_metrics {
                let value = eval_combined_formula(&f.formula, &out_row);
                out_row.insert(f.name.clone(), value.map(Value::from).unwrap_or(Value::Null));
                if let Some(rounding) = f.rounding {
                    round_in_place(&mut out_row, &f.name, rounding);
                }
            }
            result.rollup_row_indices.push(result.rows.len());
            result.rows.push(out_row);
        }
    }
}

fn aggregate_rollup_metric(out_row: &mut Map<String, Value>, members: &[&Map<String, Value>], m: &MetricSpec) {
    match m.aggregation {
        Aggregation::Avg | Aggregation::Median => {
            let num_col = format!("{}__num", m.name);
            let den_col = format!("{}__den", m.name);
            let num: f64 = members
                .iter()
                .filter_map(|r| r.get(&num_col).and_then(Value::as_f64))
                .sum();
            let den: f64 = members
                .iter()
                .filter_map(|r| r.get(&den_col).and_then(Value::as_f64))
                .sum();
            let value = if den != 0.0 { Some(num / den) } else { None };
            out_row.insert(num_col, Value::from(num));
            out_row.insert(den_col, Value::from(den));
            out_row.insert(m.name.clone(), value.map(Value::from).unwrap_or(Value::Null));
        }
        Aggregation::Min => {
            let value = members
                .iter()
                .filter_map(|r| r.get(&m.name).and_then(Value::as_f64))
                .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v))));
            out_row.insert(m.name.clone(), value.map(Value::from).unwrap_or(Value::Null));
        }
        Aggregation::Max => {
            let value = members
                .iter()
                .filter_map(|r| r.get(&m.name).and_then(Value::as_f64))
                .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))));
            out_row.insert(m.name.clone(), value.map(Value::from).unwrap_or(Value::Null));
        }
        _ => {
            // Sum, Count, CountDistinct and the rest: sum the constituent
            // per-row values, honoring `ifnull` for an all-missing group.
            let mut any = false;
            let mut total = 0.0;
            for r in members {
                if let Some(v) = r.get(&m.name).and_then(Value::as_f64) {
                    any = true;
                    total += v;
                }
            }
            let value = if any {
                Some(total)
            } else {
                m.ifnull
            };
            out_row.insert(m.name.clone(), value.map(Value::from).unwrap_or(Value::Null));
        }
    }
    if let Some(rounding) = m.rounding {
        round_in_place(out_row, &m.name, rounding);
    }
}

// ---------------------------------------------------------------------------
// Ordering, limit, pivot (§4.5)
// ---------------------------------------------------------------------------

/// Order by the declared clause if any, otherwise by grain. Rollup sentinel
/// values always sort after every real value within their column (§6.5).
pub fn apply_order(result: &mut CombinedResult, order_by: &[OrderSpec]) {
    if order_by.is_empty() {
        result.rows.sort_by(|a, b| cmp_rows_by_dims(a, b, &result.dims));
        return;
    }
    result.rows.sort_by(|a, b| {
        for spec in order_by {
            let av = a.get(&spec.column).unwrap_or(&Value::Null);
            let bv = b.get(&spec.column).unwrap_or(&Value::Null);
            let mut ord = if result.dims.contains(&spec.column) {
                cmp_dim_value(av, bv)
            } else {
                cmp_value_loose(av, bv)
            };
            if matches!(spec.direction, OrderDirection::Desc) {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

pub fn apply_limit(result: &mut CombinedResult, limit: usize) {
    if result.rows.len() > limit {
        let kept_rollups: Vec<usize> = result
            .rollup_row_indices
            .iter()
            .copied()
            .filter(|&i| i < limit)
            .collect();
        result.rows.truncate(limit);
        result.rollup_row_indices = kept_rollups;
    }
}

/// Rotate `pivot_dims` out of the row index and into columns, one column per
/// `(pivot value tuple, metric)` combination.
pub fn apply_pivot(result: &CombinedResult, pivot_dims: &[String]) -> QueryResult {
    let row_dims: Vec<String> = result
        .dims
        .iter()
        .filter(|d| !pivot_dims.contains(d))
        .cloned()
        .collect();

    let mut pivot_values: Vec<Vec<Value>> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for row in &result.rows {
        let tuple: Vec<Value> = pivot_dims
            .iter()
            .map(|d| row.get(d).cloned().unwrap_or(Value::Null))
            .collect();
        let key = serde_json::to_string(&tuple).unwrap_or_default();
        if seen.insert(key) {
            pivot_values.push(tuple);
        }
    }

    let mut grouped: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    let mut group_order: Vec<String> = Vec::new();
    for row in &result.rows {
        let key = dim_key(row, &row_dims);
        if !grouped.contains_key(&key) {
            group_order.push(key.clone());
            let mut base = Map::new();
            for d in &row_dims {
                base.insert(d.clone(), row.get(d).cloned().unwrap_or(Value::Null));
            }
            grouped.insert(key.clone(), base);
        }
        let pivot_tuple: Vec<Value> = pivot_dims
            .iter()
            .map(|d| row.get(d).cloned().unwrap_or(Value::Null))
            .collect();
        let suffix = pivot_tuple
            .iter()
            .map(value_label)
            .collect::<Vec<_>>()
            .join("_");
        let entry = grouped.get_mut(&key).unwrap();
        for metric in &result.metrics {
            let col = format!("{}_{}", suffix, metric);
            entry.insert(col, row.get(metric).cloned().unwrap_or(Value::Null));
        }
    }

    let mut columns: Vec<ColumnMeta> = row_dims.iter().map(|d| ColumnMeta { name: d.clone() }).collect();
    for tuple in &pivot_values {
        let suffix = tuple.iter().map(value_label).collect::<Vec<_>>().join("_");
        for metric in &result.metrics {
            columns.push(ColumnMeta {
                name: format!("{}_{}", suffix, metric),
            });
        }
    }

    let rows = group_order
        .into_iter()
        .map(|key| grouped.remove(&key).unwrap_or_default())
        .collect();

    QueryResult { columns, rows }
}

fn value_label(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
