//! Table relationships and join-path enumeration (§3.3, §4.2).
//!
//! A [`FlowRegistry`] already holds the tables; this module answers the
//! questions the Planner needs about how they relate: which dimensions a
//! table provides directly, which tables are one join step away, and which
//! join sets reach a given dimension grain from a starting metric table.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::error::{MeridianError, Result};
use crate::flows::{
    FlowJoin, FlowTableRef, JoinCardinality, JoinKey, JoinType, SemanticFlow, SemanticTable,
    TableKind,
};
use crate::registry::FlowRegistry;

/// Rule 4 of §4.2: is dimension `dim` available directly off `table` without
/// any further join? True when the table binds the dimension and it is
/// either a primary-key column, not flagged incomplete, or the table is a
/// pure dimension table (no fan-out risk either way).
pub fn dimension_provided_by_table(table: &SemanticTable, dim: &str) -> bool {
    if !table.dimensions.contains_key(dim) {
        return false;
    }
    if table.table_kind == TableKind::Dimension {
        return true;
    }
    if table.primary_keys.iter().any(|pk| pk == dim) {
        return true;
    }
    !table.incomplete_dimensions.iter().any(|d| d == dim)
}

/// Tables one join step away from `table`: its declared parent (upward,
/// rule 1) and its declared siblings (lateral, rule 3). Never children —
/// a parent may not join downward to pick up dimensions (rule 2).
pub fn find_neighbor_tables<'a>(
    registry: &'a FlowRegistry,
    table: &SemanticTable,
) -> Vec<&'a SemanticTable> {
    let mut out = Vec::new();
    if let Some(parent_name) = &table.parent {
        if let Some(parent) = registry.get_table(parent_name) {
            out.push(parent);
        }
    }
    for sibling_name in &table.siblings {
        if let Some(sibling) = registry.get_table(sibling_name) {
            out.push(sibling);
        }
    }
    out
}

/// Transitive closure of `table`'s children (tables declaring it as
/// `parent`), breadth-first. Exposed per §4.2 even though join enumeration
/// for grain satisfaction never descends (rule 2).
pub fn find_descendent_tables<'a>(
    registry: &'a FlowRegistry,
    table: &SemanticTable,
) -> Vec<&'a SemanticTable> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut frontier = VecDeque::new();
    frontier.push_back(table.name.clone());
    while let Some(name) = frontier.pop_front() {
        for candidate in registry.tables.values() {
            if candidate.parent.as_deref() == Some(name.as_str()) && seen.insert(candidate.name.clone()) {
                out.push(candidate);
                frontier.push_back(candidate.name.clone());
            }
        }
    }
    out
}

/// A metric table plus the join chain sufficient to produce a report's
/// grain (Glossary: TableSet). `joined_tables` is a linear chain: each
/// entry attaches to the previous one (or to `metric_table` for the
/// first), reflecting that every join here is either upward to a parent
/// or lateral to a sibling of the table already in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSet {
    pub metric_table: String,
    pub joined_tables: Vec<String>,
}

impl TableSet {
    pub fn join_count(&self) -> usize {
        self.joined_tables.len()
    }

    pub fn all_tables(&self) -> Vec<&String> {
        std::iter::once(&self.metric_table)
            .chain(self.joined_tables.iter())
            .collect()
    }
}

/// Enumerate legal join sets (§4.2 "Join enumeration") that take
/// `metric_table` to a grain covering every dimension in `grain`. Bounded by
/// `max_joins` (|join set| upper bound) and `max_candidates` (returned
/// covers). Deterministic: increasing join count, then table priority
/// (descending), then lexicographic table name.
pub fn enumerate_joins_for_grain(
    registry: &FlowRegistry,
    metric_table: &str,
    grain: &BTreeSet<String>,
    max_joins: usize,
    max_candidates: usize,
) -> Vec<TableSet> {
    let Some(start) = registry.get_table(metric_table) else {
        return Vec::new();
    };

    let covered_directly: BTreeSet<String> = grain
        .iter()
        .filter(|d| dimension_provided_by_table(start, d))
        .cloned()
        .collect();

    if grain.is_subset(&covered_directly) {
        return vec![TableSet {
            metric_table: metric_table.to_string(),
            joined_tables: Vec::new(),
        }];
    }

    let mut results = Vec::new();
    let mut seen_sets = HashSet::new();
    let mut queue: VecDeque<(Vec<String>, BTreeSet<String>)> = VecDeque::new();
    queue.push_back((Vec::new(), covered_directly));

    while let Some((joined, covered)) = queue.pop_front() {
        if grain.is_subset(&covered) {
            if seen_sets.insert(joined.clone()) {
                results.push(TableSet {
                    metric_table: metric_table.to_string(),
                    joined_tables: joined,
                });
                if results.len() >= max_candidates {
                    break;
                }
            }
            continue;
        }

        if joined.len() >= max_joins {
            continue;
        }

        let frontier_name = joined.last().cloned().unwrap_or_else(|| metric_table.to_string());
        let Some(frontier) = registry.get_table(&frontier_name) else {
            continue;
        };

        let mut neighbors = find_neighbor_tables(registry, frontier);
        neighbors.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));

        for neighbor in neighbors {
            if neighbor.name == metric_table || joined.iter().any(|j| j == &neighbor.name) {
                continue;
            }
            let mut new_joined = joined.clone();
            new_joined.push(neighbor.name.clone());
            let mut new_covered = covered.clone();
            for dim in grain {
                if dimension_provided_by_table(neighbor, dim) {
                    new_covered.insert(dim.clone());
                }
            }
            queue.push_back((new_joined, new_covered));
        }
    }

    results.sort_by(|a, b| {
        a.join_count()
            .cmp(&b.join_count())
            .then_with(|| a.joined_tables.cmp(&b.joined_tables))
    });
    results.truncate(max_candidates);
    results
}

/// Derive the join-key pair for attaching `joined` onto `attach_point`:
/// assumes the FK column on `attach_point` shares `joined`'s primary-key
/// column names, the convention every hand-authored flow in this crate
/// follows.
fn infer_join_keys(joined: &SemanticTable) -> Vec<JoinKey> {
    joined
        .primary_keys
        .iter()
        .map(|pk| JoinKey {
            left: pk.clone(),
            right: pk.clone(),
        })
        .collect()
}

/// Materialize a [`TableSet`] into a [`SemanticFlow`] the query builder can
/// compile directly, without registering it under the shared registry.
pub fn build_flow_for_tableset(
    registry: &FlowRegistry,
    set: &TableSet,
    flow_name: &str,
) -> Result<SemanticFlow> {
    let base = registry.get_table(&set.metric_table).ok_or_else(|| {
        MeridianError::Schema(format!("metric table '{}' not found", set.metric_table))
    })?;

    let mut joins = BTreeMap::new();
    let mut prior_alias = base.name.clone();
    for joined_name in &set.joined_tables {
        let joined_table = registry.get_table(joined_name).ok_or_else(|| {
            MeridianError::Schema(format!("joined table '{joined_name}' not found"))
        })?;
        joins.insert(
            joined_name.clone(),
            FlowJoin {
                semantic_table: joined_name.clone(),
                alias: joined_name.clone(),
                to_table: prior_alias.clone(),
                join_type: JoinType::Left,
                join_keys: infer_join_keys(joined_table),
                cardinality: Some(JoinCardinality::ManyToOne),
                description: None,
            },
        );
        prior_alias = joined_name.clone();
    }

    Ok(SemanticFlow {
        name: flow_name.to_string(),
        base_table: FlowTableRef {
            semantic_table: base.name.clone(),
            alias: base.name.clone(),
        },
        joins,
        description: None,
    })
}
