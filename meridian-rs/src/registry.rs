//! Per-DataSource table and flow catalogue.
//!
//! A [`FlowRegistry`] holds the [`SemanticTable`]s that belong to one DataSource
//! (physical tables plus their column to field bindings) and the
//! [`SemanticFlow`]s declared against them (pre-declared join graphs used by
//! the query compiler in [`crate::query_builder`]).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;

use crate::error::{MeridianError, Result};
use crate::expr_parser::parse_formula;
use crate::flows::{FormulaExpr, Measure, SemanticFlow, SemanticTable};

#[derive(Debug, Default, Clone)]
pub struct FlowRegistry {
    pub tables: HashMap<String, SemanticTable>,
    pub flows: HashMap<String, SemanticFlow>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(tables: Vec<SemanticTable>, flows: Vec<SemanticFlow>) -> Self {
        let mut registry = FlowRegistry::new();
        for table in tables {
            registry.tables.insert(table.name.clone(), table);
        }
        for flow in flows {
            registry.flows.insert(flow.name.clone(), flow);
        }
        registry
    }

    /// Load every `*.yml`/`*.yaml` file under `<root>/tables` and `<root>/flows`.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let mut registry = FlowRegistry::new();
        registry.load_tables(root.as_ref().join("tables"))?;
        let flows_dir = root.as_ref().join("flows");
        if flows_dir.exists() {
            registry.load_flows(flows_dir)?;
        }
        registry.expand_divisors()?;
        registry.validate_siblings()?;
        Ok(registry)
    }

    /// §4.1 "Divisors / aggregation variants": generate `{base}_per_{divisor}`
    /// formula measures from every `Measure::divisors` declaration. Run once,
    /// right after tables are loaded, so later lookups (planner, validator)
    /// see the generated measures like any other.
    fn expand_divisors(&mut self) -> Result<()> {
        for table in self.tables.values_mut() {
            let generated: Vec<(String, String)> = table
                .measures
                .iter()
                .filter_map(|(base_name, measure)| {
                    let divisors = measure.divisors.as_ref()?;
                    Some((base_name.clone(), divisors.metrics.clone(), divisors.formula.clone()))
                })
                .flat_map(|(base_name, divisor_metrics, formula_template)| {
                    divisor_metrics.into_iter().map(move |divisor| {
                        let name = format!("{base_name}_per_{divisor}");
                        let raw = formula_template
                            .replace("{base}", &base_name)
                            .replace("{divisor}", &divisor);
                        (name, raw)
                    })
                })
                .collect();

            for (name, raw) in generated {
                let ast = parse_formula(&raw).map_err(|e| {
                    MeridianError::InvalidFieldConfig(format!(
                        "divisor-generated measure '{name}' on table '{}' has an invalid formula '{raw}': {e}",
                        table.name
                    ))
                })?;
                let measure = Measure {
                    expr: None,
                    agg: None,
                    formula: Some(FormulaExpr { raw, ast }),
                    filter: None,
                    post_expr: None,
                    data_type: None,
                    description: None,
                    weighting_metric: None,
                    required_grain: Vec::new(),
                    ifnull: None,
                    rounding: None,
                    divisors: None,
                };
                table.measures.entry(name).or_insert(measure);
            }
        }
        Ok(())
    }

    /// §3.3/§4.2 rule 3, §9 Open Question: a declared sibling pair must share
    /// the exact same primary key column set, so either side can be joined
    /// into without changing the query's grain.
    pub fn validate_siblings(&self) -> Result<()> {
        for table in self.tables.values() {
            for sibling_name in &table.siblings {
                let sibling = self.tables.get(sibling_name).ok_or_else(|| {
                    MeridianError::InvalidWarehouseConfig(format!(
                        "table '{}' declares sibling '{}' which does not exist",
                        table.name, sibling_name
                    ))
                })?;

                let mut own_pk: Vec<&String> = table.primary_keys.iter().collect();
                let mut sibling_pk: Vec<&String> = sibling.primary_keys.iter().collect();
                own_pk.sort();
                sibling_pk.sort();

                if own_pk != sibling_pk {
                    return Err(MeridianError::InvalidWarehouseConfig(format!(
                        "sibling tables '{}' and '{}' must share the same primary key; \
                         found {:?} vs {:?}",
                        table.name, sibling_name, table.primary_keys, sibling.primary_keys
                    )));
                }
            }
        }
        Ok(())
    }

    fn load_tables(&mut self, dir: PathBuf) -> Result<()> {
        if !dir.exists() {
            return Err(MeridianError::Validation(format!(
                "tables directory not found: {}",
                dir.display()
            )));
        }
        for entry in glob(&format!("{}/*.yml", dir.display()))
            .map_err(|e| MeridianError::Other(e.into()))?
            .flatten()
        {
            self.load_table_file(&entry)?;
        }
        for entry in glob(&format!("{}/*.yaml", dir.display()))
            .map_err(|e| MeridianError::Other(e.into()))?
            .flatten()
        {
            self.load_table_file(&entry)?;
        }
        Ok(())
    }

    fn load_table_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let table: SemanticTable = serde_yaml::from_str(&contents)?;
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    fn load_flows(&mut self, dir: PathBuf) -> Result<()> {
        for entry in glob(&format!("{}/*.yml", dir.display()))
            .map_err(|e| MeridianError::Other(e.into()))?
            .flatten()
        {
            self.load_flow_file(&entry)?;
        }
        for entry in glob(&format!("{}/*.yaml", dir.display()))
            .map_err(|e| MeridianError::Other(e.into()))?
            .flatten()
        {
            self.load_flow_file(&entry)?;
        }
        Ok(())
    }

    fn load_flow_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let flow: SemanticFlow = serde_yaml::from_str(&contents)?;
        self.flows.insert(flow.name.clone(), flow);
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Option<&SemanticTable> {
        self.tables.get(name)
    }

    pub fn get_flow(&self, name: &str) -> Option<&SemanticFlow> {
        self.flows.get(name)
    }

    pub fn insert_table(&mut self, table: SemanticTable) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn insert_flow(&mut self, flow: SemanticFlow) {
        self.flows.insert(flow.name.clone(), flow);
    }

    /// Tables that bind the given field name as a dimension or measure.
    pub fn tables_binding(&self, field: &str) -> Vec<&SemanticTable> {
        self.tables
            .values()
            .filter(|t| t.measures.contains_key(field) || t.dimensions.contains_key(field))
            .collect()
    }

    /// One-line summary of every declared flow, for catalogue/browsing APIs.
    pub fn list_flows(&self) -> Vec<FlowSummary> {
        self.flows
            .values()
            .map(|flow| FlowSummary {
                name: flow.name.clone(),
                description: flow.description.clone(),
                base_table: flow.base_table.semantic_table.clone(),
                dimensions: self.flow_dimension_names(flow),
                measures: self.flow_measure_names(flow),
            })
            .collect()
    }

    /// The full dimension/measure schema exposed by a flow.
    pub fn flow_schema(&self, name: &str) -> Result<FlowSchema> {
        let flow = self
            .get_flow(name)
            .ok_or_else(|| MeridianError::Validation(format!("unknown flow {name}")))?;

        let mut dimensions = Vec::new();
        let mut measures = Vec::new();
        for table in self.flow_tables(flow) {
            for (dim_name, dim) in &table.dimensions {
                dimensions.push(DimensionInfo {
                    name: dim_name.clone(),
                    data_type: dim.data_type.clone(),
                    description: dim.description.clone(),
                });
            }
            for (measure_name, measure) in &table.measures {
                measures.push(MeasureInfo {
                    name: measure_name.clone(),
                    data_type: measure.data_type.clone(),
                    description: measure.description.clone(),
                    is_formula: measure.is_formula(),
                });
            }
        }

        Ok(FlowSchema {
            flow: name.to_string(),
            dimensions,
            measures,
        })
    }

    fn flow_tables(&self, flow: &SemanticFlow) -> Vec<&SemanticTable> {
        let mut tables = Vec::new();
        if let Some(base) = self.get_table(&flow.base_table.semantic_table) {
            tables.push(base);
        }
        for join in flow.joins.values() {
            if let Some(table) = self.get_table(&join.semantic_table) {
                tables.push(table);
            }
        }
        tables
    }

    fn flow_dimension_names(&self, flow: &SemanticFlow) -> Vec<String> {
        self.flow_tables(flow)
            .iter()
            .flat_map(|t| t.dimensions.keys().cloned())
            .collect()
    }

    fn flow_measure_names(&self, flow: &SemanticFlow) -> Vec<String> {
        self.flow_tables(flow)
            .iter()
            .flat_map(|t| t.measures.keys().cloned())
            .collect()
    }
}

/// One-line catalogue entry for a flow.
#[derive(Debug, Clone)]
pub struct FlowSummary {
    pub name: String,
    pub description: Option<String>,
    pub base_table: String,
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
}

/// The full set of dimensions and measures a flow exposes.
#[derive(Debug, Clone)]
pub struct FlowSchema {
    pub flow: String,
    pub dimensions: Vec<DimensionInfo>,
    pub measures: Vec<MeasureInfo>,
}

#[derive(Debug, Clone)]
pub struct DimensionInfo {
    pub name: String,
    pub data_type: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MeasureInfo {
    pub name: String,
    pub data_type: Option<String>,
    pub description: Option<String>,
    pub is_formula: bool,
}
