//! End-to-end coverage of the six concrete scenarios against the sample
//! schema `partners -> campaigns -> leads -> sales`, exercising the Planner
//! (`plan_report`) and the Combined-Layer Engine (`combine`/`apply_rollups`/
//! `apply_technicals`) the way a Report actually chains them.

use std::collections::BTreeMap;

use meridian::combined::{
    self, apply_rollups, apply_technicals, DsFrame, MetricSpec, RollupMode, TechnicalKind,
    TechnicalMode, TechnicalSpec,
};
use meridian::flows::{Aggregation, Dimension, Expr, Filter, FilterOp, Measure, SemanticTable, TableKind};
use meridian::planner::{plan_report, ReportParams};
use meridian::registry::FlowRegistry;
use meridian::MeridianError;
use serde_json::{json, Value};

fn col(name: &str) -> Expr {
    Expr::Column {
        column: name.to_string(),
    }
}

fn dim(column: &str) -> Dimension {
    Dimension {
        expr: col(column),
        data_type: None,
        description: None,
    }
}

fn count_measure() -> Measure {
    Measure {
        expr: Some(col("id")),
        agg: Some(Aggregation::Count),
        formula: None,
        filter: None,
        post_expr: None,
        data_type: Some("int".to_string()),
        description: None,
        weighting_metric: None,
        required_grain: Vec::new(),
        ifnull: None,
        rounding: None,
        divisors: None,
    }
}

fn sum_measure(column: &str) -> Measure {
    Measure {
        expr: Some(col(column)),
        agg: Some(Aggregation::Sum),
        formula: None,
        filter: None,
        post_expr: None,
        data_type: Some("double".to_string()),
        description: None,
        weighting_metric: None,
        required_grain: Vec::new(),
        ifnull: None,
        rounding: None,
        divisors: None,
    }
}

/// `partners -> campaigns -> leads -> sales`, one-to-many parent lineage
/// throughout (§1 Non-goals rule out many-to-many joins).
fn sample_registry() -> FlowRegistry {
    let partners = SemanticTable {
        data_source: "warehouse".to_string(),
        name: "partners".to_string(),
        table: "partners".to_string(),
        primary_keys: vec!["id".to_string()],
        time_dimension: None,
        smallest_time_grain: None,
        dimensions: BTreeMap::from([("partner_name".to_string(), dim("name"))]),
        measures: BTreeMap::new(),
        description: None,
        table_kind: TableKind::Dimension,
        parent: None,
        siblings: Vec::new(),
        incomplete_dimensions: Vec::new(),
        priority: 0,
    };

    let campaigns = SemanticTable {
        data_source: "warehouse".to_string(),
        name: "campaigns".to_string(),
        table: "campaigns".to_string(),
        primary_keys: vec!["id".to_string()],
        time_dimension: None,
        smallest_time_grain: None,
        dimensions: BTreeMap::from([("campaign_name".to_string(), dim("name"))]),
        measures: BTreeMap::new(),
        description: None,
        table_kind: TableKind::Dimension,
        parent: Some("partners".to_string()),
        siblings: Vec::new(),
        incomplete_dimensions: Vec::new(),
        priority: 0,
    };

    let leads = SemanticTable {
        data_source: "warehouse".to_string(),
        name: "leads".to_string(),
        table: "leads".to_string(),
        primary_keys: vec!["id".to_string()],
        time_dimension: None,
        smallest_time_grain: None,
        dimensions: BTreeMap::new(),
        measures: BTreeMap::from([("leads".to_string(), count_measure())]),
        description: None,
        table_kind: TableKind::Metric,
        parent: Some("campaigns".to_string()),
        siblings: Vec::new(),
        incomplete_dimensions: Vec::new(),
        priority: 0,
    };

    let sales = SemanticTable {
        data_source: "warehouse".to_string(),
        name: "sales".to_string(),
        table: "sales".to_string(),
        primary_keys: vec!["id".to_string()],
        time_dimension: Some("sale_date".to_string()),
        smallest_time_grain: None,
        dimensions: BTreeMap::from([("date".to_string(), dim("sale_date"))]),
        measures: BTreeMap::from([
            ("sales".to_string(), count_measure()),
            ("revenue".to_string(), sum_measure("amount")),
        ]),
        description: None,
        table_kind: TableKind::Metric,
        parent: Some("leads".to_string()),
        siblings: Vec::new(),
        incomplete_dimensions: Vec::new(),
        priority: 0,
    };

    // The Planner synthesizes its own join chain per TableSet
    // (`schema_graph::build_flow_for_tableset`) from declared `parent`
    // lineage rather than a pre-registered flow, so no named `SemanticFlow`
    // needs registering here.
    FlowRegistry::from_parts(vec![partners, campaigns, leads, sales], vec![])
}

// ---------------------------------------------------------------------------
// Scenario 1: metrics=[sales, leads, revenue], dimensions=[partner_name]
// ---------------------------------------------------------------------------

#[test]
fn scenario_1_plans_a_single_query_covering_all_three_metrics() {
    let registry = sample_registry();
    let warehouse = meridian::Warehouse::new(
        registry,
        meridian::ConnectionManager::new(),
        meridian::GlobalConfig::default(),
    );
    let params = ReportParams {
        metrics: vec!["sales".to_string(), "leads".to_string(), "revenue".to_string()],
        dimensions: vec!["partner_name".to_string()],
        ..Default::default()
    };
    let (plans, spec) = plan_report(&warehouse, &params).unwrap();
    // sales & revenue live on `sales`, leads lives on `leads` - distinct
    // tables, but both reachable from one DataSource's join chain, so the
    // Planner should still emit at most two plans (one per TableSet shape).
    assert!(!plans.is_empty());
    assert_eq!(spec.metrics.len(), 3);

    // Combined-Layer check: the documented per-partner totals reconcile.
    let frame = DsFrame {
        source_name: "warehouse".to_string(),
        grain: vec!["partner_name".to_string()],
        rows: vec![
            row(&[("partner_name", json!("Partner A")), ("sales", json!(11)), ("leads", json!(4)), ("revenue", json!(165.0))]),
            row(&[("partner_name", json!("Partner B")), ("sales", json!(2)), ("leads", json!(2)), ("revenue", json!(19.0))]),
            row(&[("partner_name", json!("Partner C")), ("sales", json!(5)), ("leads", json!(1)), ("revenue", json!(118.5))]),
        ],
    };
    let metrics = vec![
        MetricSpec { name: "sales".to_string(), aggregation: Aggregation::Count, ifnull: None, rounding: None },
        MetricSpec { name: "leads".to_string(), aggregation: Aggregation::Count, ifnull: None, rounding: None },
        MetricSpec { name: "revenue".to_string(), aggregation: Aggregation::Sum, ifnull: None, rounding: None },
    ];
    let combined = combined::combine(&[frame], &["partner_name".to_string()], &metrics, &[], &[]).unwrap();
    assert_eq!(combined.rows.len(), 3);
    let a = &combined.rows[0];
    assert_eq!(a["sales"], json!(11.0));
    assert_eq!(a["leads"], json!(4.0));
    assert_eq!(a["revenue"], json!(165.0));
}

// ---------------------------------------------------------------------------
// Scenario 2: filtered by partner_name, grouped by campaign_name
// ---------------------------------------------------------------------------

#[test]
fn scenario_2_criteria_become_part_of_the_planned_grain() {
    let registry = sample_registry();
    let warehouse = meridian::Warehouse::new(
        registry,
        meridian::ConnectionManager::new(),
        meridian::GlobalConfig::default(),
    );
    let params = ReportParams {
        metrics: vec!["sales".to_string(), "leads".to_string(), "revenue".to_string()],
        dimensions: vec!["campaign_name".to_string()],
        criteria: vec![Filter {
            field: "partner_name".to_string(),
            op: FilterOp::Eq,
            value: Value::String("Partner A".to_string()),
        }],
        ..Default::default()
    };
    let (plans, _spec) = plan_report(&warehouse, &params).unwrap();
    assert!(!plans.is_empty());
    for plan in &plans {
        assert!(plan.request.filters.iter().any(|f| f.field == "partner_name"));
    }
}

// ---------------------------------------------------------------------------
// Scenario 3: rollup=ALL over [partner_name, campaign_name]
// ---------------------------------------------------------------------------

#[test]
fn scenario_3_rollup_all_produces_partner_and_grand_totals() {
    let dims = vec!["partner_name".to_string(), "campaign_name".to_string()];
    let frame = DsFrame {
        source_name: "warehouse".to_string(),
        grain: dims.clone(),
        rows: vec![
            row(&[("partner_name", json!("Partner A")), ("campaign_name", json!("Campaign 1A")), ("sales", json!(5)), ("leads", json!(2)), ("revenue", json!(83.0))]),
            row(&[("partner_name", json!("Partner A")), ("campaign_name", json!("Campaign 2A")), ("sales", json!(6)), ("leads", json!(2)), ("revenue", json!(82.0))]),
            row(&[("partner_name", json!("Partner B")), ("campaign_name", json!("Campaign 1B")), ("sales", json!(2)), ("leads", json!(2)), ("revenue", json!(19.0))]),
            row(&[("partner_name", json!("Partner C")), ("campaign_name", json!("Campaign 1C")), ("sales", json!(5)), ("leads", json!(1)), ("revenue", json!(118.5))]),
        ],
    };
    let metrics = vec![
        MetricSpec { name: "sales".to_string(), aggregation: Aggregation::Count, ifnull: None, rounding: None },
        MetricSpec { name: "leads".to_string(), aggregation: Aggregation::Count, ifnull: None, rounding: None },
        MetricSpec { name: "revenue".to_string(), aggregation: Aggregation::Sum, ifnull: None, rounding: None },
    ];
    let mut combined = combined::combine(&[frame], &dims, &metrics, &[], &[]).unwrap();
    apply_rollups(&mut combined, RollupMode::All, &metrics, &[], &[]);

    let sentinel = combined::rollup_sentinel();
    let partner_a_total = combined
        .rows
        .iter()
        .find(|r| r["partner_name"] == json!("Partner A") && r["campaign_name"] == sentinel)
        .expect("partner A rollup row present");
    assert_eq!(partner_a_total["sales"], json!(11.0));
    assert_eq!(partner_a_total["leads"], json!(4.0));
    assert_eq!(partner_a_total["revenue"], json!(165.0));

    let grand_total = combined
        .rows
        .iter()
        .find(|r| r["partner_name"] == sentinel && r["campaign_name"] == sentinel)
        .expect("grand total row present");
    assert_eq!(grand_total["sales"], json!(18.0));
    assert_eq!(grand_total["leads"], json!(7.0));
    assert_eq!(grand_total["revenue"], json!(302.5));
}

// ---------------------------------------------------------------------------
// Scenario 4: leads fanning out downward to sale_id is illegal
// ---------------------------------------------------------------------------

#[test]
fn scenario_4_downward_fanout_raises_unsupported_grain() {
    let registry = sample_registry();
    let warehouse = meridian::Warehouse::new(
        registry,
        meridian::ConnectionManager::new(),
        meridian::GlobalConfig::default(),
    );
    let params = ReportParams {
        metrics: vec!["leads".to_string()],
        dimensions: vec!["sale_id".to_string()],
        ..Default::default()
    };
    let err = plan_report(&warehouse, &params).unwrap_err();
    assert!(matches!(err, MeridianError::UnsupportedGrainError { .. }));
}

// ---------------------------------------------------------------------------
// Scenario 5: ad-hoc formula metric `my_rpl = revenue/leads`
// ---------------------------------------------------------------------------

#[test]
fn scenario_5_ad_hoc_formula_is_planned_and_evaluated_without_leaking() {
    let registry = sample_registry();
    let warehouse = meridian::Warehouse::new(
        registry,
        meridian::ConnectionManager::new(),
        meridian::GlobalConfig::default(),
    );
    let params = ReportParams {
        metrics: vec!["revenue".to_string()],
        ad_hoc_formula_metrics: vec![meridian::AdHocFormulaMetric {
            name: "my_rpl".to_string(),
            formula: "{revenue}/{leads}".to_string(),
            rounding: Some(2),
        }],
        dimensions: vec!["partner_name".to_string()],
        ..Default::default()
    };
    let (_plans, spec) = plan_report(&warehouse, &params).unwrap();
    assert_eq!(spec.formula_metrics.len(), 1);
    assert_eq!(spec.formula_metrics[0].name, "my_rpl");
    // leads is a dependency pulled in solely to support the formula; it must
    // not surface as a user-visible metric column.
    assert!(!spec.metrics.iter().any(|m| m.name == "my_rpl"));

    let frame = DsFrame {
        source_name: "warehouse".to_string(),
        grain: vec!["partner_name".to_string()],
        rows: vec![row(&[
            ("partner_name", json!("Partner A")),
            ("revenue", json!(165.0)),
            ("leads", json!(4)),
        ])],
    };
    let metrics = vec![
        MetricSpec { name: "revenue".to_string(), aggregation: Aggregation::Sum, ifnull: None, rounding: None },
        MetricSpec { name: "leads".to_string(), aggregation: Aggregation::Count, ifnull: None, rounding: None },
    ];
    let combined = combined::combine(&[frame], &["partner_name".to_string()], &metrics, &spec.formula_metrics, &[]).unwrap();
    assert_eq!(combined.rows[0]["my_rpl"], json!(41.25));
}

// ---------------------------------------------------------------------------
// Scenario 6: revenue_ma_5 is a mean(5) technical applied post-aggregation
// ---------------------------------------------------------------------------

#[test]
fn scenario_6_mean_technical_is_null_until_the_window_fills() {
    let dims = vec!["date".to_string()];
    let frame = DsFrame {
        source_name: "warehouse".to_string(),
        grain: dims.clone(),
        rows: (1..=7)
            .map(|day| {
                row(&[
                    ("date", json!(format!("2020-01-{day:02}"))),
                    ("revenue", json!(10.0 * day as f64)),
                ])
            })
            .collect(),
    };
    let metrics = vec![MetricSpec {
        name: "revenue".to_string(),
        aggregation: Aggregation::Sum,
        ifnull: None,
        rounding: None,
    }];
    let mut combined = combined::combine(&[frame], &dims, &metrics, &[], &[]).unwrap();
    // `revenue_ma_5` is the technical's output column name in the Report, but
    // the Combined Layer computes it over the already-aggregated `revenue`
    // series and writes it under its own metric name.
    combined.metrics.push("revenue_ma_5".to_string());
    for r in &mut combined.rows {
        r.insert("revenue_ma_5".to_string(), r["revenue"].clone());
    }
    apply_technicals(
        &mut combined,
        &[TechnicalSpec {
            metric: "revenue_ma_5".to_string(),
            kind: TechnicalKind::Mean(5),
            mode: TechnicalMode::All,
        }],
        &metrics,
        &[],
    );
    for i in 0..4 {
        assert_eq!(combined.rows[i]["revenue_ma_5"], Value::Null);
    }
    // day 5: mean(10,20,30,40,50) = 30
    assert_eq!(combined.rows[4]["revenue_ma_5"], json!(30.0));
    // day 6: mean(20,30,40,50,60) = 40
    assert_eq!(combined.rows[5]["revenue_ma_5"], json!(40.0));
    // day 7: mean(30,40,50,60,70) = 50
    assert_eq!(combined.rows[6]["revenue_ma_5"], json!(50.0));
}

fn row(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
