use crate::flows::{Filter, FilterOp};
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

pub(crate) fn render_filter_expr(base_expr: SqlExpr, filter: &Filter) -> SqlExpr {
    match filter.op {
        FilterOp::In | FilterOp::NotIn => {
            let list = match &filter.value {
                serde_json::Value::Array(items) => {
                    items.iter().map(|v| SqlExpr::Literal(v.clone())).collect()
                }
                other => vec![SqlExpr::Literal(other.clone())],
            };
            SqlExpr::InList {
                expr: Box::new(base_expr),
                list,
                negated: matches!(filter.op, FilterOp::NotIn),
            }
        }
        FilterOp::Between | FilterOp::NotBetween => {
            let (low, high) = match &filter.value {
                serde_json::Value::Array(items) if items.len() == 2 => {
                    (items[0].clone(), items[1].clone())
                }
                other => (other.clone(), other.clone()),
            };
            SqlExpr::Between {
                expr: Box::new(base_expr),
                low: Box::new(SqlExpr::Literal(low)),
                high: Box::new(SqlExpr::Literal(high)),
                negated: matches!(filter.op, FilterOp::NotBetween),
            }
        }
        FilterOp::IsNull | FilterOp::IsNotNull => SqlExpr::IsNull {
            expr: Box::new(base_expr),
            negated: matches!(filter.op, FilterOp::IsNotNull),
        },
        _ => {
            let op = match filter.op {
                FilterOp::Eq => SqlBinaryOperator::Eq,
                FilterOp::Neq => SqlBinaryOperator::Neq,
                FilterOp::Gt => SqlBinaryOperator::Gt,
                FilterOp::Gte => SqlBinaryOperator::Gte,
                FilterOp::Lt => SqlBinaryOperator::Lt,
                FilterOp::Lte => SqlBinaryOperator::Lte,
                FilterOp::Like => SqlBinaryOperator::Like,
                FilterOp::NotLike => SqlBinaryOperator::NotLike,
                FilterOp::ILike => SqlBinaryOperator::ILike,
                FilterOp::In
                | FilterOp::NotIn
                | FilterOp::Between
                | FilterOp::NotBetween
                | FilterOp::IsNull
                | FilterOp::IsNotNull => unreachable!(),
                FilterOp::InReport | FilterOp::NotInReport => unreachable!(
                    "subreport criteria must be resolved to In/NotIn before query building"
                ),
            };
            SqlExpr::BinaryOp {
                op,
                left: Box::new(base_expr),
                right: Box::new(SqlExpr::Literal(filter.value.clone())),
            }
        }
    }
}
