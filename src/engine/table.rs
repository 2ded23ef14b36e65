//! Typed form of a resolved database step.

use serde_json::{Map, Value};

use crate::bundles::query::Action;
use crate::bundles::template::scalar_text;
use crate::error::StepError;
use crate::stats::as_f64;

pub const SEARCH_LIMIT: i64 = 10;
pub const FILTER_LIMIT: i64 = 50;
pub const RANGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregateFn {
    /// Unknown names fall back to `count`.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "count" => AggregateFn::Count,
            "sum" => AggregateFn::Sum,
            "avg" => AggregateFn::Avg,
            "max" => AggregateFn::Max,
            "min" => AggregateFn::Min,
            other => {
                tracing::warn!(function = %other, "Unknown aggregate function, using count");
                AggregateFn::Count
            }
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Max => "MAX",
            AggregateFn::Min => "MIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Scalar comparison operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Operand {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Operand::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Operand::Int)
                .or_else(|| n.as_f64().map(Operand::Float)),
            Value::Array(items) => items.first().and_then(Self::from_json),
            other => Some(Operand::Text(scalar_text(other))),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Operand::Int(n) => n.to_string(),
            Operand::Float(f) => f.to_string(),
            Operand::Bool(b) => b.to_string(),
            Operand::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableQuery {
    Search {
        table: String,
        column: String,
        value: String,
        limit: i64,
        order: Option<OrderBy>,
    },
    Filter {
        table: String,
        filters: Vec<(String, Operand)>,
        limit: i64,
        order: Option<OrderBy>,
    },
    Range {
        table: String,
        column: String,
        min: Option<Operand>,
        max: Option<Operand>,
        filters: Vec<(String, Operand)>,
        search: Option<(String, String)>,
        limit: i64,
        order: Option<OrderBy>,
    },
    Aggregate {
        table: String,
        group_by: String,
        function: AggregateFn,
        column: Option<String>,
        filters: Vec<(String, Operand)>,
    },
}

impl TableQuery {
    pub fn from_params(
        action: Action,
        table: &str,
        params: &Map<String, Value>,
    ) -> Result<Self, StepError> {
        let table = table.to_string();
        let query = match action {
            Action::Search => TableQuery::Search {
                table,
                column: required_text(params, "search", "search_column")?,
                value: required_text(params, "search", "search_value")?,
                limit: limit(params, SEARCH_LIMIT),
                order: order(params),
            },
            Action::Filter => TableQuery::Filter {
                table,
                filters: filters(params),
                limit: limit(params, FILTER_LIMIT),
                order: order(params),
            },
            Action::RangeFilter => TableQuery::Range {
                table,
                column: required_text(params, "range_filter", "column")?,
                min: params.get("min_value").and_then(Operand::from_json),
                max: params.get("max_value").and_then(Operand::from_json),
                filters: filters(params),
                search: optional_text(params, "search_column")
                    .zip(optional_text(params, "search_value")),
                limit: limit(params, RANGE_LIMIT),
                order: order(params),
            },
            Action::Aggregate => {
                let function = optional_text(params, "aggregate_function")
                    .map(|f| AggregateFn::parse(&f))
                    .unwrap_or(AggregateFn::Count);
                let column = optional_text(params, "aggregate_column").filter(|c| c != "*");
                if function != AggregateFn::Count && column.is_none() {
                    return Err(StepError::MissingParam {
                        action: "aggregate",
                        param: "aggregate_column",
                    });
                }
                TableQuery::Aggregate {
                    table,
                    group_by: required_text(params, "aggregate", "group_by")?,
                    function,
                    column,
                    filters: filters(params),
                }
            }
        };
        Ok(query)
    }

    pub fn table(&self) -> &str {
        match self {
            TableQuery::Search { table, .. }
            | TableQuery::Filter { table, .. }
            | TableQuery::Range { table, .. }
            | TableQuery::Aggregate { table, .. } => table,
        }
    }
}

fn optional_text(params: &Map<String, Value>, key: &str) -> Option<String> {
    params
        .get(key)
        .filter(|v| !v.is_null())
        .map(scalar_text)
        .filter(|s| !s.is_empty())
}

fn required_text(
    params: &Map<String, Value>,
    action: &'static str,
    param: &'static str,
) -> Result<String, StepError> {
    optional_text(params, param).ok_or(StepError::MissingParam { action, param })
}

fn limit(params: &Map<String, Value>, default: i64) -> i64 {
    params
        .get("limit")
        .and_then(as_f64)
        .map(|l| l as i64)
        .filter(|&l| l > 0)
        .unwrap_or(default)
}

fn order(params: &Map<String, Value>) -> Option<OrderBy> {
    let column = optional_text(params, "order_by")?;
    let descending = optional_text(params, "order_direction")
        .is_some_and(|d| d.eq_ignore_ascii_case("desc"));
    Some(OrderBy { column, descending })
}

/// `filters` may be an object or a JSON string of one. List values use their
/// first element; null values are dropped.
fn filters(params: &Map<String, Value>) -> Vec<(String, Operand)> {
    let parsed;
    let map = match params.get("filters") {
        Some(Value::Object(map)) => map,
        Some(Value::String(text)) => match serde_json::from_str::<Map<String, Value>>(text) {
            Ok(map) => {
                parsed = map;
                &parsed
            }
            Err(err) => {
                tracing::warn!(filters = %text, error = %err, "Ignoring unparsable filters");
                return Vec::new();
            }
        },
        _ => return Vec::new(),
    };
    map.iter()
        .filter_map(|(k, v)| Operand::from_json(v).map(|op| (k.clone(), op)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_search_defaults() {
        let query = TableQuery::from_params(
            Action::Search,
            "facility",
            &params(json!({"search_column": "slta_nm", "search_value": "서울숲"})),
        )
        .unwrap();
        assert_eq!(
            query,
            TableQuery::Search {
                table: "facility".to_string(),
                column: "slta_nm".to_string(),
                value: "서울숲".to_string(),
                limit: SEARCH_LIMIT,
                order: None,
            }
        );
    }

    #[test]
    fn test_search_missing_column() {
        let err = TableQuery::from_params(Action::Search, "t", &params(json!({"search_value": "x"})))
            .unwrap_err();
        assert!(matches!(
            err,
            StepError::MissingParam {
                param: "search_column",
                ..
            }
        ));
    }

    #[test]
    fn test_filter_values_normalized() {
        let query = TableQuery::from_params(
            Action::Filter,
            "reviews",
            &params(json!({
                "filters": {"slta_cd": ["SLTA062", "SLTA063"], "year": 2024, "skip": null, "empty": []},
                "limit": "20",
                "order_by": "created_at",
                "order_direction": "DESC"
            })),
        )
        .unwrap();
        match query {
            TableQuery::Filter {
                filters,
                limit,
                order,
                ..
            } => {
                assert_eq!(
                    filters,
                    vec![
                        ("slta_cd".to_string(), Operand::Text("SLTA062".to_string())),
                        ("year".to_string(), Operand::Int(2024)),
                    ]
                );
                assert_eq!(limit, 20);
                assert!(order.unwrap().descending);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_filters_as_json_string() {
        let query = TableQuery::from_params(
            Action::Filter,
            "t",
            &params(json!({"filters": "{\"a\": 1}", "limit": 0})),
        )
        .unwrap();
        match query {
            TableQuery::Filter { filters, limit, .. } => {
                assert_eq!(filters, vec![("a".to_string(), Operand::Int(1))]);
                assert_eq!(limit, FILTER_LIMIT);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_range_with_optional_bounds_and_search() {
        let query = TableQuery::from_params(
            Action::RangeFilter,
            "air",
            &params(json!({
                "column": "pm10",
                "min_value": 10,
                "search_column": "station",
                "search_value": "성동"
            })),
        )
        .unwrap();
        match query {
            TableQuery::Range {
                min, max, search, limit, ..
            } => {
                assert_eq!(min, Some(Operand::Int(10)));
                assert_eq!(max, None);
                assert_eq!(search, Some(("station".to_string(), "성동".to_string())));
                assert_eq!(limit, RANGE_LIMIT);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_unknown_function_counts() {
        let query = TableQuery::from_params(
            Action::Aggregate,
            "visits",
            &params(json!({"group_by": "month", "aggregate_function": "median"})),
        )
        .unwrap();
        assert!(matches!(
            query,
            TableQuery::Aggregate {
                function: AggregateFn::Count,
                column: None,
                ..
            }
        ));
    }

    #[test]
    fn test_aggregate_sum_needs_column() {
        let err = TableQuery::from_params(
            Action::Aggregate,
            "visits",
            &params(json!({"group_by": "month", "aggregate_function": "sum"})),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StepError::MissingParam {
                param: "aggregate_column",
                ..
            }
        ));
    }
}
