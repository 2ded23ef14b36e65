use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use super::context::ExecutionContext;
use crate::stats::{StatKind, Stats};

const SAMPLE_SIZE: usize = 3;

/// Top-level fields of [`ExecutionResult`]; no step may store under them.
const RESERVED_KEYS: [&str; 3] = ["success", "errors", "stats"];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSummary {
    pub count: usize,
    pub sample: Vec<Value>,
    pub keys: Vec<String>,
}

impl ResultSummary {
    /// Lists summarize their first rows; a single object counts as one
    /// record; anything else is empty.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Array(rows) if !rows.is_empty() => Self {
                count: rows.len(),
                sample: rows.iter().take(SAMPLE_SIZE).cloned().collect(),
                keys: keys_of(&rows[0]),
            },
            Value::Object(_) => Self {
                count: 1,
                sample: vec![value.clone()],
                keys: keys_of(value),
            },
            _ => Self {
                count: 0,
                sample: Vec::new(),
                keys: Vec::new(),
            },
        }
    }
}

fn keys_of(value: &Value) -> Vec<String> {
    value
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

/// Run summary handed to downstream consumers:
/// `{success, errors|null, stats|null, <save_as>: {count, sample, keys}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub errors: Option<Vec<String>>,
    pub stats: Option<IndexMap<StatKind, Stats>>,
    #[serde(flatten)]
    pub results: IndexMap<String, ResultSummary>,
}

impl ExecutionResult {
    pub fn from_context(ctx: &ExecutionContext, stats: IndexMap<StatKind, Stats>) -> Self {
        let errors = ctx.errors().to_vec();
        Self {
            success: errors.is_empty(),
            errors: (!errors.is_empty()).then_some(errors),
            stats: (!stats.is_empty()).then_some(stats),
            results: ctx
                .results()
                .iter()
                .map(|(k, v)| (k.clone(), ResultSummary::of(v)))
                .collect(),
        }
    }
}
