pub mod demographics;
pub mod review;

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use demographics::{DemographicsSchema, DemographicsStats};
pub use review::ReviewStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatKind {
    #[serde(rename = "review_stats")]
    Review,
    #[serde(rename = "demographics_stats")]
    Demographics,
}

impl StatKind {
    /// Accepts both the short and the `_stats` spelling.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "review" | "review_stats" => Some(StatKind::Review),
            "demographics" | "demographics_stats" => Some(StatKind::Demographics),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatKind::Review => "review_stats",
            StatKind::Demographics => "demographics_stats",
        }
    }

    /// Result key the stat reads its rows from.
    pub fn source_key(self) -> &'static str {
        match self {
            StatKind::Review => "reviews",
            StatKind::Demographics => "demographics",
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Stats {
    Review(ReviewStats),
    Demographics(DemographicsStats),
}

impl Stats {
    pub fn summary(&self) -> &str {
        match self {
            Stats::Review(s) => &s.summary,
            Stats::Demographics(s) => &s.summary,
        }
    }
}

/// Computes each requested stat whose source rows exist in `results`.
/// Malformed rows degrade the stat, they never fail it.
pub fn compute_stats(
    results: &IndexMap<String, Value>,
    kinds: &[StatKind],
) -> IndexMap<StatKind, Stats> {
    let mut stats = IndexMap::new();
    for &kind in kinds {
        let Some(source) = results.get(kind.source_key()) else {
            tracing::debug!(stat = %kind, source = kind.source_key(), "Stat source missing, skipping");
            continue;
        };
        let rows = rows_of(source);
        let computed = match kind {
            StatKind::Review => Stats::Review(review::review_stats(rows)),
            StatKind::Demographics => Stats::Demographics(demographics::demographics_stats(rows)),
        };
        tracing::info!(stat = %kind, summary = %computed.summary(), "Stat computed");
        stats.insert(kind, computed);
    }
    stats
}

fn rows_of(value: &Value) -> &[Value] {
    match value {
        Value::Array(rows) => rows,
        _ => &[],
    }
}

/// Numeric value of a JSON number or numeric string.
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Decimal text that always carries a fractional digit: `50.0`, `33.3`.
pub(crate) fn decimal_text(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}
