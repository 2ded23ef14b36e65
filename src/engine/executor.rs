use std::time::Instant;

use opentelemetry::KeyValue;
use serde_json::Value;

use super::context::ExecutionContext;
use super::table::TableQuery;
use crate::bundles::resolver::ResolvedQuery;
use crate::error::StepError;
use crate::telemetry::metrics::{STEP_DURATION, STEP_EXECUTIONS};

/// One database session. Rows come back as JSON objects.
#[async_trait::async_trait]
pub trait QueryBackend: Send {
    async fn run(&mut self, query: &TableQuery) -> Result<Vec<Value>, StepError>;
}

/// Opens the per-run session. Failing to open one is the only database
/// failure that ends a run.
#[async_trait::async_trait]
pub trait SessionSource: Send + Sync {
    async fn open(&self) -> Result<Box<dyn QueryBackend>, sqlx::Error>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    pub executed: usize,
    pub failed: usize,
}

/// Runs `queries` strictly in order. A failing step leaves an empty list
/// under its `save_as` and an entry in the run's errors; the next step runs
/// regardless.
#[tracing::instrument(
    name = "engine execute_plan",
    skip(backend, queries, ctx),
    fields(plan.steps = queries.len(), plan.failed)
)]
pub async fn execute_plan(
    backend: &mut dyn QueryBackend,
    queries: &[ResolvedQuery],
    ctx: &mut ExecutionContext,
) -> PlanOutcome {
    let mut outcome = PlanOutcome::default();
    for query in queries {
        outcome.executed += 1;
        if execute_step(backend, query, ctx).await.is_err() {
            outcome.failed += 1;
        }
    }
    tracing::Span::current().record("plan.failed", outcome.failed);
    outcome
}

#[tracing::instrument(
    name = "engine step",
    skip(backend, query, ctx),
    fields(
        step.action = %query.spec.action,
        step.table = %query.spec.table,
        step.save_as = %query.spec.save_as,
        step.rows,
    )
)]
pub async fn execute_step(
    backend: &mut dyn QueryBackend,
    query: &ResolvedQuery,
    ctx: &mut ExecutionContext,
) -> Result<usize, StepError> {
    let spec = &query.spec;
    let start = Instant::now();

    let params = spec.resolve_params(&*ctx);
    let result = match TableQuery::from_params(spec.action, &spec.table, &params) {
        Ok(table_query) => backend.run(&table_query).await,
        Err(err) => Err(err),
    };

    let status = if result.is_ok() { "ok" } else { "error" };
    let attrs = [
        KeyValue::new("step.action", spec.action.as_str()),
        KeyValue::new("step.status", status),
    ];
    STEP_EXECUTIONS.add(1, &attrs);
    STEP_DURATION.record(start.elapsed().as_secs_f64() * 1000.0, &attrs);

    match result {
        Ok(rows) => {
            let count = rows.len();
            tracing::Span::current().record("step.rows", count);
            tracing::debug!(save_as = %spec.save_as, rows = count, "Step completed");
            ctx.store(spec.save_as.clone(), Value::Array(rows));
            Ok(count)
        }
        Err(err) => {
            tracing::warn!(
                save_as = %spec.save_as,
                action = %spec.action,
                table = %spec.table,
                error = %err,
                "Step failed, continuing"
            );
            ctx.record_failure(
                spec.save_as.clone(),
                Value::Array(Vec::new()),
                format!("{}: {err}", spec.save_as),
            );
            Err(err)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bundles::query::QuerySpec;
    use serde_json::json;
    use std::collections::HashMap;

    /// In-memory backend keyed by table name. Tables listed in `failing`
    /// error out; every executed query is recorded.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub tables: HashMap<String, Vec<Value>>,
        pub failing: Vec<String>,
        pub seen: Vec<TableQuery>,
    }

    impl FakeBackend {
        pub fn with_table(mut self, name: &str, rows: Value) -> Self {
            let rows = rows.as_array().cloned().unwrap_or_default();
            self.tables.insert(name.to_string(), rows);
            self
        }

        pub fn failing(mut self, name: &str) -> Self {
            self.failing.push(name.to_string());
            self
        }
    }

    #[async_trait::async_trait]
    impl QueryBackend for FakeBackend {
        async fn run(&mut self, query: &TableQuery) -> Result<Vec<Value>, StepError> {
            self.seen.push(query.clone());
            let table = query.table();
            if self.failing.iter().any(|t| t == table) {
                return Err(StepError::Database(sqlx::Error::Protocol(format!(
                    "relation {table} does not exist"
                ))));
            }
            let rows = self.tables.get(table).cloned().unwrap_or_default();
            Ok(match query {
                TableQuery::Filter { filters, .. } => rows
                    .into_iter()
                    .filter(|row| {
                        filters.iter().all(|(col, op)| {
                            row.get(col)
                                .map(crate::bundles::template::scalar_text)
                                .is_some_and(|v| v == op.as_text())
                        })
                    })
                    .collect(),
                _ => rows,
            })
        }
    }

    fn step(value: Value) -> ResolvedQuery {
        ResolvedQuery {
            bundle: Some("test".to_string()),
            spec: QuerySpec::from_wire(&value).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_later_step_resolves_earlier_result() {
        let mut backend = FakeBackend::default()
            .with_table("facility", json!([{"slta_cd": "SLTA062", "slta_nm": "서울숲"}]))
            .with_table(
                "reviews",
                json!([
                    {"slta_cd": "SLTA062", "sns_content_rating": 5},
                    {"slta_cd": "OTHER", "sns_content_rating": 1}
                ]),
            );
        let plan = vec![
            step(json!(["search", "facility", "slta_nm", "서울숲", "facility"])),
            step(json!(["filter", "reviews", {"slta_cd": "$ref.facility.slta_cd"}, 10, "reviews"])),
        ];
        let mut ctx = ExecutionContext::default();
        let outcome = execute_plan(&mut backend, &plan, &mut ctx).await;

        assert_eq!(outcome, PlanOutcome { executed: 2, failed: 0 });
        assert_eq!(ctx.get("reviews").unwrap().as_array().unwrap().len(), 1);
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_step() {
        let mut backend = FakeBackend::default()
            .with_table("a", json!([{"x": 1}]))
            .with_table("c", json!([{"z": 3}]))
            .failing("b");
        let plan = vec![
            step(json!(["search", "a", "x", "1", "first"])),
            step(json!(["search", "b", "y", "2", "second"])),
            step(json!(["search", "c", "z", "3", "third"])),
        ];
        let mut ctx = ExecutionContext::default();
        let outcome = execute_plan(&mut backend, &plan, &mut ctx).await;

        assert_eq!(outcome.failed, 1);
        assert_eq!(ctx.errors().len(), 1);
        assert!(ctx.errors()[0].starts_with("second: "));
        assert_eq!(ctx.get("second"), Some(&json!([])));
        assert_eq!(ctx.get("first"), Some(&json!([{"x": 1}])));
        assert_eq!(ctx.get("third"), Some(&json!([{"z": 3}])));
        assert_eq!(backend.seen.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_params_fail_the_step_without_backend_call() {
        let mut backend = FakeBackend::default();
        let plan = vec![step(json!({
            "action": "range_filter",
            "table": "air",
            "params": {"min_value": 1},
            "save_as": "air"
        }))];
        let mut ctx = ExecutionContext::default();
        execute_plan(&mut backend, &plan, &mut ctx).await;

        assert!(backend.seen.is_empty());
        assert_eq!(ctx.errors().len(), 1);
        assert_eq!(ctx.get("air"), Some(&json!([])));
    }

    #[tokio::test]
    async fn test_context_survives_between_plans() {
        let mut backend = FakeBackend::default()
            .with_table("facility", json!([{"slta_cd": "SLTA062"}]))
            .with_table("visits", json!([{"slta_cd": "SLTA062", "n": 3}]));
        let mut ctx = ExecutionContext::default();
        execute_plan(
            &mut backend,
            &[step(json!(["search", "facility", "slta_nm", "x", "facility"]))],
            &mut ctx,
        )
        .await;
        execute_plan(
            &mut backend,
            &[step(json!(["filter", "visits", {"slta_cd": "{facility.slta_cd}"}, 5, "visits"]))],
            &mut ctx,
        )
        .await;

        assert!(ctx.get("facility").is_some());
        assert_eq!(ctx.get("visits").unwrap().as_array().unwrap().len(), 1);
    }
}
