use indexmap::IndexMap;
use serde_json::Value;

use crate::bundles::template::ReferenceScope;

/// Mutable state of one run: seed variables, step results keyed by
/// `save_as`, and the run-level error list. Never cleared between plans, so
/// further steps may be executed against the same context.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    seeds: IndexMap<String, Value>,
    results: IndexMap<String, Value>,
    errors: Vec<String>,
}

impl ExecutionContext {
    pub fn new(seeds: IndexMap<String, Value>) -> Self {
        Self {
            seeds,
            ..Self::default()
        }
    }

    pub fn seeds(&self) -> &IndexMap<String, Value> {
        &self.seeds
    }

    pub fn set_seed(&mut self, name: impl Into<String>, value: Value) {
        self.seeds.insert(name.into(), value);
    }

    pub fn has_seed(&self, name: &str) -> bool {
        self.seeds.get(name).is_some_and(|v| !v.is_null())
    }

    pub fn results(&self) -> &IndexMap<String, Value> {
        &self.results
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }

    pub fn store(&mut self, key: impl Into<String>, value: Value) {
        self.results.insert(key.into(), value);
    }

    /// Stores `placeholder` under `key` and records `error` for the run.
    pub fn record_failure(&mut self, key: impl Into<String>, placeholder: Value, error: String) {
        self.results.insert(key.into(), placeholder);
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

impl ReferenceScope for ExecutionContext {
    fn seed(&self, name: &str) -> Option<&Value> {
        self.seeds.get(name)
    }

    fn result(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }
}
