use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::template::{ParamValue, ReferenceScope};
use crate::engine::result::is_reserved_key;
use crate::error::ConfigError;

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidQuery(reason.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Search,
    Filter,
    RangeFilter,
    Aggregate,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Search => "search",
            Action::Filter => "filter",
            Action::RangeFilter => "range_filter",
            Action::Aggregate => "aggregate",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "search" => Some(Action::Search),
            "filter" => Some(Action::Filter),
            "range_filter" => Some(Action::RangeFilter),
            "aggregate" => Some(Action::Aggregate),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One query step with its parameters parsed into templates.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub action: Action,
    pub table: String,
    pub params: IndexMap<String, ParamValue>,
    pub save_as: String,
}

#[derive(Deserialize)]
struct ObjectForm {
    action: String,
    table: String,
    #[serde(default)]
    params: serde_json::Map<String, Value>,
    save_as: String,
}

impl QuerySpec {
    /// Accepts the array wire forms
    /// `["search", table, column, value, save_as]`,
    /// `["filter", table, {filters}, limit, save_as]`,
    /// `["aggregate", table, {params}, save_as]`
    /// and the object form `{action, table, params, save_as}`.
    pub fn from_wire(value: &Value) -> Result<Self, ConfigError> {
        let spec = match value {
            Value::Array(items) => Self::from_array(items)?,
            Value::Object(_) => Self::from_object(value)?,
            other => return Err(invalid(format!("query must be an array or object, got {other}"))),
        };
        if spec.table.is_empty() {
            return Err(invalid("query table is empty"));
        }
        if spec.save_as.is_empty() {
            return Err(invalid("query save_as is empty"));
        }
        if is_reserved_key(&spec.save_as) {
            return Err(invalid(format!("save_as {:?} is reserved", spec.save_as)));
        }
        Ok(spec)
    }

    fn from_array(items: &[Value]) -> Result<Self, ConfigError> {
        let text = |idx: usize, what: &str| -> Result<String, ConfigError> {
            items
                .get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("{what} at position {idx} must be a string")))
        };

        let action_name = text(0, "action")?;
        let action = Action::parse(&action_name)
            .ok_or_else(|| invalid(format!("unknown action {action_name:?}")))?;
        let table = text(1, "table")?;

        let mut params = IndexMap::new();
        let save_as = match action {
            Action::Search => {
                expect_len(items, 5, action)?;
                params.insert("search_column".to_string(), ParamValue::from_json(&items[2]));
                params.insert("search_value".to_string(), ParamValue::from_json(&items[3]));
                text(4, "save_as")?
            }
            Action::Filter => {
                expect_len(items, 5, action)?;
                params.insert("filters".to_string(), ParamValue::from_json(&items[2]));
                let limit = if items[3].is_i64() || items[3].is_u64() {
                    items[3].clone()
                } else {
                    Value::from(50)
                };
                params.insert("limit".to_string(), ParamValue::from_json(&limit));
                text(4, "save_as")?
            }
            Action::Aggregate => {
                expect_len(items, 4, action)?;
                match &items[2] {
                    Value::Object(map) => {
                        for (k, v) in map {
                            params.insert(k.clone(), ParamValue::from_json(v));
                        }
                    }
                    _ => return Err(invalid("aggregate params must be an object")),
                }
                text(3, "save_as")?
            }
            Action::RangeFilter => {
                return Err(invalid("range_filter is only accepted in object form"));
            }
        };

        Ok(Self {
            action,
            table,
            params,
            save_as,
        })
    }

    fn from_object(value: &Value) -> Result<Self, ConfigError> {
        let form = ObjectForm::deserialize(value).map_err(|e| invalid(e.to_string()))?;
        let action = Action::parse(&form.action)
            .ok_or_else(|| invalid(format!("unknown action {:?}", form.action)))?;
        Ok(Self {
            action,
            table: form.table,
            params: form
                .params
                .iter()
                .map(|(k, v)| (k.clone(), ParamValue::from_json(v)))
                .collect(),
            save_as: form.save_as,
        })
    }

    pub fn bind_seeds(&self, seeds: &IndexMap<String, Value>) -> Self {
        Self {
            params: self
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.bind_seeds(seeds)))
                .collect(),
            ..self.clone()
        }
    }

    pub fn resolve_params(&self, scope: &dyn ReferenceScope) -> serde_json::Map<String, Value> {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.substitute(scope)))
            .collect()
    }
}

fn expect_len(items: &[Value], len: usize, action: Action) -> Result<(), ConfigError> {
    if items.len() == len {
        Ok(())
    } else {
        Err(invalid(format!(
            "{action} query needs {len} elements, got {}",
            items.len()
        )))
    }
}
