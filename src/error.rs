use std::path::PathBuf;

use thiserror::Error;

/// Terminal failures of a report run. Everything else is recovered locally
/// and surfaces in the run's `errors` list instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(#[source] sqlx::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read bundle config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse bundle config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid bundle {name:?}: {reason}")]
    InvalidBundle { name: String, reason: String },
}

/// Failure of a single execution step.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("{action} requires parameter {param:?}")]
    MissingParam {
        action: &'static str,
        param: &'static str,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_bundle_error() {
        let error = ConfigError::InvalidBundle {
            name: "지도".to_string(),
            reason: "bundle needs either api or members".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "invalid bundle \"지도\": bundle needs either api or members"
        );
    }

    #[test]
    fn test_invalid_query_error() {
        let error = ConfigError::InvalidQuery("query table is empty".to_string());
        assert_eq!(error.to_string(), "invalid query: query table is empty");
    }

    #[test]
    fn test_database_unavailable_error() {
        let error = EngineError::DatabaseUnavailable(sqlx::Error::PoolTimedOut);
        assert!(error.to_string().starts_with("Database unavailable: "));
    }

    #[test]
    fn test_config_error_wraps_parse_failure() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: EngineError = ConfigError::Parse(parse).into();
        assert!(
            error
                .to_string()
                .starts_with("Configuration error: failed to parse bundle config")
        );
    }

    #[test]
    fn test_missing_param_error() {
        let error = StepError::MissingParam {
            action: "search",
            param: "search_column",
        };
        assert_eq!(
            error.to_string(),
            "search requires parameter \"search_column\""
        );
    }

    #[test]
    fn test_invalid_identifier_error() {
        let error = StepError::InvalidIdentifier("users; drop".to_string());
        assert_eq!(error.to_string(), "invalid identifier: \"users; drop\"");
    }

    #[test]
    fn test_engine_result_err() {
        fn returns_err() -> EngineResult<i32> {
            Err(EngineError::DatabaseUnavailable(sqlx::Error::PoolClosed))
        }
        assert!(returns_err().is_err());
    }
}
