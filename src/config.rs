use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub bundle_config_path: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub fallback_provider: String,
    pub fallback_model: String,
    pub ollama_base_url: String,
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub api_connect_timeout_secs: u64,
    pub api_read_timeout_secs: u64,
    pub api_max_attempts: u32,
    pub otel_service_name: String,
    pub otel_exporter_endpoint: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            environment: env::var("APP_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .expect("DB_MAX_CONNECTIONS must be a number"),
            bundle_config_path: env::var("BUNDLE_CONFIG_PATH")
                .unwrap_or_else(|_| "config/bundles.json".to_string()),
            llm_provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "none".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4.1-mini".to_string()),
            fallback_provider: env::var("FALLBACK_PROVIDER")
                .unwrap_or_else(|_| "none".to_string()),
            fallback_model: env::var("FALLBACK_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            google_api_key: env::var("GOOGLE_API_KEY").ok(),
            api_connect_timeout_secs: env::var("API_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .expect("API_CONNECT_TIMEOUT_SECS must be a number"),
            api_read_timeout_secs: env::var("API_READ_TIMEOUT_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .expect("API_READ_TIMEOUT_SECS must be a number"),
            api_max_attempts: env::var("API_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .expect("API_MAX_ATTEMPTS must be a number"),
            otel_service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "facility-report".to_string()),
            otel_exporter_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn llm_enabled(&self) -> bool {
        self.llm_provider != "none"
    }

    pub fn api_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.api_connect_timeout_secs)
    }

    pub fn api_read_timeout(&self) -> Duration {
        Duration::from_secs(self.api_read_timeout_secs)
    }
}
