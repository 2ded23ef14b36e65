use std::sync::Arc;

use anyhow::Context;

use facility_report::bundles::registry::BundleRegistry;
use facility_report::config::Config;
use facility_report::db::{self, PgSessionSource};
use facility_report::engine::{ApiRegistry, RetryPolicy};
use facility_report::layout::LayoutComposer;
use facility_report::llm::{self, LlmClient, LlmCompanionWriter, LlmLayoutPlanner};
use facility_report::pipeline::{ReportPipeline, ReportRequest};
use facility_report::telemetry::init_telemetry;

/// Prints the preset and bundle catalog instead of generating a report.
const LIST_FLAG: &str = "--list";

fn provider(name: &str, config: &Config) -> Option<Arc<dyn llm::Provider>> {
    let provider = llm::openai::OpenAIProvider::from_config(name, config)?;
    Some(Arc::new(provider))
}

fn composer(config: &Config) -> LayoutComposer {
    if !config.llm_enabled() {
        tracing::info!("No LLM provider configured, using rule-based layout");
        return LayoutComposer::rule_based();
    }
    let Some(primary) = provider(&config.llm_provider, config) else {
        tracing::warn!(provider = %config.llm_provider, "Unknown LLM provider, using rule-based layout");
        return LayoutComposer::rule_based();
    };

    tracing::info!(
        primary_provider = %config.llm_provider,
        fallback_provider = %config.fallback_provider,
        "LLM client initialized"
    );

    let client = Arc::new(LlmClient {
        primary,
        fallback: provider(&config.fallback_provider, config),
        primary_provider: config.llm_provider.clone(),
        fallback_provider: config.fallback_provider.clone(),
        fallback_model: config.fallback_model.clone(),
        retry: RetryPolicy::default(),
    });

    LayoutComposer::new(
        Arc::new(LlmCompanionWriter::new(client.clone(), &config.llm_model)),
        Some(Arc::new(LlmLayoutPlanner::new(client, &config.llm_model))),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let organization = std::env::args()
        .nth(1)
        .context("usage: facility-report <organization> | --list")?;

    let config = Config::from_env();

    let telemetry_guard = init_telemetry(&config)?;

    tracing::info!(
        environment = %config.environment,
        bundle_config = %config.bundle_config_path,
        "Starting facility-report"
    );

    let registry = Arc::new(BundleRegistry::from_path(&config.bundle_config_path));
    let catalog = registry.load()?;

    if organization == LIST_FLAG {
        let listing = serde_json::json!({
            "presets": catalog.available_presets(),
            "bundles": catalog.available_bundles(),
        });
        let outcome = serde_json::to_string_pretty(&listing)
            .map(|json| println!("{json}"))
            .map_err(Into::into);
        telemetry_guard.shutdown();
        return outcome;
    }

    let pool = db::create_pool(&config.database_url, config.db_max_connections)?;

    let apis = ApiRegistry::from_catalog(
        &catalog,
        config.api_connect_timeout(),
        config.api_read_timeout(),
        RetryPolicy::with_max_attempts(config.api_max_attempts),
    )?;

    let pipeline = ReportPipeline::new(
        registry,
        Arc::new(PgSessionSource::new(pool)),
        apis,
        composer(&config),
    );

    let result = pipeline
        .run(&ReportRequest::for_organization(organization))
        .await;

    let outcome = match result {
        Ok(report) => serde_json::to_string_pretty(&report)
            .map(|json| println!("{json}"))
            .map_err(Into::into),
        Err(err) => {
            tracing::error!(error = %err, "Report generation failed");
            Err(err.into())
        }
    };

    telemetry_guard.shutdown();
    outcome
}
