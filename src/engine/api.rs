use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use opentelemetry::KeyValue;
use serde_json::{Map, Value, json};

use super::context::ExecutionContext;
use super::retry::RetryPolicy;
use crate::bundles::document::{ApiBundle, ApiBundleKind, ApiEndpoint, BundleCatalog, HttpMethod};
use crate::bundles::template::{ParamValue, scalar_text};
use crate::telemetry::metrics::API_CALLS;

pub const MAPS_JAVASCRIPT: &str = "maps_javascript";
pub const GEOCODING: &str = "geocoding";

#[async_trait::async_trait]
pub trait ApiBackend: Send + Sync {
    async fn call(&self, params: &Map<String, Value>) -> anyhow::Result<Value>;
}

/// Map data for a client-side map; no network call.
pub struct MapsJavascript;

#[async_trait::async_trait]
impl ApiBackend for MapsJavascript {
    async fn call(&self, params: &Map<String, Value>) -> anyhow::Result<Value> {
        Ok(json!({
            "success": true,
            "type": "map",
            "center": {
                "lat": params.get("center_lat").cloned().unwrap_or(Value::Null),
                "lng": params.get("center_lng").cloned().unwrap_or(Value::Null),
            },
            "zoom": params.get("zoom").cloned().unwrap_or_else(|| json!(15)),
            "markers": params.get("markers").cloned().unwrap_or_else(|| json!([])),
        }))
    }
}

/// JSON-over-HTTP endpoint from the `apis` section of the bundle document.
pub struct RestApi {
    name: String,
    endpoint: ApiEndpoint,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl RestApi {
    pub fn new(
        name: impl Into<String>,
        endpoint: ApiEndpoint,
        client: reqwest::Client,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            client,
            retry,
        }
    }

    fn merged_params(&self, params: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = self.endpoint.default_params.clone();
        for (k, v) in params {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    async fn send(&self, params: &Map<String, Value>) -> anyhow::Result<Value> {
        let request = match self.endpoint.method {
            HttpMethod::Get => {
                let query: Vec<(&str, String)> = params
                    .iter()
                    .map(|(k, v)| (k.as_str(), scalar_text(v)))
                    .collect();
                self.client.get(&self.endpoint.url).query(&query)
            }
            HttpMethod::Post => self.client.post(&self.endpoint.url).json(params),
        };
        let response = request.send().await?.error_for_status()?;
        Ok(response.json::<Value>().await?)
    }
}

/// Server errors and transport failures; a 4xx answer or an unreadable
/// body will not change on retry.
fn is_transient(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<reqwest::Error>() {
        Some(err) => match err.status() {
            Some(status) => status.is_server_error(),
            None => err.is_timeout() || err.is_connect() || err.is_request(),
        },
        None => false,
    }
}

#[async_trait::async_trait]
impl ApiBackend for RestApi {
    async fn call(&self, params: &Map<String, Value>) -> anyhow::Result<Value> {
        let params = self.merged_params(params);
        self.retry
            .run_while(&self.name, || self.send(&params), is_transient)
            .await
    }
}

/// Static name-to-backend table. `call` never fails: unknown names and
/// backend errors come back as `{success: false, error}`.
#[derive(Clone)]
pub struct ApiRegistry {
    backends: IndexMap<String, Arc<dyn ApiBackend>>,
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiRegistry {
    /// Registry holding only the built-in backends.
    pub fn new() -> Self {
        let mut backends: IndexMap<String, Arc<dyn ApiBackend>> = IndexMap::new();
        backends.insert(MAPS_JAVASCRIPT.to_string(), Arc::new(MapsJavascript));
        Self { backends }
    }

    /// Built-ins plus one [`RestApi`] per endpoint of the catalog.
    pub fn from_catalog(
        catalog: &BundleCatalog,
        connect_timeout: Duration,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        let mut registry = Self::new();
        for (name, endpoint) in &catalog.apis {
            registry.register(
                name.clone(),
                Arc::new(RestApi::new(
                    name.clone(),
                    endpoint.clone(),
                    client.clone(),
                    retry,
                )),
            );
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn ApiBackend>) {
        self.backends.insert(name.into(), backend);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    #[tracing::instrument(name = "api call", skip(self, params), fields(api.status))]
    pub async fn call(&self, api: &str, params: &Map<String, Value>) -> Value {
        let start = Instant::now();
        let Some(backend) = self.backends.get(api) else {
            tracing::warn!(api = %api, "Unknown API");
            API_CALLS.add(
                1,
                &[
                    KeyValue::new("api", api.to_string()),
                    KeyValue::new("status", "unknown"),
                ],
            );
            return failure(format!("Unknown API: {api}"));
        };

        let (status, value) = match backend.call(params).await {
            Ok(Value::Object(mut map)) => {
                let ok = map.get("success").and_then(Value::as_bool).unwrap_or(true);
                map.entry("success").or_insert(Value::Bool(true));
                (if ok { "ok" } else { "error" }, Value::Object(map))
            }
            Ok(other) => ("ok", json!({"success": true, "data": other})),
            Err(err) => {
                tracing::warn!(api = %api, error = %err, "API call failed");
                ("error", failure(err.to_string()))
            }
        };

        tracing::Span::current().record("api.status", status);
        API_CALLS.add(
            1,
            &[
                KeyValue::new("api", api.to_string()),
                KeyValue::new("status", status),
            ],
        );
        tracing::debug!(api = %api, elapsed_ms = start.elapsed().as_millis() as u64, "API call finished");
        value
    }
}

fn failure(error: String) -> Value {
    json!({"success": false, "error": error})
}

pub fn is_success(value: &Value) -> bool {
    value.get("success").and_then(Value::as_bool).unwrap_or(false)
}

/// One executed API bundle, in execution order.
#[derive(Debug, Clone)]
pub struct ApiRun {
    pub bundle: String,
    pub save_as: String,
}

/// Runs API bundles in order. Each result is stored under the bundle's
/// `save_as`; failed calls keep their `{success: false, error}` object and
/// add an entry to the run's errors.
#[tracing::instrument(
    name = "engine execute_api_bundles",
    skip(registry, catalog, names, ctx),
    fields(api.bundles = names.len(), api.failed)
)]
pub async fn execute_api_bundles(
    registry: &ApiRegistry,
    catalog: &BundleCatalog,
    names: &[String],
    ctx: &mut ExecutionContext,
) -> Vec<ApiRun> {
    let mut runs = Vec::new();
    let mut failed = 0;
    for name in names {
        let Some(bundle) = catalog.api_bundles.get(name) else {
            tracing::warn!(bundle = %name, "Unknown API bundle, skipping");
            continue;
        };
        let result = run_bundle(registry, catalog, bundle, ctx).await;
        let save_as = bundle.save_as().to_string();
        if is_success(&result) {
            ctx.store(save_as.clone(), result);
        } else {
            failed += 1;
            let error = result
                .get("error")
                .map(scalar_text)
                .unwrap_or_else(|| "unknown error".to_string());
            ctx.record_failure(save_as.clone(), result, format!("{name}: {error}"));
        }
        runs.push(ApiRun {
            bundle: name.clone(),
            save_as,
        });
    }
    tracing::Span::current().record("api.failed", failed);
    runs
}

async fn run_bundle(
    registry: &ApiRegistry,
    catalog: &BundleCatalog,
    bundle: &ApiBundle,
    ctx: &ExecutionContext,
) -> Value {
    match &bundle.kind {
        ApiBundleKind::Single { api, params, .. } => run_single(registry, api, params, ctx).await,
        ApiBundleKind::Composite {
            members,
            db_bundle,
            merge_strategy,
        } => {
            let mut api_results = Vec::with_capacity(members.len());
            for member in members {
                let data = match catalog.api_bundles.get(member).map(|b| &b.kind) {
                    Some(ApiBundleKind::Single { api, params, .. }) => {
                        run_single(registry, api, params, ctx).await
                    }
                    Some(ApiBundleKind::Composite { .. }) => {
                        failure(format!("Nested composite bundle: {member}"))
                    }
                    None => failure(format!("Bundle not found: {member}")),
                };
                api_results.push(json!({"bundle": member, "data": data}));
            }
            json!({
                "success": true,
                "api_results": api_results,
                "db_bundle": db_bundle,
                "merge_strategy": merge_strategy,
            })
        }
    }
}

async fn run_single(
    registry: &ApiRegistry,
    api: &str,
    params: &IndexMap<String, ParamValue>,
    ctx: &ExecutionContext,
) -> Value {
    let resolved: Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), v.substitute(ctx)))
        .collect();
    registry.call(api, &resolved).await
}
