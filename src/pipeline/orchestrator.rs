use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use opentelemetry::trace::TraceContextExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use super::coordinates;
use crate::blocks::{ContentBlock, LayoutNode, derive_blocks};
use crate::bundles::document::BundleCatalog;
use crate::bundles::registry::BundleRegistry;
use crate::bundles::resolver::{ResolvedPlan, ResolvedQuery, resolve};
use crate::engine::executor::PlanOutcome;
use crate::engine::{
    ApiRegistry, ApiRun, ExecutionContext, ExecutionResult, SessionSource, execute_api_bundles,
    execute_plan,
};
use crate::error::{EngineError, EngineResult};
use crate::layout::LayoutComposer;
use crate::stats::compute_stats;
use crate::telemetry::metrics::{REPORT_BLOCKS, REPORT_GENERATION_DURATION};

pub const GENERATION_FAILED: &str =
    "## Report generation failed\n\nNo usable data could be collected for this organization.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportRequest {
    pub organization: String,
    /// Overrides the keyword-selected preset.
    pub preset: Option<String>,
    /// Overrides the preset's bundle list.
    pub bundles: Option<Vec<String>>,
    pub api_preset: Option<String>,
    pub api_bundles: Option<Vec<String>>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub address: Option<String>,
    #[serde(default)]
    pub planner_queries: Vec<Value>,
    #[serde(default)]
    pub planner_stats: Vec<String>,
}

impl ReportRequest {
    pub fn for_organization(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            ..Self::default()
        }
    }

    fn seeds(&self) -> IndexMap<String, Value> {
        let mut seeds = IndexMap::new();
        seeds.insert("org".to_string(), json!(self.organization));
        if let Some(lat) = self.lat {
            seeds.insert("lat".to_string(), json!(lat));
        }
        if let Some(lng) = self.lng {
            seeds.insert("lng".to_string(), json!(lng));
        }
        if let Some(address) = &self.address {
            seeds.insert("address".to_string(), json!(address));
        }
        seeds
    }
}

/// Everything gathered for one run before blocks are derived.
pub struct Collection {
    pub run_id: Uuid,
    pub organization: String,
    pub preset: String,
    pub api_preset: Option<String>,
    pub catalog: Arc<BundleCatalog>,
    pub plan: ResolvedPlan,
    pub context: ExecutionContext,
    pub api_runs: Vec<ApiRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportBlocks {
    pub run_id: Uuid,
    pub organization: String,
    pub preset: String,
    pub api_preset: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub trace_id: String,
    pub execution: ExecutionResult,
    pub blocks: Vec<LayoutNode>,
    pub layout_fallback: bool,
}

pub struct ReportPipeline {
    registry: Arc<BundleRegistry>,
    sessions: Arc<dyn SessionSource>,
    apis: ApiRegistry,
    composer: LayoutComposer,
}

impl ReportPipeline {
    pub fn new(
        registry: Arc<BundleRegistry>,
        sessions: Arc<dyn SessionSource>,
        apis: ApiRegistry,
        composer: LayoutComposer,
    ) -> Self {
        Self {
            registry,
            sessions,
            apis,
            composer,
        }
    }

    #[tracing::instrument(
        name = "pipeline report",
        skip(self, request),
        fields(
            report.org = %request.organization,
            report.id,
            report.blocks,
            report.duration_ms,
        )
    )]
    pub async fn run(&self, request: &ReportRequest) -> EngineResult<ReportBlocks> {
        let start = Instant::now();

        let collection = self.collect(request).await?;
        let report = self.render(collection).await;

        let duration = start.elapsed();
        REPORT_GENERATION_DURATION.record(duration.as_secs_f64(), &[]);

        let span = tracing::Span::current();
        span.record("report.id", report.run_id.to_string());
        span.record("report.blocks", report.blocks.len());
        span.record("report.duration_ms", duration.as_millis() as u64);

        Ok(report)
    }

    /// Resolves the request's bundles, runs the database steps on one
    /// session, fills in coordinates and runs the API bundles.
    #[tracing::instrument(
        name = "pipeline collect",
        skip(self, request),
        fields(collect.preset, collect.queries, collect.api_bundles, collect.errors)
    )]
    pub async fn collect(&self, request: &ReportRequest) -> EngineResult<Collection> {
        let catalog = self.registry.load()?;
        let seeds = request.seeds();

        let preset = request
            .preset
            .clone()
            .unwrap_or_else(|| catalog.presets.preset_for(&request.organization).to_string());
        let bundle_names = match &request.bundles {
            Some(names) => names.clone(),
            None => catalog.presets.bundles_for(&preset),
        };

        let mut plan = resolve(&catalog, &bundle_names, &seeds);
        let merged = plan.merge_planner_queries(&request.planner_queries, &request.planner_stats, &seeds);
        if merged > 0 {
            tracing::info!(merged, "Planner queries merged into plan");
        }

        let mut context = ExecutionContext::new(seeds);
        self.run_queries(&plan.queries, &mut context).await?;

        let located = coordinates::discover_from_results(&mut context)
            || coordinates::geocode(&self.apis, &mut context).await;

        let (api_preset, api_runs) = match (&request.api_bundles, located) {
            (Some(names), true) => (
                request.api_preset.clone(),
                execute_api_bundles(&self.apis, &catalog, names, &mut context).await,
            ),
            (None, true) => {
                let api_preset = request.api_preset.clone().unwrap_or_else(|| {
                    catalog
                        .api_presets
                        .preset_for(&request.organization)
                        .to_string()
                });
                let names = catalog.api_presets.bundles_for(&api_preset);
                let runs = execute_api_bundles(&self.apis, &catalog, &names, &mut context).await;
                (Some(api_preset), runs)
            }
            (_, false) => {
                tracing::warn!(org = %request.organization, "No coordinates known, skipping API bundles");
                (None, Vec::new())
            }
        };

        let span = tracing::Span::current();
        span.record("collect.preset", preset.as_str());
        span.record("collect.queries", plan.queries.len());
        span.record("collect.api_bundles", api_runs.len());
        span.record("collect.errors", context.errors().len());

        Ok(Collection {
            run_id: Uuid::new_v4(),
            organization: request.organization.clone(),
            preset,
            api_preset,
            catalog,
            plan,
            context,
            api_runs,
        })
    }

    /// Runs further planner-proposed steps against an existing collection.
    /// Earlier results stay visible to the new steps.
    #[tracing::instrument(name = "pipeline follow_up", skip_all, fields(follow_up.added))]
    pub async fn follow_up(
        &self,
        collection: &mut Collection,
        queries: &[Value],
    ) -> EngineResult<PlanOutcome> {
        let before = collection.plan.queries.len();
        let seeds = collection.context.seeds().clone();
        let added = collection.plan.merge_planner_queries(queries, &[], &seeds);
        tracing::Span::current().record("follow_up.added", added);

        let new_steps = collection.plan.queries[before..].to_vec();
        self.run_queries(&new_steps, &mut collection.context).await
    }

    /// One session per call, released when this returns on every path.
    async fn run_queries(
        &self,
        queries: &[ResolvedQuery],
        ctx: &mut ExecutionContext,
    ) -> EngineResult<PlanOutcome> {
        if queries.is_empty() {
            return Ok(PlanOutcome::default());
        }
        let mut session = self.sessions.open().await.map_err(|err| {
            tracing::error!(error = %err, "Could not open database session");
            EngineError::DatabaseUnavailable(err)
        })?;
        Ok(execute_plan(session.as_mut(), queries, ctx).await)
    }

    /// Normalizes stats, derives blocks and composes the layout.
    #[tracing::instrument(name = "pipeline render", skip_all, fields(render.blocks))]
    pub async fn render(&self, collection: Collection) -> ReportBlocks {
        let Collection {
            run_id,
            organization,
            preset,
            api_preset,
            catalog,
            plan,
            context,
            api_runs,
        } = collection;

        let stats = compute_stats(context.results(), &plan.stats);
        let blocks = derive_blocks(&plan, &stats, &catalog, &api_runs, &context);
        let execution = ExecutionResult::from_context(&context, stats);

        let (nodes, layout_fallback) = if blocks.is_empty() {
            tracing::warn!(org = %organization, "No usable blocks, emitting placeholder");
            (
                vec![LayoutNode::Block(ContentBlock::markdown(GENERATION_FAILED))],
                true,
            )
        } else {
            let composition = self.composer.compose(blocks).await;
            (composition.nodes, composition.fallback)
        };

        let leaves: usize = nodes.iter().map(LayoutNode::leaf_count).sum();
        REPORT_BLOCKS.record(leaves as f64, &[]);

        let span = tracing::Span::current();
        span.record("render.blocks", leaves);
        let otel_context = span.context();
        let trace_id = otel_context.span().span_context().trace_id().to_string();

        ReportBlocks {
            run_id,
            organization,
            preset,
            api_preset,
            generated_at: Utc::now(),
            trace_id,
            execution,
            blocks: nodes,
            layout_fallback,
        }
    }
}
