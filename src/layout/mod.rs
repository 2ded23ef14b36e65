pub mod rules;
pub mod sequence;

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use crate::blocks::{ContentBlock, LayoutNode};
use crate::telemetry::metrics::LAYOUT_FALLBACK_COUNT;

pub use rules::fallback_sequence;
pub use sequence::{RowSpec, SequenceItem, materialize};

/// Explanatory text proposed for one data block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Companion {
    pub paired_with: String,
    pub content: String,
}

/// Writes companion markdown for id-bearing blocks.
#[async_trait::async_trait]
pub trait CompanionWriter: Send + Sync {
    async fn write(&self, targets: &[&ContentBlock]) -> anyhow::Result<Vec<Companion>>;
}

/// Decides the layout sequence over the flat, paired block list.
#[async_trait::async_trait]
pub trait LayoutPlanner: Send + Sync {
    async fn plan(&self, blocks: &[ContentBlock]) -> anyhow::Result<Vec<SequenceItem>>;
}

/// Companion text built from the block's own title and description.
pub fn companion_text(block: &ContentBlock) -> String {
    let title = block.title().trim();
    let description = block.description().trim();
    match (title.is_empty(), description.is_empty()) {
        (false, false) => format!("**{title}** {description}"),
        (false, true) => format!("**{title}**"),
        (true, false) => description.to_string(),
        (true, true) => format!("**{}**", block.kind()),
    }
}

pub struct TemplateCompanionWriter;

#[async_trait::async_trait]
impl CompanionWriter for TemplateCompanionWriter {
    async fn write(&self, targets: &[&ContentBlock]) -> anyhow::Result<Vec<Companion>> {
        Ok(targets
            .iter()
            .filter_map(|block| {
                Some(Companion {
                    paired_with: block.id()?.to_string(),
                    content: companion_text(block),
                })
            })
            .collect())
    }
}

/// Gives every data block a `block_N` id in list order. Returns the count.
pub fn assign_ids(blocks: &mut [ContentBlock]) -> usize {
    let mut next = 0;
    for block in blocks.iter_mut().filter(|b| b.is_data()) {
        next += 1;
        block.set_id(format!("block_{next}"));
    }
    next
}

/// Keeps the first usable proposal per target, drops proposals for unknown
/// ids and synthesizes text for targets left without one.
fn settle_companions(targets: &[&ContentBlock], proposals: Vec<Companion>) -> HashMap<String, String> {
    let mut settled = HashMap::new();
    for proposal in proposals {
        let known = targets
            .iter()
            .any(|t| t.id() == Some(proposal.paired_with.as_str()));
        if !known {
            tracing::debug!(paired_with = %proposal.paired_with, "Dropping companion for unknown block");
            continue;
        }
        if proposal.content.trim().is_empty() {
            continue;
        }
        settled
            .entry(proposal.paired_with)
            .or_insert(proposal.content);
    }
    for target in targets {
        if let Some(id) = target.id() {
            settled
                .entry(id.to_string())
                .or_insert_with(|| companion_text(target));
        }
    }
    settled
}

#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub nodes: Vec<LayoutNode>,
    pub fallback: bool,
}

impl Composition {
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().map(LayoutNode::leaf_count).sum()
    }
}

/// Turns the flat block list into the nested layout: ids, companions, then
/// placement by the planner or the rule-based fallback.
pub struct LayoutComposer {
    writer: Arc<dyn CompanionWriter>,
    planner: Option<Arc<dyn LayoutPlanner>>,
}

impl LayoutComposer {
    pub fn new(writer: Arc<dyn CompanionWriter>, planner: Option<Arc<dyn LayoutPlanner>>) -> Self {
        Self { writer, planner }
    }

    pub fn rule_based() -> Self {
        Self::new(Arc::new(TemplateCompanionWriter), None)
    }

    async fn pair(&self, blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
        let targets: Vec<&ContentBlock> = blocks
            .iter()
            .filter(|b| b.id().is_some() && !b.is_self_explanatory())
            .collect();
        if targets.is_empty() {
            return blocks;
        }

        let proposals = match self.writer.write(&targets).await {
            Ok(proposals) => proposals,
            Err(err) => {
                tracing::warn!(error = %err, "Companion writer failed, using block text");
                Vec::new()
            }
        };
        let mut companions = settle_companions(&targets, proposals);

        let mut paired = Vec::with_capacity(blocks.len() + companions.len());
        for block in blocks {
            let companion = block.id().and_then(|id| {
                companions
                    .remove(id)
                    .map(|text| ContentBlock::companion(id, text))
            });
            paired.push(block);
            paired.extend(companion);
        }
        paired
    }

    #[tracing::instrument(
        name = "layout compose",
        skip_all,
        fields(layout.input_blocks = blocks.len(), layout.blocks, layout.fallback)
    )]
    pub async fn compose(&self, mut blocks: Vec<ContentBlock>) -> Composition {
        assign_ids(&mut blocks);
        let blocks = self.pair(blocks).await;

        let planned = match &self.planner {
            None => Err("no_planner"),
            Some(planner) => match planner.plan(&blocks).await {
                Ok(sequence) if !sequence.is_empty() => Ok(sequence),
                Ok(_) => {
                    tracing::warn!("Layout planner returned an empty sequence");
                    Err("empty_sequence")
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Layout planner failed");
                    Err("planner_error")
                }
            },
        };

        let (sequence, fallback) = match planned {
            Ok(sequence) => (sequence, false),
            Err(reason) => {
                LAYOUT_FALLBACK_COUNT.add(1, &[KeyValue::new("reason", reason)]);
                (fallback_sequence(&blocks), true)
            }
        };

        let composition = Composition {
            nodes: materialize(&blocks, &sequence),
            fallback,
        };

        let span = tracing::Span::current();
        span.record("layout.blocks", composition.leaf_count());
        span.record("layout.fallback", fallback);
        composition
    }
}
