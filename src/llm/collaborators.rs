use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{GenerateRequest, LlmClient};
use crate::blocks::ContentBlock;
use crate::layout::{Companion, CompanionWriter, LayoutPlanner, SequenceItem};

const COMPANION_SYSTEM_PROMPT: &str = "You write short explanatory notes for charts, \
    tables and images in a facility report. Each note is one or two sentences of markdown \
    that states what the block shows, using the numbers given. Do not invent data.";

const LAYOUT_SYSTEM_PROMPT: &str = "You arrange report blocks into a readable layout.\n\
    Rules:\n\
    - A block and the markdown paired with it stay adjacent, in a row or one after the other.\n\
    - Two to four doughnut or pie charts may share a row together with their paired markdown; use gap \"24px\".\n\
    - table, map and air_quality blocks are never placed inside a row.\n\
    - Section headings stand alone.\n\
    Answer with a JSON object {\"layout_sequence\": [...]} only. Each element is either \
    a block index or {\"type\": \"row\", \"indices\": [...], \"gap\": \"16px\"}.";

/// Pulls the JSON payload out of a model answer: fenced blocks first, then
/// the outermost object or array.
pub(crate) fn extract_json(content: &str) -> String {
    if let Some(start) = content.find("```json")
        && let Some(end) = content[start + 7..].find("```")
    {
        return content[start + 7..start + 7 + end].trim().to_string();
    }
    if let Some(start) = content.find("```")
        && let Some(end) = content[start + 3..].find("```")
    {
        let inner = content[start + 3..start + 3 + end].trim();
        if inner.starts_with('{') || inner.starts_with('[') {
            return inner.to_string();
        }
    }
    let (open, close) = match (content.find('['), content.find('{')) {
        (Some(a), Some(o)) if a < o => ('[', ']'),
        (Some(_), None) => ('[', ']'),
        _ => ('{', '}'),
    };
    if let Some(start) = content.find(open)
        && let Some(end) = content.rfind(close)
        && start < end
    {
        return content[start..=end].to_string();
    }
    content.to_string()
}

/// Parses a list answer, accepting either a bare array or an object that
/// wraps the array under `key`.
fn parse_list<T: DeserializeOwned>(content: &str, key: &str) -> anyhow::Result<Vec<T>> {
    let value: Value = serde_json::from_str(&extract_json(content))?;
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => map
            .remove(key)
            .ok_or_else(|| anyhow::anyhow!("answer has no {key:?} list"))?,
        other => anyhow::bail!("unexpected answer shape: {other}"),
    };
    Ok(serde_json::from_value(list)?)
}

fn describe(block: &ContentBlock) -> String {
    match block {
        ContentBlock::Chart(chart) => {
            let points: Vec<String> = chart
                .data
                .labels
                .iter()
                .zip(&chart.data.values)
                .map(|(label, value)| format!("{label}={value}"))
                .collect();
            format!(
                "{} | {} | {}",
                block.preview(),
                points.join(", "),
                chart.description
            )
        }
        _ if block.description().is_empty() => block.preview(),
        _ => format!("{} | {}", block.preview(), block.description()),
    }
}

pub struct LlmCompanionWriter {
    client: Arc<LlmClient>,
    model: String,
}

impl LlmCompanionWriter {
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl CompanionWriter for LlmCompanionWriter {
    #[tracing::instrument(
        name = "llm write_companions",
        skip_all,
        fields(companions.targets = targets.len(), companions.parsed)
    )]
    async fn write(&self, targets: &[&ContentBlock]) -> anyhow::Result<Vec<Companion>> {
        let listing: Vec<String> = targets
            .iter()
            .filter_map(|b| Some(format!("[{}] {}", b.id()?, describe(b))))
            .collect();

        let prompt = format!(
            "Write one note for each block below.\n\n{}\n\n\
            Return a JSON object: {{\"companions\": [{{\"paired_with\": \"block_1\", \"content\": \"...\"}}]}}",
            listing.join("\n")
        );

        let resp = self
            .client
            .generate(&GenerateRequest {
                model: self.model.clone(),
                system: COMPANION_SYSTEM_PROMPT.to_string(),
                prompt,
                temperature: 0.3,
                max_tokens: 2048,
                stage: "companions".to_string(),
                json: true,
            })
            .await?;

        let companions: Vec<Companion> = parse_list(&resp.content, "companions")?;
        tracing::Span::current().record("companions.parsed", companions.len());
        Ok(companions)
    }
}

pub struct LlmLayoutPlanner {
    client: Arc<LlmClient>,
    model: String,
}

impl LlmLayoutPlanner {
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl LayoutPlanner for LlmLayoutPlanner {
    #[tracing::instrument(
        name = "llm plan_layout",
        skip_all,
        fields(layout.blocks = blocks.len(), layout.items)
    )]
    async fn plan(&self, blocks: &[ContentBlock]) -> anyhow::Result<Vec<SequenceItem>> {
        let listing: Vec<String> = blocks
            .iter()
            .enumerate()
            .map(|(i, b)| match b.paired_with() {
                Some(partner) => format!("[{i}] {} (explains {partner})", b.preview()),
                None => match b.id() {
                    Some(id) => format!("[{i}] {} id={id}", b.preview()),
                    None => format!("[{i}] {}", b.preview()),
                },
            })
            .collect();

        let prompt = format!(
            "Blocks to arrange ({}):\n{}\n\nReturn the layout sequence.",
            blocks.len(),
            listing.join("\n")
        );

        let resp = self
            .client
            .generate(&GenerateRequest {
                model: self.model.clone(),
                system: LAYOUT_SYSTEM_PROMPT.to_string(),
                prompt,
                temperature: 0.1,
                max_tokens: 1024,
                stage: "layout".to_string(),
                json: true,
            })
            .await?;

        let sequence: Vec<SequenceItem> = parse_list(&resp.content, "layout_sequence")?;
        tracing::Span::current().record("layout.items", sequence.len());
        Ok(sequence)
    }
}
