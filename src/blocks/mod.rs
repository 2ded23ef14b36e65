pub mod builders;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use builders::derive_blocks;

pub const DEFAULT_ROW_GAP: &str = "16px";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChartType {
    Doughnut,
    Bar,
    Line,
    Pie,
    Radar,
    PolarArea,
}

impl ChartType {
    /// Unknown names render as bar charts.
    pub fn parse(name: &str) -> Self {
        match name {
            "doughnut" => ChartType::Doughnut,
            "line" => ChartType::Line,
            "pie" => ChartType::Pie,
            "radar" => ChartType::Radar,
            "polarArea" => ChartType::PolarArea,
            _ => ChartType::Bar,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChartType::Doughnut => "doughnut",
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Pie => "pie",
            ChartType::Radar => "radar",
            ChartType::PolarArea => "polarArea",
        }
    }

    pub fn is_ratio(self) -> bool {
        matches!(self, ChartType::Doughnut | ChartType::Pie)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkdownBlock {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_with: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "chartType")]
    pub chart_type: ChartType,
    pub title: String,
    pub data: ChartData,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub url: String,
    pub alt: String,
    #[serde(default)]
    pub caption: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub center: GeoPoint,
    pub zoom: u32,
    #[serde(default)]
    pub markers: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub data: Map<String, Value>,
}

/// One renderable unit. Everything except markdown is a data block and
/// receives an id during composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Markdown(MarkdownBlock),
    Chart(ChartBlock),
    Table(TableBlock),
    Image(ImageBlock),
    Map(MapBlock),
    AirQuality(AirQualityBlock),
}

impl ContentBlock {
    pub fn markdown(content: impl Into<String>) -> Self {
        ContentBlock::Markdown(MarkdownBlock {
            content: content.into(),
            paired_with: None,
        })
    }

    pub fn companion(partner: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::Markdown(MarkdownBlock {
            content: content.into(),
            paired_with: Some(partner.into()),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContentBlock::Markdown(_) => "markdown",
            ContentBlock::Chart(_) => "chart",
            ContentBlock::Table(_) => "table",
            ContentBlock::Image(_) => "image",
            ContentBlock::Map(_) => "map",
            ContentBlock::AirQuality(_) => "air_quality",
        }
    }

    pub fn is_data(&self) -> bool {
        !matches!(self, ContentBlock::Markdown(_))
    }

    /// Blocks that need no companion text.
    pub fn is_self_explanatory(&self) -> bool {
        matches!(self, ContentBlock::Map(_) | ContentBlock::AirQuality(_))
    }

    /// Blocks that always take the full width and never sit inside a row.
    pub fn is_row_forbidden(&self) -> bool {
        matches!(
            self,
            ContentBlock::Table(_) | ContentBlock::Map(_) | ContentBlock::AirQuality(_)
        )
    }

    pub fn is_ratio_chart(&self) -> bool {
        matches!(self, ContentBlock::Chart(chart) if chart.chart_type.is_ratio())
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            ContentBlock::Markdown(_) => None,
            ContentBlock::Chart(b) => b.id.as_deref(),
            ContentBlock::Table(b) => b.id.as_deref(),
            ContentBlock::Image(b) => b.id.as_deref(),
            ContentBlock::Map(b) => b.id.as_deref(),
            ContentBlock::AirQuality(b) => b.id.as_deref(),
        }
    }

    /// No-op on markdown blocks.
    pub fn set_id(&mut self, id: String) {
        let slot = match self {
            ContentBlock::Markdown(_) => return,
            ContentBlock::Chart(b) => &mut b.id,
            ContentBlock::Table(b) => &mut b.id,
            ContentBlock::Image(b) => &mut b.id,
            ContentBlock::Map(b) => &mut b.id,
            ContentBlock::AirQuality(b) => &mut b.id,
        };
        *slot = Some(id);
    }

    pub fn paired_with(&self) -> Option<&str> {
        match self {
            ContentBlock::Markdown(b) => b.paired_with.as_deref(),
            _ => None,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            ContentBlock::Markdown(_) => "",
            ContentBlock::Chart(b) => &b.title,
            ContentBlock::Table(b) => &b.title,
            ContentBlock::Image(b) => &b.alt,
            ContentBlock::Map(b) => &b.title,
            ContentBlock::AirQuality(b) => &b.title,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            ContentBlock::Chart(b) => &b.description,
            ContentBlock::Table(b) => &b.description,
            ContentBlock::Image(b) => &b.caption,
            _ => "",
        }
    }

    /// One-line description used in planner prompts and logs.
    pub fn preview(&self) -> String {
        match self {
            ContentBlock::Markdown(b) => {
                let mut text: String = b.content.chars().take(50).collect();
                if b.content.chars().count() > 50 {
                    text.push_str("...");
                }
                format!("markdown: \"{}\"", text.replace('\n', " "))
            }
            ContentBlock::Chart(b) => {
                format!("chart ({}): \"{}\"", b.chart_type.as_str(), b.title)
            }
            ContentBlock::Table(b) => format!("table: \"{}\" ({} rows)", b.title, b.rows.len()),
            other => format!("{}: \"{}\"", other.kind(), other.title()),
        }
    }
}

/// Horizontal container; serialized as `{type: "row", gap, children}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "row")]
pub struct RowBlock {
    pub gap: String,
    pub children: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayoutNode {
    Block(ContentBlock),
    Row(RowBlock),
}

impl LayoutNode {
    pub fn leaf_count(&self) -> usize {
        match self {
            LayoutNode::Block(_) => 1,
            LayoutNode::Row(row) => row.children.len(),
        }
    }

    pub fn leaves(&self) -> Vec<&ContentBlock> {
        match self {
            LayoutNode::Block(block) => vec![block],
            LayoutNode::Row(row) => row.children.iter().collect(),
        }
    }
}
