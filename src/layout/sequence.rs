use serde::{Deserialize, Serialize};

use crate::blocks::{ContentBlock, DEFAULT_ROW_GAP, LayoutNode, RowBlock};

fn row_kind() -> String {
    "row".to_string()
}

fn default_gap() -> String {
    DEFAULT_ROW_GAP.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSpec {
    #[serde(rename = "type", default = "row_kind")]
    pub kind: String,
    pub indices: Vec<i64>,
    #[serde(default = "default_gap")]
    pub gap: String,
}

impl RowSpec {
    pub fn new(indices: Vec<usize>, gap: &str) -> Self {
        Self {
            kind: row_kind(),
            indices: indices.into_iter().map(|i| i as i64).collect(),
            gap: gap.to_string(),
        }
    }
}

/// One element of a layout sequence: a block index or a row of indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceItem {
    Index(i64),
    Row(RowSpec),
}

fn slot(index: i64, len: usize) -> Option<usize> {
    usize::try_from(index).ok().filter(|&i| i < len)
}

/// Builds the nested tree for `sequence` over the flat block list.
///
/// Out-of-range and repeated indices are dropped. Row-forbidden blocks named
/// in a row are placed right after it, empty rows vanish and single-child
/// rows collapse. Unplaced companions follow their partner and every other
/// unplaced block is appended in list order, so each block appears exactly
/// once.
pub fn materialize(blocks: &[ContentBlock], sequence: &[SequenceItem]) -> Vec<LayoutNode> {
    let mut placed = vec![false; blocks.len()];
    let mut nodes = Vec::new();

    for item in sequence {
        match item {
            SequenceItem::Index(index) => {
                let Some(i) = slot(*index, blocks.len()).filter(|&i| !placed[i]) else {
                    tracing::debug!(index, "Dropping invalid layout index");
                    continue;
                };
                placed[i] = true;
                nodes.push(LayoutNode::Block(blocks[i].clone()));
            }
            SequenceItem::Row(row) => {
                let mut children = Vec::new();
                let mut hoisted = Vec::new();
                for &index in &row.indices {
                    let Some(i) = slot(index, blocks.len()).filter(|&i| !placed[i]) else {
                        tracing::debug!(index, "Dropping invalid row index");
                        continue;
                    };
                    placed[i] = true;
                    if blocks[i].is_row_forbidden() {
                        hoisted.push(blocks[i].clone());
                    } else {
                        children.push(blocks[i].clone());
                    }
                }
                match children.len() {
                    0 => {}
                    1 => nodes.extend(children.into_iter().map(LayoutNode::Block)),
                    _ => nodes.push(LayoutNode::Row(RowBlock {
                        gap: row.gap.clone(),
                        children,
                    })),
                }
                nodes.extend(hoisted.into_iter().map(LayoutNode::Block));
            }
        }
    }

    let mut orphans = Vec::new();
    for (i, block) in blocks.iter().enumerate() {
        if placed[i] {
            continue;
        }
        if block.paired_with().is_some() {
            orphans.push(block);
        } else {
            nodes.push(LayoutNode::Block(block.clone()));
        }
    }
    for companion in orphans {
        insert_after_partner(&mut nodes, companion);
    }

    nodes
}

fn insert_after_partner(nodes: &mut Vec<LayoutNode>, companion: &ContentBlock) {
    let partner = companion.paired_with();
    let is_partner = |block: &ContentBlock| block.id().is_some() && block.id() == partner;

    let spot = nodes.iter().enumerate().find_map(|(pos, node)| match node {
        LayoutNode::Block(block) if is_partner(block) => Some((pos, None)),
        LayoutNode::Row(row) => row
            .children
            .iter()
            .position(|child| is_partner(child))
            .map(|child| (pos, Some(child))),
        LayoutNode::Block(_) => None,
    });

    match spot {
        Some((pos, None)) => nodes.insert(pos + 1, LayoutNode::Block(companion.clone())),
        Some((pos, Some(child))) => {
            if let LayoutNode::Row(row) = &mut nodes[pos] {
                row.children.insert(child + 1, companion.clone());
            }
        }
        None => nodes.push(LayoutNode::Block(companion.clone())),
    }
}
