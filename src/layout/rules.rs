use super::sequence::{RowSpec, SequenceItem};
use crate::blocks::ContentBlock;

pub const RATIO_ROW_GAP: &str = "24px";

/// A data block together with the companion that directly follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub lead: usize,
    pub members: Vec<usize>,
}

/// Groups the flat list into units; a companion joins the block it follows
/// only when it is paired with that block.
pub fn units(blocks: &[ContentBlock]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < blocks.len() {
        let mut members = vec![i];
        if let Some(id) = blocks[i].id()
            && blocks.get(i + 1).and_then(ContentBlock::paired_with) == Some(id)
        {
            members.push(i + 1);
        }
        i += members.len();
        units.push(Unit { lead: members[0], members });
    }
    units
}

/// Declarative placement rule: when `applies` holds for the lead blocks of
/// the next `span` units, `place` emits their sequence items.
pub struct PlacementRule {
    pub name: &'static str,
    pub span: usize,
    pub applies: fn(&[&ContentBlock]) -> bool,
    pub place: fn(&[Unit]) -> Vec<SequenceItem>,
}

/// Two consecutive doughnut/pie charts share a row with their companions.
pub const RATIO_PAIR: PlacementRule = PlacementRule {
    name: "ratio_pair",
    span: 2,
    applies: |leads| leads.iter().all(|b| b.is_ratio_chart()),
    place: |units| {
        let indices = units.iter().flat_map(|u| u.members.iter().copied()).collect();
        vec![SequenceItem::Row(RowSpec::new(indices, RATIO_ROW_GAP))]
    },
};

/// Everything else keeps its position, companion right after its partner.
pub const STANDALONE: PlacementRule = PlacementRule {
    name: "standalone",
    span: 1,
    applies: |_| true,
    place: |units| {
        units
            .iter()
            .flat_map(|u| u.members.iter().map(|&i| SequenceItem::Index(i as i64)))
            .collect()
    },
};

/// Evaluated in priority order.
pub static RULES: [PlacementRule; 2] = [RATIO_PAIR, STANDALONE];

/// Rule-based layout sequence used when no external placement is available.
/// Always terminates and names every block exactly once.
pub fn fallback_sequence(blocks: &[ContentBlock]) -> Vec<SequenceItem> {
    let units = units(blocks);
    let mut items = Vec::new();
    let mut i = 0;
    while i < units.len() {
        let rule = RULES
            .iter()
            .find(|rule| {
                i + rule.span <= units.len() && {
                    let leads: Vec<&ContentBlock> = units[i..i + rule.span]
                        .iter()
                        .map(|u| &blocks[u.lead])
                        .collect();
                    (rule.applies)(&leads)
                }
            })
            .unwrap_or(&STANDALONE);
        tracing::trace!(rule = rule.name, unit = i, "Placement rule applied");
        items.extend((rule.place)(&units[i..i + rule.span]));
        i += rule.span;
    }
    items
}
