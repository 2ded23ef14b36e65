use indexmap::IndexMap;

use super::document::RawPreset;

/// Presets plus the organization keyword mapping that selects them.
#[derive(Debug, Clone, Default)]
pub struct PresetTable {
    presets: IndexMap<String, RawPreset>,
    org_mapping: IndexMap<String, String>,
    default: String,
}

impl PresetTable {
    pub fn new(
        presets: IndexMap<String, RawPreset>,
        org_mapping: IndexMap<String, String>,
        default: String,
    ) -> Self {
        Self {
            presets,
            org_mapping,
            default,
        }
    }

    pub fn default_preset(&self) -> &str {
        &self.default
    }

    /// First keyword, in declaration order, contained in `org_name`.
    pub fn preset_for(&self, org_name: &str) -> &str {
        match self
            .org_mapping
            .iter()
            .find(|(keyword, _)| org_name.contains(keyword.as_str()))
        {
            Some((keyword, preset)) => {
                tracing::info!(org = %org_name, keyword = %keyword, preset = %preset, "Preset matched");
                preset
            }
            None => {
                tracing::info!(org = %org_name, preset = %self.default, "No preset keyword matched, using default");
                &self.default
            }
        }
    }

    /// Bundles of `preset_name`, or of the default preset when the named one
    /// is missing or empty. Never fails; an absent default yields nothing.
    pub fn bundles_for(&self, preset_name: &str) -> Vec<String> {
        if let Some(preset) = self.presets.get(preset_name)
            && !preset.bundles.is_empty()
        {
            return preset.bundles.clone();
        }
        tracing::warn!(preset = %preset_name, default = %self.default, "Preset missing or empty, falling back to default");
        self.presets
            .get(&self.default)
            .map(|p| p.bundles.clone())
            .unwrap_or_default()
    }

    pub fn descriptions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.presets
            .iter()
            .map(|(name, p)| (name.as_str(), p.description.as_str()))
    }
}
