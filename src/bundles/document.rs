use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::presets::PresetTable;
use super::query::QuerySpec;
use super::template::ParamValue;
use crate::engine::result::is_reserved_key;
use crate::error::ConfigError;
use crate::stats::StatKind;

pub const DEFAULT_PRESET: &str = "기본";
pub const DEFAULT_API_PRESET: &str = "빠른조회";

#[derive(Debug, Clone)]
pub struct BundleDefinition {
    pub name: String,
    pub description: String,
    pub purpose: Option<String>,
    pub requires: Vec<String>,
    pub queries: Vec<QuerySpec>,
    pub stats: Vec<StatKind>,
    pub block: Option<Map<String, Value>>,
}

impl BundleDefinition {
    /// Block config handed to the renderer, with `purpose` filled in from the
    /// bundle's purpose or, failing that, its description.
    pub fn block_config(&self) -> Option<Map<String, Value>> {
        let mut block = self.block.clone().filter(|b| !b.is_empty())?;
        let purpose = self
            .purpose
            .clone()
            .unwrap_or_else(|| self.description.clone());
        block.insert("purpose".to_string(), Value::String(purpose));
        Some(block)
    }
}

#[derive(Debug, Clone)]
pub enum ApiBundleKind {
    Single {
        api: String,
        params: IndexMap<String, ParamValue>,
        save_as: String,
    },
    Composite {
        members: Vec<String>,
        db_bundle: Option<String>,
        merge_strategy: String,
    },
}

#[derive(Debug, Clone)]
pub struct ApiBundle {
    pub name: String,
    pub description: String,
    pub kind: ApiBundleKind,
    pub block: Option<Map<String, Value>>,
}

impl ApiBundle {
    /// Key the bundle's result is stored under.
    pub fn save_as(&self) -> &str {
        match &self.kind {
            ApiBundleKind::Single { save_as, .. } => save_as,
            ApiBundleKind::Composite { .. } => &self.name,
        }
    }

    pub fn listing(&self) -> String {
        match self.kind {
            ApiBundleKind::Single { .. } => format!("[API] {}", self.description),
            ApiBundleKind::Composite { .. } => format!("[MIXED] {}", self.description),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// A REST endpoint an API bundle may call by name.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEndpoint {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub default_params: Map<String, Value>,
}

/// Validated, immutable view of one bundle document.
#[derive(Debug, Clone, Default)]
pub struct BundleCatalog {
    pub bundles: IndexMap<String, BundleDefinition>,
    pub presets: PresetTable,
    pub api_bundles: IndexMap<String, ApiBundle>,
    pub api_presets: PresetTable,
    pub apis: IndexMap<String, ApiEndpoint>,
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default = "default_preset")]
    default_preset: String,
    #[serde(default)]
    bundles: IndexMap<String, Value>,
    #[serde(default)]
    presets: IndexMap<String, RawPreset>,
    #[serde(default)]
    org_preset_mapping: IndexMap<String, String>,
    #[serde(default = "default_api_preset")]
    default_api_preset: String,
    #[serde(default)]
    api_bundles: IndexMap<String, Value>,
    #[serde(default)]
    api_presets: IndexMap<String, RawPreset>,
    #[serde(default)]
    org_api_preset_mapping: IndexMap<String, String>,
    #[serde(default)]
    apis: IndexMap<String, Value>,
}

fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}

fn default_api_preset() -> String {
    DEFAULT_API_PRESET.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPreset {
    #[serde(default)]
    pub bundles: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
struct RawBundle {
    #[serde(default)]
    description: String,
    purpose: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    queries: Vec<Value>,
    #[serde(default)]
    stats: Vec<String>,
    block: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct RawApiBundle {
    #[serde(default)]
    description: String,
    api: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
    save_as: Option<String>,
    members: Option<Vec<String>>,
    db_bundle: Option<String>,
    merge_strategy: Option<String>,
    block: Option<Map<String, Value>>,
}

impl BundleCatalog {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawDocument = serde_json::from_str(text)?;

        let mut bundles = IndexMap::new();
        for (name, value) in raw.bundles.iter().filter(|(n, _)| !n.starts_with('_')) {
            match parse_bundle(name, value) {
                Ok(bundle) => {
                    bundles.insert(name.clone(), bundle);
                }
                Err(err) => {
                    tracing::warn!(bundle = %name, error = %err, "Skipping invalid bundle");
                }
            }
        }

        let mut api_bundles = IndexMap::new();
        for (name, value) in raw.api_bundles.iter().filter(|(n, _)| !n.starts_with('_')) {
            match parse_api_bundle(name, value) {
                Ok(bundle) => {
                    api_bundles.insert(name.clone(), bundle);
                }
                Err(err) => {
                    tracing::warn!(bundle = %name, error = %err, "Skipping invalid API bundle");
                }
            }
        }

        let mut apis = IndexMap::new();
        for (name, value) in raw.apis.iter().filter(|(n, _)| !n.starts_with('_')) {
            match ApiEndpoint::deserialize(value) {
                Ok(endpoint) => {
                    apis.insert(name.clone(), endpoint);
                }
                Err(err) => {
                    tracing::warn!(api = %name, error = %err, "Skipping invalid API endpoint");
                }
            }
        }

        Ok(Self {
            bundles,
            presets: PresetTable::new(raw.presets, raw.org_preset_mapping, raw.default_preset),
            api_bundles,
            api_presets: PresetTable::new(
                raw.api_presets,
                raw.org_api_preset_mapping,
                raw.default_api_preset,
            ),
            apis,
        })
    }

    /// Name to description of every preset, database presets first.
    pub fn available_presets(&self) -> IndexMap<String, String> {
        self.presets
            .descriptions()
            .chain(self.api_presets.descriptions())
            .map(|(name, desc)| (name.to_string(), desc.to_string()))
            .collect()
    }

    /// Name to description of every bundle; API bundles carry a
    /// `[API]` or `[MIXED]` prefix.
    pub fn available_bundles(&self) -> IndexMap<String, String> {
        let mut listing: IndexMap<String, String> = self
            .bundles
            .values()
            .map(|b| (b.name.clone(), b.description.clone()))
            .collect();
        for bundle in self.api_bundles.values() {
            listing.insert(bundle.name.clone(), bundle.listing());
        }
        listing
    }
}

fn invalid_bundle(name: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidBundle {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bundle(name: &str, value: &Value) -> Result<BundleDefinition, ConfigError> {
    let raw = RawBundle::deserialize(value).map_err(|e| invalid_bundle(name, e))?;

    let mut queries = Vec::with_capacity(raw.queries.len());
    for query in &raw.queries {
        match QuerySpec::from_wire(query) {
            Ok(spec) => queries.push(spec),
            Err(err) => {
                tracing::warn!(bundle = %name, query = %query, error = %err, "Skipping malformed query");
            }
        }
    }

    let mut stats = Vec::new();
    for stat in &raw.stats {
        match StatKind::parse(stat) {
            Some(kind) if !stats.contains(&kind) => stats.push(kind),
            Some(_) => {}
            None => tracing::warn!(bundle = %name, stat = %stat, "Unknown stat kind"),
        }
    }

    Ok(BundleDefinition {
        name: name.to_string(),
        description: raw.description,
        purpose: raw.purpose,
        requires: raw.requires,
        queries,
        stats,
        block: raw.block,
    })
}

fn parse_api_bundle(name: &str, value: &Value) -> Result<ApiBundle, ConfigError> {
    let raw = RawApiBundle::deserialize(value).map_err(|e| invalid_bundle(name, e))?;

    let kind = match (raw.api, raw.members) {
        (Some(api), None) => ApiBundleKind::Single {
            api,
            params: raw
                .params
                .iter()
                .map(|(k, v)| (k.clone(), ParamValue::from_json(v)))
                .collect(),
            save_as: raw.save_as.unwrap_or_else(|| name.to_string()),
        },
        (None, Some(members)) => ApiBundleKind::Composite {
            members,
            db_bundle: raw.db_bundle,
            merge_strategy: raw.merge_strategy.unwrap_or_else(|| "union".to_string()),
        },
        (Some(_), Some(_)) => return Err(invalid_bundle(name, "bundle sets both api and members")),
        (None, None) => return Err(invalid_bundle(name, "bundle needs either api or members")),
    };

    let bundle = ApiBundle {
        name: name.to_string(),
        description: raw.description,
        kind,
        block: raw.block,
    };
    if is_reserved_key(bundle.save_as()) {
        return Err(invalid_bundle(
            name,
            format!("result key {:?} is reserved", bundle.save_as()),
        ));
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> String {
        json!({
            "bundles": {
                "_guide": {"description": "how to write bundles"},
                "기본정보": {
                    "description": "facility basics",
                    "queries": [["search", "facility", "slta_nm", "$org", "facility"]]
                },
                "리뷰": {
                    "description": "review distribution",
                    "purpose": "show satisfaction",
                    "requires": ["기본정보"],
                    "queries": [
                        ["filter", "reviews", {"slta_cd": "$ref.facility.slta_cd"}, 100, "reviews"],
                        ["bogus"]
                    ],
                    "stats": ["review", "review_stats", "sentiment"],
                    "block": {"type": "bar", "title": "Ratings"}
                },
                "broken": {"requires": "not-a-list"}
            },
            "presets": {"기본": {"bundles": ["기본정보"], "description": "default"}},
            "api_bundles": {
                "지도": {"description": "map", "api": "maps_javascript", "params": {"center_lat": "$lat"}},
                "주변": {"description": "surroundings", "members": ["지도"], "db_bundle": "기본정보"},
                "invalid": {"description": "neither"}
            },
            "apis": {"geocoding": {"url": "https://example.test/geocode"}}
        })
        .to_string()
    }

    #[test]
    fn test_catalog_skips_underscore_and_invalid_entries() {
        let catalog = BundleCatalog::from_json(&sample()).unwrap();
        let names: Vec<&str> = catalog.bundles.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["기본정보", "리뷰"]);
        assert_eq!(catalog.api_bundles.len(), 2);
        assert_eq!(catalog.apis["geocoding"].method, HttpMethod::Get);
    }

    #[test]
    fn test_bundle_stats_deduplicated_and_queries_validated() {
        let catalog = BundleCatalog::from_json(&sample()).unwrap();
        let reviews = &catalog.bundles["리뷰"];
        assert_eq!(reviews.queries.len(), 1);
        assert_eq!(reviews.stats, vec![StatKind::Review]);
        assert_eq!(reviews.requires, vec!["기본정보".to_string()]);
    }

    #[test]
    fn test_block_config_gets_purpose() {
        let catalog = BundleCatalog::from_json(&sample()).unwrap();
        let block = catalog.bundles["리뷰"].block_config().unwrap();
        assert_eq!(block["purpose"], json!("show satisfaction"));
        assert_eq!(block["type"], json!("bar"));
        assert!(catalog.bundles["기본정보"].block_config().is_none());
    }

    #[test]
    fn test_available_bundles_prefixes_api_kinds() {
        let catalog = BundleCatalog::from_json(&sample()).unwrap();
        let listing = catalog.available_bundles();
        assert_eq!(listing["리뷰"], "review distribution");
        assert_eq!(listing["지도"], "[API] map");
        assert_eq!(listing["주변"], "[MIXED] surroundings");
        assert!(!listing.contains_key("_guide"));
    }

    #[test]
    fn test_single_api_bundle_defaults_save_as_to_name() {
        let catalog = BundleCatalog::from_json(&sample()).unwrap();
        assert_eq!(catalog.api_bundles["지도"].save_as(), "지도");
    }

    #[test]
    fn test_api_bundle_errors_name_the_bundle() {
        let err = parse_api_bundle("invalid", &json!({"description": "neither"})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid bundle \"invalid\": bundle needs either api or members"
        );

        let err = parse_bundle("broken", &json!({"requires": "not-a-list"})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBundle { ref name, .. } if name == "broken"));
    }

    #[test]
    fn test_reserved_result_keys_rejected() {
        let catalog = BundleCatalog::from_json(
            &json!({
                "bundles": {
                    "overlap": {"queries": [
                        ["search", "facility", "slta_nm", "$org", "success"],
                        ["search", "facility", "slta_nm", "$org", "facility"]
                    ]}
                },
                "api_bundles": {
                    "status": {"api": "air_quality", "save_as": "errors"},
                    "stats": {"members": ["status"]},
                    "air": {"api": "air_quality"}
                }
            })
            .to_string(),
        )
        .unwrap();
        let saves: Vec<&str> = catalog.bundles["overlap"]
            .queries
            .iter()
            .map(|q| q.save_as.as_str())
            .collect();
        assert_eq!(saves, vec!["facility"]);
        let api: Vec<&str> = catalog.api_bundles.keys().map(String::as_str).collect();
        assert_eq!(api, vec!["air"]);
    }

    #[test]
    fn test_available_presets_lists_both_tables() {
        let catalog = BundleCatalog::from_json(
            &json!({
                "presets": {"기본": {"bundles": [], "description": "default"}},
                "api_presets": {"환경": {"bundles": [], "description": "surroundings"}}
            })
            .to_string(),
        )
        .unwrap();
        let presets = catalog.available_presets();
        let names: Vec<&str> = presets.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["기본", "환경"]);
        assert_eq!(presets["환경"], "surroundings");
    }

    #[test]
    fn test_invalid_document_is_parse_error() {
        let err = BundleCatalog::from_json("{\"bundles\": []}").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
