use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde_json::{Map, Value};

use super::document::BundleCatalog;
use super::query::QuerySpec;
use crate::stats::StatKind;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    /// Owning bundle; `None` for steps proposed by a planner.
    pub bundle: Option<String>,
    pub spec: QuerySpec,
}

/// Ordered, dependency-closed execution plan.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPlan {
    pub bundles: Vec<String>,
    pub queries: Vec<ResolvedQuery>,
    pub stats: Vec<StatKind>,
    /// Bundle whose block config renders each stat.
    pub stat_owners: HashMap<StatKind, String>,
    pub block_configs: IndexMap<String, Map<String, Value>>,
    /// Unknown or cyclic bundles that contributed nothing.
    pub skipped: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
    Failed,
}

struct Expansion<'a> {
    catalog: &'a BundleCatalog,
    seeds: &'a IndexMap<String, Value>,
    marks: HashMap<String, Mark>,
    stack: Vec<String>,
    cyclic: HashSet<String>,
    save_keys: HashSet<String>,
    plan: ResolvedPlan,
}

/// Expands `names` depth first: each bundle's `requires` are loaded before
/// the bundle itself, and every bundle is loaded at most once. A bundle on a
/// dependency cycle fails alone; the rest of the request still resolves.
#[tracing::instrument(
    name = "bundles resolve",
    skip(catalog, seeds),
    fields(plan.bundles, plan.queries, plan.skipped)
)]
pub fn resolve(
    catalog: &BundleCatalog,
    names: &[String],
    seeds: &IndexMap<String, Value>,
) -> ResolvedPlan {
    let mut expansion = Expansion {
        catalog,
        seeds,
        marks: HashMap::new(),
        stack: Vec::new(),
        cyclic: HashSet::new(),
        save_keys: HashSet::new(),
        plan: ResolvedPlan::default(),
    };
    for name in names {
        expansion.visit(name);
    }
    let plan = expansion.plan;

    let span = tracing::Span::current();
    span.record("plan.bundles", plan.bundles.len());
    span.record("plan.queries", plan.queries.len());
    span.record("plan.skipped", plan.skipped.len());
    tracing::info!(
        bundles = ?plan.bundles,
        queries = plan.queries.len(),
        stats = plan.stats.len(),
        "Bundles resolved"
    );
    plan
}

impl Expansion<'_> {
    fn visit(&mut self, name: &str) {
        match self.marks.get(name) {
            Some(Mark::Done | Mark::Failed) => return,
            Some(Mark::Visiting) => {
                let start = self.stack.iter().position(|n| n == name).unwrap_or(0);
                tracing::warn!(
                    bundle = %name,
                    cycle = ?&self.stack[start..],
                    "Dependency cycle detected"
                );
                self.cyclic.extend(self.stack[start..].iter().cloned());
                return;
            }
            None => {}
        }

        let Some(bundle) = self.catalog.bundles.get(name) else {
            tracing::warn!(bundle = %name, "Unknown bundle, skipping");
            self.marks.insert(name.to_string(), Mark::Failed);
            self.plan.skipped.push(name.to_string());
            return;
        };

        self.marks.insert(name.to_string(), Mark::Visiting);
        self.stack.push(name.to_string());
        for dep in &bundle.requires {
            self.visit(dep);
            if self.marks.get(dep.as_str()) == Some(&Mark::Failed) && !self.cyclic.contains(name)
            {
                tracing::warn!(bundle = %name, dependency = %dep, "Dependency unavailable, continuing");
            }
        }
        self.stack.pop();

        if self.cyclic.contains(name) {
            self.marks.insert(name.to_string(), Mark::Failed);
            self.plan.skipped.push(name.to_string());
            return;
        }

        for query in &bundle.queries {
            if !self.save_keys.insert(query.save_as.clone()) {
                tracing::warn!(bundle = %name, save_as = %query.save_as, "Duplicate save_as, skipping query");
                continue;
            }
            self.plan.queries.push(ResolvedQuery {
                bundle: Some(name.to_string()),
                spec: query.bind_seeds(self.seeds),
            });
        }
        for &stat in &bundle.stats {
            if !self.plan.stats.contains(&stat) {
                self.plan.stats.push(stat);
                self.plan.stat_owners.insert(stat, name.to_string());
            }
        }
        if let Some(block) = bundle.block_config() {
            self.plan.block_configs.insert(name.to_string(), block);
        }

        self.marks.insert(name.to_string(), Mark::Done);
        self.plan.bundles.push(name.to_string());
        tracing::debug!(bundle = %name, queries = bundle.queries.len(), "Bundle loaded");
    }
}

impl ResolvedPlan {
    pub fn queries_for(&self, bundle: &str) -> impl Iterator<Item = &ResolvedQuery> {
        self.queries
            .iter()
            .filter(move |q| q.bundle.as_deref() == Some(bundle))
    }

    /// Appends planner-proposed steps after the bundle steps. Steps whose
    /// `save_as` is already planned and malformed steps are skipped. Returns
    /// the number of steps added.
    pub fn merge_planner_queries(
        &mut self,
        queries: &[Value],
        stats: &[String],
        seeds: &IndexMap<String, Value>,
    ) -> usize {
        let mut added = 0;
        for value in queries {
            let spec = match QuerySpec::from_wire(value) {
                Ok(spec) => spec,
                Err(err) => {
                    tracing::warn!(query = %value, error = %err, "Skipping malformed planner query");
                    continue;
                }
            };
            if self.queries.iter().any(|q| q.spec.save_as == spec.save_as) {
                tracing::debug!(save_as = %spec.save_as, "Planner query already covered by bundles");
                continue;
            }
            self.queries.push(ResolvedQuery {
                bundle: None,
                spec: spec.bind_seeds(seeds),
            });
            added += 1;
        }
        for name in stats {
            match StatKind::parse(name) {
                Some(kind) if !self.stats.contains(&kind) => self.stats.push(kind),
                Some(_) => {}
                None => tracing::warn!(stat = %name, "Unknown planner stat"),
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundles::query::Action;
    use crate::bundles::template::EmptyScope;
    use serde_json::json;

    fn catalog() -> BundleCatalog {
        BundleCatalog::from_json(
            &json!({
                "bundles": {
                    "지도": {
                        "description": "location",
                        "queries": [["search", "facility", "slta_nm", "$org", "facility"]]
                    },
                    "대기질": {
                        "requires": ["지도"],
                        "queries": [["filter", "air", {"slta_cd": "$ref.facility.slta_cd"}, 10, "air"]],
                        "block": {"type": "line"}
                    },
                    "리뷰": {
                        "requires": ["지도", "ghost"],
                        "queries": [["filter", "reviews", {"slta_cd": "$ref.facility.slta_cd"}, 100, "reviews"]],
                        "stats": ["review_stats"],
                        "block": {"type": "bar"}
                    },
                    "cycle_a": {"requires": ["cycle_b"], "queries": [["search", "t", "c", "v", "a"]]},
                    "cycle_b": {"requires": ["cycle_a"], "queries": [["search", "t", "c", "v", "b"]]},
                    "above_cycle": {"requires": ["cycle_a"], "queries": [["search", "t", "c", "v", "above"]]},
                    "dup": {"queries": [["search", "t", "c", "v", "facility"]]}
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn seeds() -> IndexMap<String, Value> {
        let mut seeds = IndexMap::new();
        seeds.insert("org".to_string(), json!("서울숲"));
        seeds
    }

    fn save_keys(plan: &ResolvedPlan) -> Vec<&str> {
        plan.queries.iter().map(|q| q.spec.save_as.as_str()).collect()
    }

    #[test]
    fn test_requires_resolve_first() {
        let plan = resolve(&catalog(), &names(&["대기질"]), &seeds());
        assert_eq!(plan.bundles, vec!["지도", "대기질"]);
        assert_eq!(save_keys(&plan), vec!["facility", "air"]);
        assert_eq!(plan.queries[0].bundle.as_deref(), Some("지도"));
    }

    #[test]
    fn test_dependency_precedes_dependent_regardless_of_request_order() {
        for request in [vec!["대기질", "지도"], vec!["지도", "대기질"], vec!["대기질"]] {
            let plan = resolve(&catalog(), &names(&request), &seeds());
            let map_pos = plan.bundles.iter().position(|b| b == "지도").unwrap();
            let air_pos = plan.bundles.iter().position(|b| b == "대기질").unwrap();
            assert!(map_pos < air_pos, "{request:?}");
        }
    }

    #[test]
    fn test_expansion_is_idempotent() {
        let once = resolve(&catalog(), &names(&["지도"]), &seeds());
        let twice = resolve(&catalog(), &names(&["지도", "지도"]), &seeds());
        assert_eq!(once.queries, twice.queries);
        assert_eq!(once.bundles, twice.bundles);
    }

    #[test]
    fn test_seeds_bound_and_refs_kept() {
        let plan = resolve(&catalog(), &names(&["대기질"]), &seeds());
        let search = plan.queries[0].spec.resolve_params(&EmptyScope);
        assert_eq!(search["search_value"], json!("서울숲"));
        let filter = plan.queries[1].spec.resolve_params(&EmptyScope);
        assert_eq!(filter["filters"], json!({"slta_cd": "{facility.slta_cd}"}));
    }

    #[test]
    fn test_unknown_names_skipped() {
        let plan = resolve(&catalog(), &names(&["nope", "리뷰"]), &seeds());
        assert_eq!(plan.bundles, vec!["지도", "리뷰"]);
        assert_eq!(plan.skipped, vec!["nope", "ghost"]);
        assert_eq!(plan.stats, vec![StatKind::Review]);
        assert_eq!(plan.stat_owners[&StatKind::Review], "리뷰");
    }

    #[test]
    fn test_cycle_fails_only_cyclic_bundles() {
        let plan = resolve(&catalog(), &names(&["above_cycle", "지도"]), &seeds());
        assert_eq!(plan.bundles, vec!["above_cycle", "지도"]);
        assert!(plan.skipped.contains(&"cycle_a".to_string()));
        assert!(plan.skipped.contains(&"cycle_b".to_string()));
        assert_eq!(save_keys(&plan), vec!["above", "facility"]);
    }

    #[test]
    fn test_duplicate_save_as_keeps_first() {
        let plan = resolve(&catalog(), &names(&["지도", "dup"]), &seeds());
        assert_eq!(plan.queries.len(), 1);
        assert_eq!(plan.queries[0].bundle.as_deref(), Some("지도"));
    }

    #[test]
    fn test_block_configs_collected_with_purpose() {
        let plan = resolve(&catalog(), &names(&["대기질"]), &seeds());
        assert_eq!(plan.block_configs.len(), 1);
        assert_eq!(plan.block_configs["대기질"]["purpose"], json!(""));
    }

    #[test]
    fn test_merge_planner_queries_dedupes_by_save_as() {
        let mut plan = resolve(&catalog(), &names(&["지도"]), &seeds());
        let added = plan.merge_planner_queries(
            &[
                json!(["search", "facility", "slta_nm", "other", "facility"]),
                json!(["aggregate", "visits", {"group_by": "month"}, "monthly"]),
                json!(["broken"]),
            ],
            &names(&["demographics", "unknown"]),
            &seeds(),
        );
        assert_eq!(added, 1);
        assert_eq!(save_keys(&plan), vec!["facility", "monthly"]);
        assert_eq!(plan.queries[1].spec.action, Action::Aggregate);
        assert!(plan.queries[1].bundle.is_none());
        assert_eq!(plan.stats, vec![StatKind::Demographics]);
    }
}
