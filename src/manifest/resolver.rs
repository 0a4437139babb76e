//! Manifest resolution: fetch order, DFS merge with cycle detection,
//! conditional overlay evaluation, and the top-level fallback chain.

use crate::error::CoreError;
use crate::fetch::http::HttpFetcher;
use crate::manifest::cache::ManifestCache;
use crate::manifest::model::{ConditionalItem, Manifest, ManifestRuleSource, ResolvedManifest};
use crate::manifest::predicate::{EvaluationContext, Predicate};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ManifestResolverConfig {
    pub search_paths: Vec<PathBuf>,
    pub preferred_extensions: Vec<String>,
    pub http_base_url: Option<String>,
}

impl Default for ManifestResolverConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            preferred_extensions: vec!["json".into()],
            http_base_url: None,
        }
    }
}

pub struct ManifestResolver {
    config: ManifestResolverConfig,
    cache: Arc<ManifestCache>,
}

struct DfsState {
    processing: HashSet<String>,
    visited: HashSet<String>,
    warnings: Vec<String>,
    merged_sources: Vec<ManifestRuleSource>,
    merged_rules: HashMap<String, Vec<String>>,
    seen_domains: HashMap<String, HashSet<String>>,
    chain: Vec<String>,
}

impl ManifestResolver {
    pub fn new(config: ManifestResolverConfig, cache: Arc<ManifestCache>) -> Self {
        Self { config, cache }
    }

    /// Resolves the first identifier in the fallback chain that can be
    /// loaded at all: `[client_identifier_if_set, device_serial_if_different, "default"]`.
    pub async fn resolve_with_fallback(
        &self,
        client_identifier: Option<&str>,
        device_serial: Option<&str>,
        ctx: &EvaluationContext,
    ) -> Result<ResolvedManifest, CoreError> {
        let mut candidates = Vec::new();
        if let Some(id) = client_identifier {
            candidates.push(id.to_string());
        }
        if let Some(serial) = device_serial {
            if Some(serial) != client_identifier {
                candidates.push(serial.to_string());
            }
        }
        candidates.push("default".to_string());

        let mut last_error = None;
        for identifier in candidates {
            match self.resolve(&identifier, ctx).await {
                Ok(resolved) => return Ok(resolved),
                Err(err) => {
                    debug!(identifier = %identifier, error = %err, "manifest identifier did not resolve, trying next fallback");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(CoreError::ManifestNotFound("no fallback identifier resolved".into())))
    }

    pub async fn resolve(&self, identifier: &str, ctx: &EvaluationContext) -> Result<ResolvedManifest, CoreError> {
        let mut state = DfsState {
            processing: HashSet::new(),
            visited: HashSet::new(),
            warnings: Vec::new(),
            merged_sources: Vec::new(),
            merged_rules: HashMap::new(),
            seen_domains: HashMap::new(),
            chain: Vec::new(),
        };
        self.resolve_into(identifier, ctx, &mut state).await?;

        state.merged_sources.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(ResolvedManifest {
            primary: identifier.to_string(),
            chain: state.chain,
            resolved_rule_sources: state.merged_sources,
            resolved_managed_rules: state.merged_rules,
            resolved_at: chrono::Utc::now(),
            warnings: state.warnings,
        })
    }

    fn resolve_into<'a>(
        &'a self,
        identifier: &'a str,
        ctx: &'a EvaluationContext,
        state: &'a mut DfsState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CoreError>> + Send + 'a>> {
        Box::pin(async move {
            if state.processing.contains(identifier) {
                return Err(CoreError::ManifestCircularDependency(identifier.to_string()));
            }
            if state.visited.contains(identifier) {
                return Ok(());
            }
            state.processing.insert(identifier.to_string());

            let manifest = self.load(identifier).await?;
            state.chain.push(identifier.to_string());

            for included in &manifest.included_manifests {
                if let Err(err) = self.resolve_into(included, ctx, state).await {
                    state.warnings.push(format!("include '{included}' failed: {err}"));
                }
            }

            for item in &manifest.conditional_items {
                self.apply_conditional(item, ctx, state).await;
            }

            merge_rule_sources(&mut state.merged_sources, &manifest.rule_sources);
            merge_managed_rules(&mut state.merged_rules, &mut state.seen_domains, &manifest.managed_rules);

            state.processing.remove(identifier);
            state.visited.insert(identifier.to_string());
            Ok(())
        })
    }

    async fn apply_conditional(&self, item: &ConditionalItem, ctx: &EvaluationContext, state: &mut DfsState) {
        let predicate = match Predicate::parse(&item.condition) {
            Ok(p) => p,
            Err(err) => {
                state.warnings.push(format!("invalid condition '{}': {err}", item.condition));
                return;
            }
        };
        let (result, warning) = predicate.evaluate(ctx);
        if let Some(warning) = warning {
            state.warnings.push(format!("condition '{}' evaluation error: {warning}", item.condition));
        }
        if !result {
            return;
        }

        merge_rule_sources(&mut state.merged_sources, &item.rule_sources);
        merge_managed_rules(&mut state.merged_rules, &mut state.seen_domains, &item.managed_rules);

        for included in &item.included_manifests {
            if let Err(err) = self.resolve_into(included, ctx, state).await {
                state.warnings.push(format!("conditional include '{included}' failed: {err}"));
            }
        }
    }

    async fn load(&self, identifier: &str) -> Result<Manifest, CoreError> {
        for extension in &self.config.preferred_extensions {
            for dir in &self.config.search_paths {
                let path = dir.join(format!("{identifier}.{extension}"));
                if let Ok(bytes) = tokio::fs::read(&path).await {
                    return parse_manifest_json(&bytes);
                }
            }
        }

        if let Some(base) = &self.config.http_base_url {
            for extension in &self.config.preferred_extensions {
                let url = format!("{}/{identifier}.{extension}", base.trim_end_matches('/'));
                if self.cache.is_negative(&url) {
                    continue;
                }
                let fetcher = HttpFetcher::new(crate::fetch::FetchConfig {
                    url: url.clone(),
                    ..Default::default()
                });
                match fetcher.fetch().await {
                    Ok(bytes) => {
                        if let Ok(manifest) = parse_manifest_json(&bytes) {
                            let cache = self.cache.clone();
                            let identifier = identifier.to_string();
                            let manifest_clone = manifest.clone();
                            tokio::spawn(async move {
                                if let Err(err) = cache.store(&identifier, &manifest_clone) {
                                    warn!(identifier = %identifier, error = %err, "failed to cache fetched manifest");
                                }
                            });
                            return Ok(manifest);
                        }
                    }
                    Err(_) => {
                        self.cache.mark_negative(&url);
                    }
                }
            }
        }

        if let Some((manifest, _expired)) = self.cache.get(identifier, None) {
            return Ok(manifest);
        }

        Err(CoreError::ManifestNotFound(identifier.to_string()))
    }
}

fn parse_manifest_json(bytes: &[u8]) -> Result<Manifest, CoreError> {
    serde_json::from_slice(bytes).map_err(|e| CoreError::ManifestValidation(format!("manifest parse error: {e}")))
}

fn merge_rule_sources(into: &mut Vec<ManifestRuleSource>, additions: &[ManifestRuleSource]) {
    for source in additions {
        if !into.iter().any(|existing| existing.identifier == source.identifier) {
            into.push(source.clone());
        }
    }
}

fn merge_managed_rules(
    into: &mut HashMap<String, Vec<String>>,
    seen: &mut HashMap<String, HashSet<String>>,
    additions: &HashMap<String, Vec<String>>,
) {
    for (category, domains) in additions {
        let bucket = into.entry(category.clone()).or_default();
        let seen_bucket = seen.entry(category.clone()).or_default();
        for domain in domains {
            if seen_bucket.insert(domain.clone()) {
                bucket.push(domain.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::model::SourceLocation;

    fn ctx() -> EvaluationContext {
        EvaluationContext::default()
    }

    fn write_manifest(dir: &std::path::Path, identifier: &str, manifest: &Manifest) {
        let bytes = serde_json::to_vec(manifest).unwrap();
        std::fs::write(dir.join(format!("{identifier}.json")), bytes).unwrap();
    }

    fn resolver(dir: &std::path::Path) -> ManifestResolver {
        let cache = Arc::new(ManifestCache::open(dir.join("cache")).unwrap());
        ManifestResolver::new(
            ManifestResolverConfig {
                search_paths: vec![dir.to_path_buf()],
                preferred_extensions: vec!["json".into()],
                http_base_url: None,
            },
            cache,
        )
    }

    #[tokio::test]
    async fn resolves_a_single_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "base",
            &Manifest {
                identifier: "base".into(),
                rule_sources: vec![ManifestRuleSource {
                    identifier: "ads".into(),
                    location: SourceLocation::Url("https://example.com/ads.txt".into()),
                    format_hint: None,
                    enabled: true,
                    priority: 10,
                    update_strategy: None,
                }],
                ..Default::default()
            },
        );
        let resolver = resolver(dir.path());
        let resolved = resolver.resolve("base", &ctx()).await.unwrap();
        assert_eq!(resolved.resolved_rule_sources.len(), 1);
        assert!(resolved.warnings.is_empty());
    }

    #[tokio::test]
    async fn detects_circular_includes() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "a",
            &Manifest {
                identifier: "a".into(),
                included_manifests: vec!["b".into()],
                ..Default::default()
            },
        );
        write_manifest(
            dir.path(),
            "b",
            &Manifest {
                identifier: "b".into(),
                included_manifests: vec!["a".into()],
                ..Default::default()
            },
        );
        let resolver = resolver(dir.path());
        let resolved = resolver.resolve("a", &ctx()).await.unwrap();
        assert!(resolved.warnings.iter().any(|w| w.contains("failed")));
    }

    #[tokio::test]
    async fn failed_include_produces_a_warning_not_a_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "root",
            &Manifest {
                identifier: "root".into(),
                included_manifests: vec!["missing".into()],
                ..Default::default()
            },
        );
        let resolver = resolver(dir.path());
        let resolved = resolver.resolve("root", &ctx()).await.unwrap();
        assert!(!resolved.warnings.is_empty());
    }

    #[tokio::test]
    async fn conditional_item_merges_only_when_true() {
        let dir = tempfile::tempdir().unwrap();
        let mut rules = HashMap::new();
        rules.insert("ads".to_string(), vec!["ads.example.com".to_string()]);
        write_manifest(
            dir.path(),
            "root",
            &Manifest {
                identifier: "root".into(),
                conditional_items: vec![ConditionalItem {
                    condition: "device_type == \"phone\"".into(),
                    managed_rules: rules,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let resolver = resolver(dir.path());

        let mut phone_ctx = ctx();
        phone_ctx.device_type = Some("phone".into());
        let resolved = resolver.resolve("root", &phone_ctx).await.unwrap();
        assert_eq!(resolved.resolved_managed_rules.get("ads").unwrap().len(), 1);

        let desktop_ctx = {
            let mut c = ctx();
            c.device_type = Some("desktop".into());
            c
        };
        let resolved = resolver.resolve("root", &desktop_ctx).await.unwrap();
        assert!(resolved.resolved_managed_rules.get("ads").is_none());
    }

    #[tokio::test]
    async fn fallback_chain_tries_candidates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "default",
            &Manifest {
                identifier: "default".into(),
                ..Default::default()
            },
        );
        let resolver = resolver(dir.path());
        let resolved = resolver
            .resolve_with_fallback(Some("nonexistent-client"), None, &ctx())
            .await
            .unwrap();
        assert_eq!(resolved.primary, "default");
    }

    #[tokio::test]
    async fn rule_sources_are_sorted_by_priority_descending() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "root",
            &Manifest {
                identifier: "root".into(),
                rule_sources: vec![
                    ManifestRuleSource {
                        identifier: "low".into(),
                        location: SourceLocation::LocalPath("/tmp/low".into()),
                        format_hint: None,
                        enabled: true,
                        priority: 1,
                        update_strategy: None,
                    },
                    ManifestRuleSource {
                        identifier: "high".into(),
                        location: SourceLocation::LocalPath("/tmp/high".into()),
                        format_hint: None,
                        enabled: true,
                        priority: 99,
                        update_strategy: None,
                    },
                ],
                ..Default::default()
            },
        );
        let resolver = resolver(dir.path());
        let resolved = resolver.resolve("root", &ctx()).await.unwrap();
        assert_eq!(resolved.resolved_rule_sources[0].identifier, "high");
    }
}
