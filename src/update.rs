//! Update executor (C2-C5 glue): the concrete pipeline the scheduler
//! drives once a source falls due — resolve its manifest entry, fetch,
//! parse, cache, and merge into the rule store.

use crate::cache::RuleSetCache;
use crate::error::CoreError;
use crate::fetch::{FetchConfig, HttpFetcher};
use crate::formats::{NullObserver, ParserOptions, ParserRegistry};
use crate::manifest::{EvaluationContext, ManifestResolver, SourceLocation};
use crate::rules::{NewRule, RuleSource, RuleStore};
use crate::schedule::UpdateExecutor;
use async_trait::async_trait;
use chrono::{Datelike, Utc, Weekday};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A source configured directly in preferences, used when no manifest
/// resolver is wired up (or when resolution for this identifier fails).
#[derive(Debug, Clone)]
pub struct StaticSource {
    pub identifier: String,
    pub url: String,
    pub format_hint: Option<String>,
}

pub struct ManifestUpdateExecutor {
    resolver: Option<Arc<ManifestResolver>>,
    static_sources: Vec<StaticSource>,
    rules: Arc<RuleStore>,
    cache: Arc<RuleSetCache>,
    registry: Arc<ParserRegistry>,
    validate_tls: bool,
    fetch_timeout_secs: u64,
}

impl ManifestUpdateExecutor {
    pub fn new(
        resolver: Option<Arc<ManifestResolver>>,
        static_sources: Vec<StaticSource>,
        rules: Arc<RuleStore>,
        cache: Arc<RuleSetCache>,
        registry: Arc<ParserRegistry>,
        validate_tls: bool,
        fetch_timeout_secs: u64,
    ) -> Self {
        Self {
            resolver,
            static_sources,
            rules,
            cache,
            registry,
            validate_tls,
            fetch_timeout_secs,
        }
    }

    async fn sources_for(&self, source_id: &str) -> Vec<(String, String, Option<String>)> {
        if let Some(resolver) = &self.resolver {
            match resolver.resolve(source_id, &default_evaluation_context()).await {
                Ok(resolved) => {
                    return resolved
                        .resolved_rule_sources
                        .into_iter()
                        .filter(|s| s.enabled)
                        .filter_map(|s| match s.location {
                            SourceLocation::Url(url) => Some((s.identifier, url, s.format_hint)),
                            SourceLocation::LocalPath(_) => None,
                        })
                        .collect();
                }
                Err(err) => {
                    warn!(error = %err, source_id, "manifest resolution failed, falling back to static sources");
                }
            }
        }
        self.static_sources
            .iter()
            .filter(|s| s.identifier == source_id)
            .map(|s| (s.identifier.clone(), s.url.clone(), s.format_hint.clone()))
            .collect()
    }
}

#[async_trait]
impl UpdateExecutor for ManifestUpdateExecutor {
    async fn execute(&self, source_id: &str, cancelled: Arc<AtomicBool>) -> Result<(), CoreError> {
        let sources = self.sources_for(source_id).await;
        if sources.is_empty() {
            return Err(CoreError::ManifestNotFound(source_id.to_string()));
        }

        let mut merged = Vec::new();

        for (identifier, url, format_hint) in sources {
            if cancelled.load(Ordering::Relaxed) {
                return Err(CoreError::Cancelled);
            }

            let fetcher = HttpFetcher::new(FetchConfig {
                url: url.clone(),
                validate_tls: self.validate_tls,
                timeout_seconds: self.fetch_timeout_secs,
                ..FetchConfig::default()
            });
            let bytes = fetcher.fetch().await?;

            let extension = format_hint
                .as_deref()
                .or_else(|| url.rsplit('.').next())
                .filter(|ext| !ext.is_empty());
            let parser = self.registry.dispatch(extension, None, &bytes).ok_or_else(|| CoreError::ParseError {
                line_or_field: identifier.clone(),
                message: "no registered parser matched this rule source".to_string(),
            })?;

            let rule_set = parser.parse(&bytes, &ParserOptions::default(), &NullObserver)?;
            self.cache.store(&identifier, rule_set.clone())?;

            merged.extend(rule_set.rules.into_iter().map(|rule| NewRule {
                domain: rule.domain,
                action: rule.action,
                priority: rule.priority,
                source: RuleSource::Manifest,
                custom_message: rule.custom_message,
                expires_at: rule.expires_at,
                comment: rule.comment,
            }));
        }

        let count = merged.len();
        self.rules.replace_all_from_source(RuleSource::Manifest, merged).await?;
        info!(source = source_id, rules = count, "rule source updated");
        Ok(())
    }
}

fn default_evaluation_context() -> EvaluationContext {
    let now = Utc::now().naive_utc();
    let weekday = now.weekday();
    EvaluationContext {
        os_version: None,
        device_type: None,
        device_model: None,
        network_location: None,
        network_ssid: None,
        vpn_connected: false,
        vpn_identifier: None,
        current_date: now.date(),
        time_of_day: now.time(),
        day_of_week: weekday,
        is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
        user_group: None,
        device_identifier: None,
        security_score: None,
        custom: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RuleSetCacheConfig;
    use crate::rules::RuleStoreConfig;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn missing_source_reports_manifest_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let rules = Arc::new(RuleStore::spawn(RuleStoreConfig::new(dir.path().join("rules.db"))).unwrap());
        let cache = Arc::new(
            RuleSetCache::open(RuleSetCacheConfig {
                disk_dir: dir.path().join("cache"),
                memory_byte_budget: 1024 * 1024,
                disk_byte_budget: 1024 * 1024,
                max_age: chrono::Duration::hours(1),
            })
            .unwrap(),
        );
        let executor = ManifestUpdateExecutor::new(
            None,
            vec![],
            rules,
            cache,
            Arc::new(ParserRegistry::with_builtin_formats()),
            true,
            5,
        );
        let result = executor.execute("unknown", Arc::new(AtomicBool::new(false))).await;
        assert!(matches!(result, Err(CoreError::ManifestNotFound(_))));
    }

    #[tokio::test]
    async fn cancelled_flag_short_circuits_before_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let rules = Arc::new(RuleStore::spawn(RuleStoreConfig::new(dir.path().join("rules.db"))).unwrap());
        let cache = Arc::new(
            RuleSetCache::open(RuleSetCacheConfig {
                disk_dir: dir.path().join("cache"),
                memory_byte_budget: 1024 * 1024,
                disk_byte_budget: 1024 * 1024,
                max_age: chrono::Duration::hours(1),
            })
            .unwrap(),
        );
        let executor = ManifestUpdateExecutor::new(
            None,
            vec![StaticSource {
                identifier: "local".into(),
                url: "http://127.0.0.1:0/unreachable".into(),
                format_hint: Some("hosts".into()),
            }],
            rules,
            cache,
            Arc::new(ParserRegistry::with_builtin_formats()),
            true,
            5,
        );
        let cancelled = Arc::new(AtomicBool::new(true));
        let result = executor.execute("local", cancelled).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }
}
