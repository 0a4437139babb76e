//! Manifest data model: the declarative documents the resolver merges.

use crate::schedule::strategy::StrategyConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A rule source as named inside a manifest — distinct from
/// [`crate::rules::RuleSource`], which tags where an individual *rule*
/// came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRuleSource {
    pub identifier: String,
    pub location: SourceLocation,
    pub format_hint: Option<String>,
    pub enabled: bool,
    pub priority: i32,
    #[serde(skip)]
    pub update_strategy: Option<StrategyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SourceLocation {
    Url(String),
    LocalPath(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionalItem {
    pub condition: String,
    #[serde(default)]
    pub managed_rules: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub rule_sources: Vec<ManifestRuleSource>,
    #[serde(default)]
    pub included_manifests: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub identifier: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub included_manifests: Vec<String>,
    #[serde(default)]
    pub rule_sources: Vec<ManifestRuleSource>,
    #[serde(default)]
    pub managed_rules: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub conditional_items: Vec<ConditionalItem>,
    pub metadata: ManifestMetadata,
    pub manifest_version: u32,
}

#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub primary: String,
    pub chain: Vec<String>,
    pub resolved_rule_sources: Vec<ManifestRuleSource>,
    pub resolved_managed_rules: HashMap<String, Vec<String>>,
    pub resolved_at: DateTime<Utc>,
    pub warnings: Vec<String>,
}
