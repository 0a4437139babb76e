//! Preference domain: typed keys the process wiring snapshots into
//! narrower per-component config structs. The core never polls this
//! itself — it only ever sees a `Preferences` snapshot passed in once.

use crate::binder::BindingStrategy;
pub use crate::rules::WildcardRootPolicy;
use serde::{Deserialize, Serialize};

pub trait PreferenceStore: Send + Sync {
    fn binding_strategy(&self) -> String;
    fn vpn_cidrs(&self) -> Vec<String>;
    fn sticky_bindings(&self) -> bool;
    fn manifest_url(&self) -> Option<String>;
    fn manifest_format(&self) -> String;
    fn manifest_update_interval_secs(&self) -> u64;
    fn fetch_timeout_secs(&self) -> u64;
    fn validate_tls(&self) -> bool;
    fn telemetry_enabled(&self) -> bool;
    fn telemetry_endpoint(&self) -> Option<String>;
    fn telemetry_token(&self) -> Option<String>;
    fn telemetry_privacy_level(&self) -> String;
    fn max_retries(&self) -> u32;
    fn initial_backoff_ms(&self) -> u64;
    fn log_to_file(&self) -> bool;
    fn wildcard_root_policy(&self) -> WildcardRootPolicy;
}

/// On-disk shape loaded via `toml`, mirroring the fixed preference
/// domain in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceFile {
    #[serde(default = "default_binding_strategy")]
    pub binding_strategy: String,
    #[serde(default = "default_vpn_cidrs")]
    pub vpn_cidrs: Vec<String>,
    #[serde(default = "default_true")]
    pub sticky_bindings: bool,
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default = "default_manifest_format")]
    pub manifest_format: String,
    #[serde(default = "default_manifest_update_interval")]
    pub manifest_update_interval_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub validate_tls: bool,
    #[serde(default)]
    pub telemetry_enabled: bool,
    #[serde(default)]
    pub telemetry_endpoint: Option<String>,
    #[serde(default)]
    pub telemetry_token: Option<String>,
    #[serde(default = "default_privacy_level")]
    pub telemetry_privacy_level: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default)]
    pub wildcard_root_policy: WildcardRootPolicy,
}

fn default_binding_strategy() -> String {
    "resolver_cidr".to_string()
}
fn default_vpn_cidrs() -> Vec<String> {
    vec!["100.64.0.0/10".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_manifest_format() -> String {
    "json".to_string()
}
fn default_manifest_update_interval() -> u64 {
    3600
}
fn default_fetch_timeout() -> u64 {
    10
}
fn default_privacy_level() -> String {
    "standard".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}

impl Default for PreferenceFile {
    fn default() -> Self {
        Self {
            binding_strategy: default_binding_strategy(),
            vpn_cidrs: default_vpn_cidrs(),
            sticky_bindings: true,
            manifest_url: None,
            manifest_format: default_manifest_format(),
            manifest_update_interval_secs: default_manifest_update_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            validate_tls: true,
            telemetry_enabled: false,
            telemetry_endpoint: None,
            telemetry_token: None,
            telemetry_privacy_level: default_privacy_level(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            log_to_file: false,
            wildcard_root_policy: WildcardRootPolicy::default(),
        }
    }
}

impl PreferenceStore for PreferenceFile {
    fn binding_strategy(&self) -> String {
        self.binding_strategy.clone()
    }
    fn vpn_cidrs(&self) -> Vec<String> {
        self.vpn_cidrs.clone()
    }
    fn sticky_bindings(&self) -> bool {
        self.sticky_bindings
    }
    fn manifest_url(&self) -> Option<String> {
        self.manifest_url.clone()
    }
    fn manifest_format(&self) -> String {
        self.manifest_format.clone()
    }
    fn manifest_update_interval_secs(&self) -> u64 {
        self.manifest_update_interval_secs
    }
    fn fetch_timeout_secs(&self) -> u64 {
        self.fetch_timeout_secs
    }
    fn validate_tls(&self) -> bool {
        self.validate_tls
    }
    fn telemetry_enabled(&self) -> bool {
        self.telemetry_enabled
    }
    fn telemetry_endpoint(&self) -> Option<String> {
        self.telemetry_endpoint.clone()
    }
    fn telemetry_token(&self) -> Option<String> {
        self.telemetry_token.clone()
    }
    fn telemetry_privacy_level(&self) -> String {
        self.telemetry_privacy_level.clone()
    }
    fn max_retries(&self) -> u32 {
        self.max_retries
    }
    fn initial_backoff_ms(&self) -> u64 {
        self.initial_backoff_ms
    }
    fn log_to_file(&self) -> bool {
        self.log_to_file
    }
    fn wildcard_root_policy(&self) -> WildcardRootPolicy {
        self.wildcard_root_policy
    }
}

/// A point-in-time read of every key, snapshotted at startup and on
/// explicit reload; never polled internally by the core.
#[derive(Debug, Clone)]
pub struct Preferences {
    pub binding_strategy: BindingStrategy,
    pub sticky_bindings: bool,
    pub manifest_url: Option<String>,
    pub manifest_format: String,
    pub manifest_update_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub validate_tls: bool,
    pub telemetry_enabled: bool,
    pub telemetry_endpoint: Option<String>,
    pub telemetry_token: Option<String>,
    pub telemetry_privacy_level: String,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub log_to_file: bool,
    pub wildcard_root_policy: WildcardRootPolicy,
}

impl Preferences {
    pub fn snapshot(store: &dyn PreferenceStore) -> Self {
        let binding_strategy = match store.binding_strategy().as_str() {
            "original_path" => BindingStrategy::OriginalPath,
            "active_resolver" => BindingStrategy::ActiveResolver,
            _ => BindingStrategy::ResolverCidr {
                vpn_cidrs: store.vpn_cidrs(),
            },
        };
        Self {
            binding_strategy,
            sticky_bindings: store.sticky_bindings(),
            manifest_url: store.manifest_url(),
            manifest_format: store.manifest_format(),
            manifest_update_interval_secs: store.manifest_update_interval_secs(),
            fetch_timeout_secs: store.fetch_timeout_secs(),
            validate_tls: store.validate_tls(),
            telemetry_enabled: store.telemetry_enabled(),
            telemetry_endpoint: store.telemetry_endpoint(),
            telemetry_token: store.telemetry_token(),
            telemetry_privacy_level: store.telemetry_privacy_level(),
            max_retries: store.max_retries(),
            initial_backoff_ms: store.initial_backoff_ms(),
            log_to_file: store.log_to_file(),
            wildcard_root_policy: store.wildcard_root_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preference_file_parses_from_empty_toml() {
        let parsed: PreferenceFile = toml::from_str("").unwrap();
        assert_eq!(parsed.binding_strategy, "resolver_cidr");
        assert!(parsed.sticky_bindings);
    }

    #[test]
    fn snapshot_maps_strategy_string_to_binding_strategy_variant() {
        let file = PreferenceFile {
            binding_strategy: "original_path".to_string(),
            ..PreferenceFile::default()
        };
        let snapshot = Preferences::snapshot(&file);
        assert!(matches!(snapshot.binding_strategy, BindingStrategy::OriginalPath));
    }
}
