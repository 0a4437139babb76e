//! Pluggable rule-set format parsers, registered in a string-keyed factory
//! so new formats can be added without touching the dispatch call site.

pub mod hosts;
pub mod plist_format;
pub mod structured;

use crate::error::CoreError;
use crate::rules::model::RuleSet;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub strict_mode: bool,
    pub normalize_case: bool,
    pub validate_domains: bool,
    pub allow_duplicates: bool,
    pub max_rule_count: usize,
    pub default_priority: i32,
    pub batch_size: usize,
    pub build_index_while_parsing: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            strict_mode: false,
            normalize_case: true,
            validate_domains: true,
            allow_duplicates: false,
            max_rule_count: 0,
            default_priority: 0,
            batch_size: 1000,
            build_index_while_parsing: false,
        }
    }
}

/// Receives monotone fractional progress (`0.0..=1.0`) every `batch_size`
/// items parsed. The default no-op observer is used when callers don't
/// care to track progress.
pub trait ParseObserver: Send + Sync {
    fn on_progress(&self, fraction: f64);
}

pub struct NullObserver;
impl ParseObserver for NullObserver {
    fn on_progress(&self, _fraction: f64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserCapabilities {
    pub supports_metadata: bool,
    pub supports_priority: bool,
    pub supports_expiry: bool,
}

pub trait RuleSetParser: Send + Sync {
    fn format_id(&self) -> &'static str;
    fn supported_extensions(&self) -> &'static [&'static str];
    fn supported_mimes(&self) -> &'static [&'static str];
    fn capabilities(&self) -> ParserCapabilities;
    fn can_parse(&self, bytes: &[u8]) -> bool;
    fn parse(
        &self,
        bytes: &[u8],
        options: &ParserOptions,
        observer: &dyn ParseObserver,
    ) -> Result<RuleSet, CoreError>;
}

type ParserFactory = Box<dyn Fn() -> Box<dyn RuleSetParser> + Send + Sync>;

/// String-keyed registry of parser factories. Parsers register themselves
/// at construction time rather than the registry hard-coding the list, so
/// callers (and tests) can add formats without touching this file.
pub struct ParserRegistry {
    factories: HashMap<&'static str, ParserFactory>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, format_id: &'static str, factory: ParserFactory) {
        self.factories.insert(format_id, factory);
    }

    pub fn with_builtin_formats() -> Self {
        let mut registry = Self::new();
        registry.register("hosts", Box::new(|| Box::new(hosts::HostsParser)));
        registry.register("structured", Box::new(|| Box::new(structured::StructuredParser)));
        registry.register("plist", Box::new(|| Box::new(plist_format::PlistParser)));
        registry
    }

    pub fn get(&self, format_id: &str) -> Option<Box<dyn RuleSetParser>> {
        self.factories.get(format_id).map(|factory| factory())
    }

    /// Select a parser by file extension, then MIME, then heuristic sniff.
    pub fn dispatch(
        &self,
        extension: Option<&str>,
        mime: Option<&str>,
        bytes: &[u8],
    ) -> Option<Box<dyn RuleSetParser>> {
        for factory in self.factories.values() {
            let parser = factory();
            if let Some(ext) = extension {
                if parser.supported_extensions().contains(&ext) {
                    return Some(parser);
                }
            }
        }
        for factory in self.factories.values() {
            let parser = factory();
            if let Some(mime) = mime {
                if parser.supported_mimes().contains(&mime) {
                    return Some(parser);
                }
            }
        }
        for factory in self.factories.values() {
            let parser = factory();
            if parser.can_parse(bytes) {
                return Some(parser);
            }
        }
        None
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin_formats()
    }
}

const SINKHOLE_IPS: &[&str] = &[
    "0.0.0.0",
    "127.0.0.1",
    "::1",
    "::",
    "0:0:0:0:0:0:0:0",
    "0:0:0:0:0:0:0:1",
];

const LOCAL_EXCLUSIONS: &[&str] = &["localhost", "localhost.localdomain", "local", "broadcasthost"];

pub(crate) fn looks_like_sinkhole_ip(token: &str) -> bool {
    if SINKHOLE_IPS.contains(&token) {
        return true;
    }
    token.parse::<std::net::IpAddr>().is_ok()
}

pub(crate) fn is_local_exclusion(domain: &str) -> bool {
    LOCAL_EXCLUSIONS.contains(&domain)
}

/// Validates a domain per the shared rule: non-empty, <= 253 octets,
/// dot-separated labels each matching `[A-Za-z0-9_-]{1,63}`, with a
/// leading `*.` permitted for wildcard rules.
pub fn validate_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    let rest = domain.strip_prefix("*.").unwrap_or(domain);
    if rest.is_empty() {
        return false;
    }
    rest.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

pub fn normalize_domain(domain: &str, options: &ParserOptions) -> String {
    if options.normalize_case {
        domain.to_lowercase()
    } else {
        domain.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_plain_and_wildcard_domains() {
        assert!(validate_domain("example.com"));
        assert!(validate_domain("*.example.com"));
        assert!(!validate_domain(""));
        assert!(!validate_domain("*."));
        assert!(!validate_domain("exa mple.com"));
    }

    #[test]
    fn rejects_oversize_label() {
        let label = "a".repeat(64);
        assert!(!validate_domain(&format!("{label}.com")));
    }

    #[test]
    fn registry_dispatches_by_extension() {
        let registry = ParserRegistry::with_builtin_formats();
        let parser = registry.dispatch(Some("json"), None, b"{}");
        assert_eq!(parser.unwrap().format_id(), "structured");
        let by_sniff = registry.dispatch(None, None, b"{\"blocked\":[]}");
        assert!(by_sniff.is_some());
    }
}
