//! Rule data model shared by the store (C2), the format parsers (C4) and
//! the manifest resolver (C7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    Block,
    Allow,
}

impl RuleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleAction::Block => "block",
            RuleAction::Allow => "allow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "block" => Some(RuleAction::Block),
            "allow" => Some(RuleAction::Allow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleType {
    Exact,
    Wildcard,
    Regex,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Exact => "exact",
            RuleType::Wildcard => "wildcard",
            RuleType::Regex => "regex",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(RuleType::Exact),
            "wildcard" => Some(RuleType::Wildcard),
            "regex" => Some(RuleType::Regex),
            _ => None,
        }
    }

    /// Infer a rule's type from its stored domain key.
    pub fn infer(domain: &str) -> Self {
        if domain.starts_with("*.") {
            RuleType::Wildcard
        } else if domain.starts_with("re:") {
            RuleType::Regex
        } else {
            RuleType::Exact
        }
    }
}

/// Whether a bare `*.domain` wildcard rule also covers `domain` itself, not
/// just its subdomains. Read from preferences by the caller and passed into
/// `RuleStore::rule_for_domain` — the store never decides this on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WildcardRootPolicy {
    /// A bare `*.` wildcard with no concrete suffix also blocks the
    /// registrable root domain itself.
    IncludeRoot,
    /// A bare `*.` wildcard matches only subdomains, never the root.
    ExcludeRoot,
}

impl Default for WildcardRootPolicy {
    fn default() -> Self {
        WildcardRootPolicy::ExcludeRoot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleSource {
    User,
    Manifest,
    List,
    Builtin,
}

impl RuleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleSource::User => "user",
            RuleSource::Manifest => "manifest",
            RuleSource::List => "list",
            RuleSource::Builtin => "builtin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(RuleSource::User),
            "manifest" => Some(RuleSource::Manifest),
            "list" => Some(RuleSource::List),
            "builtin" => Some(RuleSource::Builtin),
            _ => None,
        }
    }
}

/// A single policy rule. `domain` is the primary key: inserting a second
/// rule under the same key replaces the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub domain: String,
    pub action: RuleAction,
    pub rule_type: RuleType,
    pub priority: i32,
    pub source: RuleSource,
    pub custom_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

impl Rule {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry < now)
    }
}

/// A named, sourced collection of rules produced by a format parser (C4)
/// or held in the rule-set cache (C3) before being merged into the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: Option<String>,
    pub version: Option<String>,
    pub source_identifier: String,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(source_identifier: impl Into<String>) -> Self {
        Self {
            name: None,
            version: None,
            source_identifier: source_identifier.into(),
            rules: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RulesChanged {
    pub source: Option<String>,
    pub changed_at: DateTime<Utc>,
}
