//! Text-hosts blocklist parser: `IP domain [alias...]` lines, with a small
//! vocabulary of recognized metadata and allowlist comments.

use crate::error::CoreError;
use crate::formats::{
    ParseObserver, ParserCapabilities, ParserOptions, RuleSetParser, is_local_exclusion,
    looks_like_sinkhole_ip, normalize_domain, validate_domain,
};
use crate::rules::model::{Rule, RuleAction, RuleSet, RuleSource, RuleType};
use chrono::Utc;
use std::collections::HashSet;

const METADATA_KEYS: &[&str] = &[
    "Title",
    "Name",
    "Version",
    "Updated",
    "Last-Modified",
    "Date",
    "Author",
    "Maintainer",
    "Homepage",
    "URL",
    "Source",
    "Description",
    "License",
    "Expires",
];

pub struct HostsParser;

impl RuleSetParser for HostsParser {
    fn format_id(&self) -> &'static str {
        "hosts"
    }

    fn supported_extensions(&self) -> &'static [&'static str] {
        &["hosts", "txt"]
    }

    fn supported_mimes(&self) -> &'static [&'static str] {
        &["text/plain"]
    }

    fn capabilities(&self) -> ParserCapabilities {
        ParserCapabilities {
            supports_metadata: true,
            supports_priority: false,
            supports_expiry: false,
        }
    }

    fn can_parse(&self, bytes: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return false;
        };
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .take(20)
            .any(|line| {
                line.split_whitespace()
                    .next()
                    .is_some_and(looks_like_sinkhole_ip)
            })
    }

    fn parse(
        &self,
        bytes: &[u8],
        options: &ParserOptions,
        observer: &dyn ParseObserver,
    ) -> Result<RuleSet, CoreError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CoreError::ParseError {
                line_or_field: "<body>".into(),
                message: e.to_string(),
            })?;

        let mut rule_set = RuleSet::new("hosts");
        let mut seen: HashSet<(String, &'static str)> = HashSet::new();
        let total_lines = text.lines().count().max(1);

        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();

            if line.is_empty() {
                continue;
            }

            if let Some(comment) = line.strip_prefix('#') {
                let comment = comment.trim();
                apply_metadata(&mut rule_set, comment);
                if let Some(domain) = allowlist_comment_domain(comment) {
                    push_rule(
                        &mut rule_set,
                        &mut seen,
                        domain,
                        RuleAction::Allow,
                        options,
                    )?;
                }
                continue;
            }

            let line = match line.split_once('#') {
                Some((before, _)) => before.trim(),
                None => line,
            };
            if line.is_empty() {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let Some(ip_token) = tokens.next() else {
                continue;
            };
            if !looks_like_sinkhole_ip(ip_token) {
                if options.strict_mode {
                    return Err(CoreError::ParseError {
                        line_or_field: format!("line {}", index + 1),
                        message: format!("expected a sinkhole IP, found {ip_token}"),
                    });
                }
                continue;
            }

            for domain in tokens {
                if is_local_exclusion(domain) {
                    continue;
                }
                match push_rule(&mut rule_set, &mut seen, domain, RuleAction::Block, options) {
                    Ok(()) => {}
                    Err(err) if options.strict_mode => return Err(err),
                    Err(_) => continue,
                }
                if options.max_rule_count != 0 && rule_set.len() >= options.max_rule_count {
                    return Ok(rule_set);
                }
            }

            if (index + 1) % options.batch_size.max(1) == 0 {
                observer.on_progress((index + 1) as f64 / total_lines as f64);
            }
        }

        observer.on_progress(1.0);
        Ok(rule_set)
    }
}

fn apply_metadata(rule_set: &mut RuleSet, comment: &str) {
    let Some((key, value)) = comment.split_once(':') else {
        return;
    };
    let key = key.trim();
    let value = value.trim();
    if !METADATA_KEYS.contains(&key) {
        return;
    }
    match key {
        "Title" | "Name" => rule_set.name = Some(value.to_string()),
        "Version" => rule_set.version = Some(value.to_string()),
        _ => {}
    }
}

fn allowlist_comment_domain(comment: &str) -> Option<&str> {
    for marker in ["@whitelist", "@allow", "@allowlist"] {
        if let Some(rest) = comment.strip_prefix(marker) {
            let domain = rest.trim();
            if !domain.is_empty() {
                return Some(domain);
            }
        }
    }
    None
}

fn push_rule(
    rule_set: &mut RuleSet,
    seen: &mut HashSet<(String, &'static str)>,
    domain: &str,
    action: RuleAction,
    options: &ParserOptions,
) -> Result<(), CoreError> {
    let normalized = normalize_domain(domain, options);
    if options.validate_domains && !validate_domain(&normalized) {
        return Err(CoreError::ParseError {
            line_or_field: normalized.clone(),
            message: "invalid domain".into(),
        });
    }

    let key = (normalized.clone(), action.as_str());
    if !options.allow_duplicates && !seen.insert(key) {
        return Ok(());
    }

    rule_set.rules.push(Rule {
        domain: normalized.clone(),
        action,
        rule_type: RuleType::infer(&normalized),
        priority: options.default_priority,
        source: RuleSource::List,
        custom_message: None,
        updated_at: Utc::now(),
        expires_at: None,
        comment: None,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::NullObserver;

    fn parse(text: &str) -> RuleSet {
        HostsParser
            .parse(text.as_bytes(), &ParserOptions::default(), &NullObserver)
            .unwrap()
    }

    #[test]
    fn parses_basic_hosts_lines() {
        let rule_set = parse("0.0.0.0 ads.example.com\n127.0.0.1 tracker.example.com\n");
        assert_eq!(rule_set.len(), 2);
        assert!(rule_set.rules.iter().all(|r| r.action == RuleAction::Block));
    }

    #[test]
    fn skips_localhost_aliases() {
        let rule_set = parse("0.0.0.0 localhost ads.example.com broadcasthost\n");
        assert_eq!(rule_set.len(), 1);
        assert_eq!(rule_set.rules[0].domain, "ads.example.com");
    }

    #[test]
    fn allowlist_comment_produces_allow_rule() {
        let rule_set = parse("# @allowlist good.example.com\n0.0.0.0 ads.example.com\n");
        assert_eq!(rule_set.len(), 2);
        assert!(
            rule_set
                .rules
                .iter()
                .any(|r| r.domain == "good.example.com" && r.action == RuleAction::Allow)
        );
    }

    #[test]
    fn metadata_comment_populates_name() {
        let rule_set = parse("# Title: Example Blocklist\n0.0.0.0 ads.example.com\n");
        assert_eq!(rule_set.name.as_deref(), Some("Example Blocklist"));
    }

    #[test]
    fn inline_comment_is_stripped() {
        let rule_set = parse("0.0.0.0 ads.example.com # tracker\n");
        assert_eq!(rule_set.rules[0].domain, "ads.example.com");
    }

    #[test]
    fn duplicate_domains_are_suppressed_by_default() {
        let rule_set = parse("0.0.0.0 ads.example.com\n0.0.0.0 ads.example.com\n");
        assert_eq!(rule_set.len(), 1);
    }

    #[test]
    fn can_parse_sniffs_sinkhole_ip_prefix() {
        assert!(HostsParser.can_parse(b"0.0.0.0 ads.example.com\n"));
        assert!(!HostsParser.can_parse(b"{\"blocked\":[]}"));
    }
}
