//! Generic array/object JSON rule-set parser.

use crate::error::CoreError;
use crate::formats::{ParseObserver, ParserCapabilities, ParserOptions, RuleSetParser, normalize_domain, validate_domain};
use crate::rules::model::{Rule, RuleAction, RuleSet, RuleSource, RuleType};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashSet;

pub struct StructuredParser;

impl RuleSetParser for StructuredParser {
    fn format_id(&self) -> &'static str {
        "structured"
    }

    fn supported_extensions(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn supported_mimes(&self) -> &'static [&'static str] {
        &["application/json"]
    }

    fn capabilities(&self) -> ParserCapabilities {
        ParserCapabilities {
            supports_metadata: true,
            supports_priority: true,
            supports_expiry: false,
        }
    }

    fn can_parse(&self, bytes: &[u8]) -> bool {
        serde_json::from_slice::<Value>(bytes).is_ok()
    }

    fn parse(
        &self,
        bytes: &[u8],
        options: &ParserOptions,
        observer: &dyn ParseObserver,
    ) -> Result<RuleSet, CoreError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| CoreError::ParseError {
            line_or_field: "<body>".into(),
            message: e.to_string(),
        })?;

        let mut rule_set = RuleSet::new("structured");
        let mut seen: HashSet<(String, &'static str)> = HashSet::new();

        let (blocked, allowed) = match &value {
            Value::Array(items) => (items.as_slice(), &[][..]),
            Value::Object(map) => {
                if let Some(name) = map.get("name").and_then(Value::as_str) {
                    rule_set.name = Some(name.to_string());
                }
                if let Some(version) = map.get("version").and_then(Value::as_str) {
                    rule_set.version = Some(version.to_string());
                }
                let blocked = map.get("blocked").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
                let allowed = ["whitelist", "allowlist", "allowed"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_array))
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                (blocked, allowed)
            }
            _ => {
                return Err(CoreError::ParseError {
                    line_or_field: "<root>".into(),
                    message: "expected a JSON array or object".into(),
                });
            }
        };

        let total = blocked.len() + allowed.len();
        let mut processed = 0usize;

        for item in blocked {
            process_item(item, RuleAction::Block, &mut rule_set, &mut seen, options)?;
            processed += 1;
            report_progress(observer, processed, total, options.batch_size);
            if options.max_rule_count != 0 && rule_set.len() >= options.max_rule_count {
                return Ok(rule_set);
            }
        }
        for item in allowed {
            process_item(item, RuleAction::Allow, &mut rule_set, &mut seen, options)?;
            processed += 1;
            report_progress(observer, processed, total, options.batch_size);
            if options.max_rule_count != 0 && rule_set.len() >= options.max_rule_count {
                return Ok(rule_set);
            }
        }

        observer.on_progress(1.0);
        Ok(rule_set)
    }
}

fn report_progress(observer: &dyn ParseObserver, processed: usize, total: usize, batch_size: usize) {
    if total == 0 {
        return;
    }
    if processed % batch_size.max(1) == 0 {
        observer.on_progress(processed as f64 / total as f64);
    }
}

fn process_item(
    item: &Value,
    default_action: RuleAction,
    rule_set: &mut RuleSet,
    seen: &mut HashSet<(String, &'static str)>,
    options: &ParserOptions,
) -> Result<(), CoreError> {
    let (domain, priority, comment, added, action) = match item {
        Value::String(domain) => (domain.as_str(), None, None, None, default_action),
        Value::Object(map) => {
            let domain = map
                .get("domain")
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::ParseError {
                    line_or_field: "item".into(),
                    message: "missing domain field".into(),
                })?;
            let priority = map.get("priority").and_then(Value::as_i64).map(|v| v as i32);
            let comment = map.get("comment").and_then(Value::as_str).map(str::to_string);
            let added = map
                .get("added")
                .or_else(|| map.get("date"))
                .and_then(parse_timestamp);
            let action = map
                .get("action")
                .and_then(Value::as_str)
                .and_then(RuleAction::parse)
                .unwrap_or(default_action);
            (domain, priority, comment, added, action)
        }
        _ => {
            return Err(CoreError::ParseError {
                line_or_field: "item".into(),
                message: "expected a string or object rule entry".into(),
            });
        }
    };

    let normalized = normalize_domain(domain, options);
    if options.validate_domains && !validate_domain(&normalized) {
        let err = CoreError::ParseError {
            line_or_field: normalized.clone(),
            message: "invalid domain".into(),
        };
        if options.strict_mode {
            return Err(err);
        }
        return Ok(());
    }

    let key = (normalized.clone(), action.as_str());
    if !options.allow_duplicates && !seen.insert(key) {
        return Ok(());
    }

    rule_set.rules.push(Rule {
        domain: normalized.clone(),
        action,
        rule_type: RuleType::infer(&normalized),
        priority: priority.unwrap_or(options.default_priority),
        source: RuleSource::List,
        custom_message: None,
        updated_at: added.unwrap_or_else(Utc::now),
        expires_at: None,
        comment,
    });
    Ok(())
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::NullObserver;

    fn parse(json: &str) -> RuleSet {
        StructuredParser
            .parse(json.as_bytes(), &ParserOptions::default(), &NullObserver)
            .unwrap()
    }

    #[test]
    fn parses_top_level_array_as_blocked() {
        let rule_set = parse(r#"["ads.example.com", "tracker.example.com"]"#);
        assert_eq!(rule_set.len(), 2);
        assert!(rule_set.rules.iter().all(|r| r.action == RuleAction::Block));
    }

    #[test]
    fn parses_object_with_blocked_and_allowlist() {
        let rule_set = parse(
            r#"{"name":"Test List","blocked":["ads.example.com"],"allowlist":["good.example.com"]}"#,
        );
        assert_eq!(rule_set.name.as_deref(), Some("Test List"));
        assert_eq!(rule_set.len(), 2);
        let allow = rule_set.rules.iter().find(|r| r.domain == "good.example.com").unwrap();
        assert_eq!(allow.action, RuleAction::Allow);
    }

    #[test]
    fn object_item_overrides_action_and_priority() {
        let rule_set = parse(
            r#"{"blocked":[{"domain":"ads.example.com","priority":9,"action":"allow"}]}"#,
        );
        assert_eq!(rule_set.rules[0].action, RuleAction::Allow);
        assert_eq!(rule_set.rules[0].priority, 9);
    }

    #[test]
    fn numeric_unix_timestamp_is_parsed() {
        let rule_set = parse(r#"{"blocked":[{"domain":"ads.example.com","added":1700000000}]}"#);
        assert_eq!(rule_set.rules[0].updated_at.timestamp(), 1700000000);
    }

    #[test]
    fn invalid_domain_is_skipped_when_not_strict() {
        let rule_set = parse(r#"["", "ads.example.com"]"#);
        assert_eq!(rule_set.len(), 1);
    }

    #[test]
    fn invalid_domain_errors_in_strict_mode() {
        let mut options = ParserOptions::default();
        options.strict_mode = true;
        let result = StructuredParser.parse(br#"[""]"#, &options, &NullObserver);
        assert!(result.is_err());
    }
}
