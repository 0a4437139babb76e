//! macOS-style property-list rule-set parser (binary or XML), mirroring
//! the generic structured parser's entry shape.

use crate::error::CoreError;
use crate::formats::{ParseObserver, ParserCapabilities, ParserOptions, RuleSetParser, normalize_domain, validate_domain};
use crate::rules::model::{Rule, RuleAction, RuleSet, RuleSource, RuleType};
use chrono::Utc;
use plist::Value;
use std::collections::HashSet;

pub struct PlistParser;

impl RuleSetParser for PlistParser {
    fn format_id(&self) -> &'static str {
        "plist"
    }

    fn supported_extensions(&self) -> &'static [&'static str] {
        &["plist"]
    }

    fn supported_mimes(&self) -> &'static [&'static str] {
        &["application/x-plist"]
    }

    fn capabilities(&self) -> ParserCapabilities {
        ParserCapabilities {
            supports_metadata: true,
            supports_priority: true,
            supports_expiry: false,
        }
    }

    fn can_parse(&self, bytes: &[u8]) -> bool {
        if bytes.starts_with(b"bplist") {
            return true;
        }
        plist::Value::from_reader(std::io::Cursor::new(bytes))
            .ok()
            .and_then(|v| v.into_dictionary())
            .is_some_and(|d| d.contains_key("blocked") || d.contains_key("whitelist"))
    }

    fn parse(
        &self,
        bytes: &[u8],
        options: &ParserOptions,
        observer: &dyn ParseObserver,
    ) -> Result<RuleSet, CoreError> {
        let value = Value::from_reader(std::io::Cursor::new(bytes)).map_err(|e| CoreError::ParseError {
            line_or_field: "<body>".into(),
            message: e.to_string(),
        })?;

        let dict = value.into_dictionary().ok_or_else(|| CoreError::ParseError {
            line_or_field: "<root>".into(),
            message: "root plist value must be a dictionary".into(),
        })?;

        if !dict.contains_key("blocked") && !dict.contains_key("whitelist") {
            return Err(CoreError::ParseError {
                line_or_field: "<root>".into(),
                message: "dictionary must contain 'blocked' or 'whitelist'".into(),
            });
        }

        let mut rule_set = RuleSet::new("plist");
        if let Some(name) = dict.get("name").and_then(Value::as_string) {
            rule_set.name = Some(name.to_string());
        }
        if let Some(version) = dict.get("version").and_then(Value::as_string) {
            rule_set.version = Some(version.to_string());
        }

        let mut seen: HashSet<(String, &'static str)> = HashSet::new();
        let empty = Vec::new();

        let blocked = dict.get("blocked").and_then(Value::as_array).unwrap_or(&empty);
        let whitelist = dict.get("whitelist").and_then(Value::as_array).unwrap_or(&empty);

        let total = blocked.len() + whitelist.len();
        let mut processed = 0usize;

        for item in blocked {
            process_item(item, RuleAction::Block, &mut rule_set, &mut seen, options)?;
            processed += 1;
            report_progress(observer, processed, total, options.batch_size);
        }
        for item in whitelist {
            process_item(item, RuleAction::Allow, &mut rule_set, &mut seen, options)?;
            processed += 1;
            report_progress(observer, processed, total, options.batch_size);
        }

        observer.on_progress(1.0);
        Ok(rule_set)
    }
}

fn report_progress(observer: &dyn ParseObserver, processed: usize, total: usize, batch_size: usize) {
    if total != 0 && processed % batch_size.max(1) == 0 {
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
    let (domain, priority, comment, action) = if let Some(domain) = item.as_string() {
        (domain, None, None, default_action)
    } else if let Some(dict) = item.as_dictionary() {
        let domain = dict
            .get("domain")
            .and_then(Value::as_string)
            .ok_or_else(|| CoreError::ParseError {
                line_or_field: "item".into(),
                message: "missing domain key".into(),
            })?;
        let priority = dict.get("priority").and_then(Value::as_signed_integer).map(|v| v as i32);
        let comment = dict.get("comment").and_then(Value::as_string).map(str::to_string);
        let action = dict
            .get("action")
            .and_then(Value::as_string)
            .and_then(RuleAction::parse)
            .unwrap_or(default_action);
        (domain, priority, comment, action)
    } else {
        return Err(CoreError::ParseError {
            line_or_field: "item".into(),
            message: "expected a string or dictionary rule entry".into(),
        });
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
        updated_at: Utc::now(),
        expires_at: None,
        comment,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::NullObserver;

    fn xml_plist(body: &str) -> Vec<u8> {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
             <plist version=\"1.0\">{body}</plist>"
        )
        .into_bytes()
    }

    #[test]
    fn parses_dictionary_with_blocked_and_whitelist() {
        let bytes = xml_plist(
            "<dict><key>blocked</key><array><string>ads.example.com</string></array>\
             <key>whitelist</key><array><string>good.example.com</string></array></dict>",
        );
        let rule_set = PlistParser.parse(&bytes, &ParserOptions::default(), &NullObserver).unwrap();
        assert_eq!(rule_set.len(), 2);
    }

    #[test]
    fn rejects_dictionary_without_required_keys() {
        let bytes = xml_plist("<dict><key>name</key><string>x</string></dict>");
        let result = PlistParser.parse(&bytes, &ParserOptions::default(), &NullObserver);
        assert!(result.is_err());
    }

    #[test]
    fn entry_dictionary_overrides_priority_and_action() {
        let bytes = xml_plist(
            "<dict><key>blocked</key><array>\
               <dict><key>domain</key><string>ads.example.com</string>\
                      <key>priority</key><integer>7</integer>\
                      <key>action</key><string>allow</string></dict>\
             </array></dict>",
        );
        let rule_set = PlistParser.parse(&bytes, &ParserOptions::default(), &NullObserver).unwrap();
        assert_eq!(rule_set.rules[0].priority, 7);
        assert_eq!(rule_set.rules[0].action, RuleAction::Allow);
    }
}
