//! Hand-written recursive-descent predicate grammar: comparisons, logical
//! `AND`/`OR`/`NOT`, `IN`, and string `CONTAINS`/`BEGINSWITH`/`ENDSWITH`/
//! `LIKE`/`MATCHES`, plus sugar functions rewritten into core operators
//! before evaluation.

use crate::error::CoreError;
use chrono::{NaiveTime, Weekday};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// The flat evaluation context a predicate is checked against.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub os_version: Option<String>,
    pub device_type: Option<String>,
    pub device_model: Option<String>,
    pub network_location: Option<String>,
    pub network_ssid: Option<String>,
    pub vpn_connected: bool,
    pub vpn_identifier: Option<String>,
    pub current_date: chrono::NaiveDate,
    pub time_of_day: NaiveTime,
    pub day_of_week: Weekday,
    pub is_weekend: bool,
    pub user_group: Option<String>,
    pub device_identifier: Option<String>,
    pub security_score: Option<f64>,
    pub custom: HashMap<String, Value>,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self {
            os_version: None,
            device_type: None,
            device_model: None,
            network_location: None,
            network_ssid: None,
            vpn_connected: false,
            vpn_identifier: None,
            current_date: Default::default(),
            time_of_day: Default::default(),
            day_of_week: Weekday::Mon,
            is_weekend: false,
            user_group: None,
            device_identifier: None,
            security_score: None,
            custom: Default::default(),
        }
    }
}

impl EvaluationContext {
    fn lookup(&self, field: &str) -> Option<Value> {
        match field {
            "os_version" => self.os_version.clone().map(Value::String),
            "device_type" => self.device_type.clone().map(Value::String),
            "device_model" => self.device_model.clone().map(Value::String),
            "network_location" => self.network_location.clone().map(Value::String),
            "network_ssid" => self.network_ssid.clone().map(Value::String),
            "vpn_connected" => Some(Value::Bool(self.vpn_connected)),
            "vpn_identifier" => self.vpn_identifier.clone().map(Value::String),
            "day_of_week" => Some(Value::String(weekday_name(self.day_of_week).to_string())),
            "is_weekend" => Some(Value::Bool(self.is_weekend)),
            "user_group" => self.user_group.clone().map(Value::String),
            "device_identifier" => self.device_identifier.clone().map(Value::String),
            "security_score" => self.security_score.and_then(Value::from_f64_opt),
            "time_of_day" => Some(Value::String(self.time_of_day.format("%H:%M").to_string())),
            other => self.custom.get(other).cloned(),
        }
    }
}

trait FromF64Opt {
    fn from_f64_opt(v: f64) -> Option<Value>;
}
impl FromF64Opt for Value {
    fn from_f64_opt(v: f64) -> Option<Value> {
        serde_json::Number::from_f64(v).map(Value::Number)
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Comma,
    Op(String),
    And,
    Or,
    Not,
    In,
    End,
}

fn tokenize(input: &str) -> Result<Vec<Token>, CoreError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(CoreError::ManifestInvalidCondition("unterminated string literal".into()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("!=".into()));
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("==".into()));
                i += 2;
            }
            '=' => {
                tokens.push(Token::Op("==".into()));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(">=".into()));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(">".into()));
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("<=".into()));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op("<".into()));
                i += 1;
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| CoreError::ManifestInvalidCondition(format!("bad number literal: {text}")))?;
                tokens.push(Token::Num(num));
            }
            _ if c.is_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IN" => Token::In,
                    "TRUE" => Token::Ident("true".into()),
                    "FALSE" => Token::Ident("false".into()),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(CoreError::ManifestInvalidCondition(format!("unexpected character '{other}'"))),
        }
    }
    tokens.push(Token::End);
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        field: String,
        op: String,
        value: Literal,
    },
    In {
        field: String,
        values: Vec<Literal>,
    },
    StringFn {
        field: String,
        func: String,
        arg: String,
    },
    Bool(bool),
}

#[derive(Debug, Clone)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CoreError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(CoreError::ManifestInvalidCondition(format!("expected {expected:?}, found {:?}", self.peek())))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        if matches!(self.peek(), Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        match self.peek().clone() {
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::Ident(name) if name == "true" || name == "false" => {
                self.advance();
                Ok(Expr::Bool(name == "true"))
            }
            Token::Ident(name) => {
                self.advance();
                if matches!(self.peek(), Token::LParen) {
                    return self.parse_call(name);
                }
                self.parse_comparison(name)
            }
            other => Err(CoreError::ManifestInvalidCondition(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_call(&mut self, func: String) -> Result<Expr, CoreError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            loop {
                args.push(self.parse_literal()?);
                if matches!(self.peek(), Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        desugar_call(&func, args)
    }

    fn parse_literal(&mut self) -> Result<Literal, CoreError> {
        match self.advance() {
            Token::Str(s) => Ok(Literal::Str(s)),
            Token::Num(n) => Ok(Literal::Num(n)),
            Token::Ident(name) if name == "true" || name == "false" => Ok(Literal::Bool(name == "true")),
            Token::Ident(name) => Ok(Literal::Str(name)),
            other => Err(CoreError::ManifestInvalidCondition(format!("expected literal, found {other:?}"))),
        }
    }

    fn parse_comparison(&mut self, field: String) -> Result<Expr, CoreError> {
        match self.peek().clone() {
            Token::Op(op) => {
                self.advance();
                let value = self.parse_literal()?;
                Ok(Expr::Compare { field, op, value })
            }
            Token::In => {
                self.advance();
                self.expect(&Token::LParen)?;
                let mut values = Vec::new();
                loop {
                    values.push(self.parse_literal()?);
                    if matches!(self.peek(), Token::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(&Token::RParen)?;
                Ok(Expr::In { field, values })
            }
            Token::Ident(word) if is_string_fn(&word) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let arg = match self.parse_literal()? {
                    Literal::Str(s) => s,
                    Literal::Num(n) => n.to_string(),
                    Literal::Bool(b) => b.to_string(),
                };
                self.expect(&Token::RParen)?;
                Ok(Expr::StringFn {
                    field,
                    func: word.to_ascii_uppercase(),
                    arg,
                })
            }
            other => Err(CoreError::ManifestInvalidCondition(format!(
                "expected comparison operator after field '{field}', found {other:?}"
            ))),
        }
    }
}

fn is_string_fn(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "CONTAINS" | "BEGINSWITH" | "ENDSWITH" | "LIKE" | "MATCHES"
    )
}

/// Rewrites sugar functions (`is_business_hours()`, `is_weekday()`,
/// `time_between(field, start, end)`) into core comparison operators.
fn desugar_call(func: &str, args: Vec<Literal>) -> Result<Expr, CoreError> {
    match func {
        "is_weekday" => Ok(Expr::Not(Box::new(Expr::Compare {
            field: "is_weekend".into(),
            op: "==".into(),
            value: Literal::Bool(true),
        }))),
        "is_business_hours" => Ok(Expr::And(
            Box::new(Expr::Not(Box::new(Expr::Compare {
                field: "is_weekend".into(),
                op: "==".into(),
                value: Literal::Bool(true),
            }))),
            Box::new(time_between_expr("time_of_day", "09:00", "17:00")),
        )),
        "time_between" => {
            if args.len() != 3 {
                return Err(CoreError::ManifestInvalidCondition("time_between expects 3 arguments".into()));
            }
            let field = literal_as_str(&args[0]);
            let start = literal_as_str(&args[1]);
            let end = literal_as_str(&args[2]);
            Ok(time_between_expr(&field, &start, &end))
        }
        other => Err(CoreError::ManifestInvalidCondition(format!("unknown predicate function '{other}'"))),
    }
}

fn literal_as_str(lit: &Literal) -> String {
    match lit {
        Literal::Str(s) => s.clone(),
        Literal::Num(n) => n.to_string(),
        Literal::Bool(b) => b.to_string(),
    }
}

fn time_between_expr(field: &str, start: &str, end: &str) -> Expr {
    Expr::And(
        Box::new(Expr::Compare {
            field: field.to_string(),
            op: ">=".into(),
            value: Literal::Str(start.to_string()),
        }),
        Box::new(Expr::Compare {
            field: field.to_string(),
            op: "<=".into(),
            value: Literal::Str(end.to_string()),
        }),
    )
}

/// A parsed, reusable predicate. An empty source string always evaluates
/// to true.
pub struct Predicate {
    expr: Option<Expr>,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, CoreError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Ok(Self { expr: None });
        }
        let tokens = tokenize(trimmed)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if !matches!(parser.peek(), Token::End) {
            return Err(CoreError::ManifestInvalidCondition(format!(
                "trailing tokens after predicate: {:?}",
                parser.peek()
            )));
        }
        Ok(Self { expr: Some(expr) })
    }

    /// Evaluates against `ctx`. Evaluation errors are swallowed and demote
    /// the predicate to `false`, with the error returned for the caller
    /// to record as a warning.
    pub fn evaluate(&self, ctx: &EvaluationContext) -> (bool, Option<String>) {
        match &self.expr {
            None => (true, None),
            Some(expr) => match eval(expr, ctx) {
                Ok(result) => (result, None),
                Err(err) => (false, Some(err.to_string())),
            },
        }
    }
}

fn eval(expr: &Expr, ctx: &EvaluationContext) -> Result<bool, CoreError> {
    match expr {
        Expr::Bool(b) => Ok(*b),
        Expr::And(a, b) => Ok(eval(a, ctx)? && eval(b, ctx)?),
        Expr::Or(a, b) => Ok(eval(a, ctx)? || eval(b, ctx)?),
        Expr::Not(a) => Ok(!eval(a, ctx)?),
        Expr::Compare { field, op, value } => eval_compare(field, op, value, ctx),
        Expr::In { field, values } => {
            let actual = ctx.lookup(field);
            Ok(values.iter().any(|v| literal_matches(&actual, v)))
        }
        Expr::StringFn { field, func, arg } => eval_string_fn(field, func, arg, ctx),
    }
}

fn literal_matches(actual: &Option<Value>, expected: &Literal) -> bool {
    match (actual, expected) {
        (Some(Value::String(s)), Literal::Str(e)) => s == e,
        (Some(Value::Number(n)), Literal::Num(e)) => n.as_f64().is_some_and(|v| (v - e).abs() < f64::EPSILON),
        (Some(Value::Bool(b)), Literal::Bool(e)) => b == e,
        _ => false,
    }
}

fn eval_compare(field: &str, op: &str, value: &Literal, ctx: &EvaluationContext) -> Result<bool, CoreError> {
    let actual = ctx.lookup(field);
    match (op, &actual, value) {
        ("==", actual, value) => Ok(literal_matches(actual, value)),
        ("!=", actual, value) => Ok(!literal_matches(actual, value)),
        (">" | ">=" | "<" | "<=", Some(Value::Number(n)), Literal::Num(expected)) => {
            let n = n.as_f64().unwrap_or(f64::NAN);
            Ok(match op {
                ">" => n > *expected,
                ">=" => n >= *expected,
                "<" => n < *expected,
                "<=" => n <= *expected,
                _ => unreachable!(),
            })
        }
        (">" | ">=" | "<" | "<=", Some(Value::String(s)), Literal::Str(expected)) => Ok(match op {
            ">" => s.as_str() > expected.as_str(),
            ">=" => s.as_str() >= expected.as_str(),
            "<" => s.as_str() < expected.as_str(),
            "<=" => s.as_str() <= expected.as_str(),
            _ => unreachable!(),
        }),
        (">" | ">=" | "<" | "<=", None, _) => Ok(false),
        _ => Err(CoreError::ManifestInvalidCondition(format!(
            "type mismatch comparing field '{field}' with operator '{op}'"
        ))),
    }
}

fn eval_string_fn(field: &str, func: &str, arg: &str, ctx: &EvaluationContext) -> Result<bool, CoreError> {
    let actual = match ctx.lookup(field) {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => return Ok(false),
    };
    Ok(match func {
        "CONTAINS" => actual.contains(arg),
        "BEGINSWITH" => actual.starts_with(arg),
        "ENDSWITH" => actual.ends_with(arg),
        "LIKE" => like_match(&actual, arg),
        "MATCHES" => Regex::new(arg)
            .map_err(|e| CoreError::ManifestInvalidCondition(format!("bad regex in MATCHES: {e}")))?
            .is_match(&actual),
        other => return Err(CoreError::ManifestInvalidCondition(format!("unknown string function {other}"))),
    })
}

/// `%` wildcard glob, case-sensitive, anchored at both ends.
fn like_match(haystack: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return haystack == pattern;
    }
    let mut rest = haystack;
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if idx == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if idx == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(at) = rest.find(part) {
            rest = &rest[at + part.len()..];
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_ctx() -> EvaluationContext {
        EvaluationContext {
            os_version: Some("17.1".into()),
            device_type: Some("phone".into()),
            vpn_connected: true,
            is_weekend: false,
            day_of_week: Weekday::Wed,
            current_date: chrono::NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            time_of_day: NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_predicate_is_true() {
        let pred = Predicate::parse("").unwrap();
        assert_eq!(pred.evaluate(&base_ctx()), (true, None));
    }

    #[test]
    fn simple_equality() {
        let pred = Predicate::parse("device_type == \"phone\"").unwrap();
        assert_eq!(pred.evaluate(&base_ctx()).0, true);
    }

    #[test]
    fn and_or_not_compose() {
        let pred = Predicate::parse("vpn_connected == true AND NOT (device_type == \"desktop\")").unwrap();
        assert!(pred.evaluate(&base_ctx()).0);
    }

    #[test]
    fn in_operator() {
        let pred = Predicate::parse("device_type IN (\"phone\", \"tablet\")").unwrap();
        assert!(pred.evaluate(&base_ctx()).0);
    }

    #[test]
    fn string_functions() {
        let pred = Predicate::parse("os_version BEGINSWITH \"17\"").unwrap();
        assert!(pred.evaluate(&base_ctx()).0);
        let pred = Predicate::parse("network_ssid CONTAINS \"guest\"").unwrap();
        assert!(!pred.evaluate(&base_ctx()).0);
    }

    #[test]
    fn is_weekday_sugar() {
        let pred = Predicate::parse("is_weekday()").unwrap();
        assert!(pred.evaluate(&base_ctx()).0);
    }

    #[test]
    fn time_between_sugar() {
        let pred = Predicate::parse("time_between(time_of_day, \"09:00\", \"17:00\")").unwrap();
        assert!(pred.evaluate(&base_ctx()).0);
    }

    #[test]
    fn unknown_field_demotes_to_false_not_panic() {
        let pred = Predicate::parse("security_score > 50").unwrap();
        let (result, warning) = pred.evaluate(&base_ctx());
        assert!(!result);
        assert!(warning.is_none());
    }

    #[test]
    fn invalid_syntax_is_reported_at_parse_time() {
        assert!(Predicate::parse("device_type ==").is_err());
    }
}
