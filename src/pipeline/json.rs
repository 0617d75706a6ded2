//! Parsing of structured model output.
//!
//! Model replies are untrusted: they may be wrapped in markdown fences, be
//! prose, or only partially match the expected shape. Every stage parses
//! into `Parsed<T>` and picks its own fallback.

use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Parsed(T),
    Fallback(String),
}

impl<T> Parsed<T> {
    pub fn or_else(self, fallback: impl FnOnce(&str) -> T) -> T {
        match self {
            Parsed::Parsed(v) => v,
            Parsed::Fallback(reason) => fallback(&reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Parsed<U> {
        match self {
            Parsed::Parsed(v) => Parsed::Parsed(f(v)),
            Parsed::Fallback(reason) => Parsed::Fallback(reason),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Parsed::Fallback(_))
    }
}

/// Removes a surrounding ```` ```json ```` / ```` ``` ```` fence.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) on the opening line.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// First balanced-looking JSON object or array embedded in prose.
fn embedded_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse<T: DeserializeOwned>(raw: &str) -> Parsed<T> {
    let body = strip_fences(raw);
    if body.is_empty() {
        return Parsed::Fallback("empty response".into());
    }
    match serde_json::from_str(body) {
        Ok(v) => Parsed::Parsed(v),
        Err(first) => match embedded_json(body).map(serde_json::from_str) {
            Some(Ok(v)) => Parsed::Parsed(v),
            _ => Parsed::Fallback(first.to_string()),
        },
    }
}

/// Pulls a named array out of `{"key": [...]}`, or accepts a bare array.
pub fn array_field(value: serde_json::Value, key: &str) -> Option<Vec<serde_json::Value>> {
    match value {
        serde_json::Value::Array(items) => Some(items),
        serde_json::Value::Object(mut map) => match map.remove(key)? {
            serde_json::Value::Array(items) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// Trimmed, non-empty string field.
pub fn str_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn strips_language_tagged_fence() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n[1]\n```  "), "[1]");
        assert_eq!(strip_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn parses_json_inside_prose() {
        let parsed: Parsed<Value> =
            parse("Sure! Here you go: {\"category\": \"travel\"} Hope it helps.");
        assert_eq!(parsed, Parsed::Parsed(json!({"category": "travel"})));
    }

    #[test]
    fn garbage_falls_back_with_reason() {
        let parsed: Parsed<Value> = parse("not-json");
        assert!(parsed.is_fallback());
        let parsed: Parsed<Value> = parse("   ");
        assert_eq!(parsed, Parsed::Fallback("empty response".into()));
    }

    #[test]
    fn array_field_accepts_wrapped_or_bare() {
        assert_eq!(array_field(json!({"plan": [1, 2]}), "plan").unwrap().len(), 2);
        assert_eq!(array_field(json!([1]), "plan").unwrap().len(), 1);
        assert!(array_field(json!({"plan": "x"}), "plan").is_none());
        assert!(array_field(json!("x"), "plan").is_none());
    }

    #[test]
    fn str_field_rejects_blank() {
        let v = json!({"a": "  x ", "b": "  ", "c": 3});
        assert_eq!(str_field(&v, "a").as_deref(), Some("x"));
        assert!(str_field(&v, "b").is_none());
        assert!(str_field(&v, "c").is_none());
    }
}
