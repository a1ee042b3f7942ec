//! Declared-field parsing, natural-language fallback and value coercion

use super::repair::parse_lenient;
use crate::error::InterpretError;
use regex::Regex;
use serde_json::{Map, Number, Value};

/// Parse a candidate into the declared fields.
///
/// Keys are matched case-insensitively and returned under the declared
/// spelling. Declared fields absent from the structure are omitted; when
/// none are present the call fails. An empty declaration returns the whole
/// object.
pub fn parse_fields(
    candidate: &str,
    declared: &[String],
) -> Result<Map<String, Value>, InterpretError> {
    let value = parse_lenient(candidate).map_err(InterpretError::Malformed)?;
    let object = reconcile(value)?;

    if declared.is_empty() {
        return Ok(object);
    }

    let mut fields = Map::new();
    for name in declared {
        if let Some(value) = lookup(&object, name) {
            fields.insert(name.clone(), value.clone());
        }
    }

    if fields.is_empty() {
        return Err(InterpretError::FieldsNotFound(declared.to_vec()));
    }
    Ok(fields)
}

/// Case-insensitive key lookup, exact match first
pub fn lookup<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object.get(name).or_else(|| {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

/// Turn a top-level JSON value into an object
fn reconcile(value: Value) -> Result<Map<String, Value>, InterpretError> {
    match value {
        Value::Object(object) => Ok(object),
        Value::Array(mut items) => {
            if items.len() == 1 && items[0].is_object() {
                if let Some(Value::Object(object)) = items.pop() {
                    return Ok(object);
                }
            }
            rebuild_from_pairs(&items).ok_or(InterpretError::ArrayResult)
        }
        other => Err(InterpretError::NotAnObject(type_name(&other).to_string())),
    }
}

/// `[{"field": "a", "value": 1}, {"key": "b", "value": 2}]` → `{"a": 1, "b": 2}`
fn rebuild_from_pairs(items: &[Value]) -> Option<Map<String, Value>> {
    if items.is_empty() {
        return None;
    }

    let mut object = Map::new();
    for item in items {
        let pair = item.as_object()?;
        let name = lookup(pair, "field")
            .or_else(|| lookup(pair, "key"))?
            .as_str()?;
        let value = lookup(pair, "value")?;
        object.insert(name.to_string(), value.clone());
    }
    Some(object)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Find a field value stated in natural language.
///
/// Tries, in order: `field: "value"`, `**field**: value`, `field: value` at
/// line start, and `field is value`. Underscores in the field name also match
/// spaces.
pub fn extract_from_text(text: &str, field: &str) -> Option<Value> {
    let name = regex::escape(field).replace('_', "[_ ]");
    let patterns = [
        format!(r#"(?im)["']?\b{name}\b["']?\s*[:=]\s*"([^"\n]*)""#),
        format!(r"(?im)\*\*\s*{name}\s*:?\s*\*\*\s*[:=]?\s*(.+?)\s*$"),
        format!(r"(?im)^[\s\-*>#]*{name}\s*[:=]\s*(.+?)\s*$"),
        format!(r#"(?i)\b{name}\s+is\s+["']?([^\n.,;"']+)"#),
    ];

    patterns.iter().find_map(|pattern| {
        let regex = Regex::new(pattern).ok()?;
        regex
            .captures(text)
            .and_then(|cap| cap.get(1))
            .map(|m| coerce_value(m.as_str()))
    })
}

/// Coerce a loosely-typed string into a JSON value
pub fn coerce_value(raw: &str) -> Value {
    let trimmed = strip_quotes(raw.trim().trim_end_matches(','));

    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "yes" => return Value::Bool(true),
        "false" | "no" => return Value::Bool(false),
        "null" | "none" | "n/a" | "" => return Value::Null,
        _ => {}
    }

    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    Value::String(trimmed.to_string())
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\'', '`'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let parsed = parse_fields(r#"{"Summary": "ok", "RISK": 3}"#, &fields(&["summary", "risk"]))
            .unwrap();
        assert_eq!(parsed["summary"], json!("ok"));
        assert_eq!(parsed["risk"], json!(3));
    }

    #[test]
    fn test_single_element_array_is_unwrapped() {
        let parsed = parse_fields(r#"[{"a": 1}]"#, &fields(&["a"])).unwrap();
        assert_eq!(parsed["a"], json!(1));
    }

    #[test]
    fn test_pair_array_is_rebuilt() {
        let parsed = parse_fields(
            r#"[{"field": "a", "value": 1}, {"key": "b", "value": "x"}]"#,
            &fields(&["a", "b"]),
        )
        .unwrap();
        assert_eq!(parsed["a"], json!(1));
        assert_eq!(parsed["b"], json!("x"));
    }

    #[test]
    fn test_other_arrays_are_rejected() {
        assert_eq!(
            parse_fields("[1, 2, 3]", &fields(&["a"])).unwrap_err(),
            InterpretError::ArrayResult
        );
    }

    #[test]
    fn test_missing_fields_reported() {
        assert_eq!(
            parse_fields(r#"{"other": 1}"#, &fields(&["a"])).unwrap_err(),
            InterpretError::FieldsNotFound(fields(&["a"]))
        );
    }

    #[test]
    fn test_natural_language_extraction() {
        let text = "Here is my analysis.\n**Risk level**: high\nsummary: \"tidy module\"\nThe score is 7.";
        assert_eq!(extract_from_text(text, "summary"), Some(json!("tidy module")));
        assert_eq!(extract_from_text(text, "risk_level"), Some(json!("high")));
        assert_eq!(extract_from_text(text, "score"), Some(json!(7)));
        assert_eq!(extract_from_text(text, "missing"), None);
    }

    #[test]
    fn test_coercion() {
        assert_eq!(coerce_value("Yes"), json!(true));
        assert_eq!(coerce_value("no"), json!(false));
        assert_eq!(coerce_value("N/A"), Value::Null);
        assert_eq!(coerce_value("  "), Value::Null);
        assert_eq!(coerce_value("42"), json!(42));
        assert_eq!(coerce_value("2.5"), json!(2.5));
        assert_eq!(coerce_value("\"quoted\""), json!("quoted"));
        assert_eq!(coerce_value("plain text"), json!("plain text"));
    }
}
