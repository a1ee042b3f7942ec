//! Targeted repairs for almost-JSON model output

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'((?:[^'\\]|\\.)*)'").expect("Invalid regex pattern"));
static UNQUOTED_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$\-]*)\s*:"#).expect("Invalid regex pattern")
});
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("Invalid regex pattern"));
static PYTHON_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([:\[,]\s*)(True|False|None)\b").expect("Invalid regex pattern")
});

/// Rewrite single quotes, unquoted keys and trailing commas
pub fn repair_json(candidate: &str) -> String {
    let mut repaired = candidate.trim().to_string();

    // Apostrophes inside double-quoted text must survive
    if !repaired.contains('"') {
        repaired = SINGLE_QUOTED
            .replace_all(&repaired, |cap: &Captures| {
                format!("\"{}\"", cap[1].replace("\\'", "'").replace('"', "\\\""))
            })
            .into_owned();
    }

    repaired = UNQUOTED_KEY
        .replace_all(&repaired, "$1\"$2\":")
        .into_owned();
    repaired = TRAILING_COMMA.replace_all(&repaired, "$1").into_owned();
    repaired = PYTHON_LITERAL
        .replace_all(&repaired, |cap: &Captures| {
            let literal = match &cap[2] {
                "True" => "true",
                "False" => "false",
                _ => "null",
            };
            format!("{}{}", &cap[1], literal)
        })
        .into_owned();

    repaired
}

/// Parse as JSON, retrying once after [`repair_json`].
///
/// On failure the error of the original (unrepaired) parse is returned.
pub fn parse_lenient(candidate: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value) => Ok(value),
        Err(original) => {
            let repaired = repair_json(candidate);
            serde_json::from_str::<Value>(&repaired).map_err(|_| original.to_string())
        }
    }
}
