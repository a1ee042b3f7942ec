//! Response interpretation
//!
//! Model replies are not guaranteed to be well-formed. This module turns raw
//! reply text into the fields a caller declared, in stages:
//!
//! 1. Markdown-fenced `json`/`javascript`/`js`/bare blocks
//! 2. Balanced `{...}` / `[...]` regions, earliest bracket kind first
//! 3. `key: value` / `key = value` lines
//! 4. Per-field natural-language patterns (`field is value`, ...)
//!
//! Malformed JSON (single quotes, unquoted keys, trailing commas) is repaired
//! before a second parse attempt.

mod extract;
mod fields;
mod repair;

pub use extract::{locate, Candidate, Origin};
pub use fields::{coerce_value, extract_from_text, lookup, parse_fields};
pub use repair::{parse_lenient, repair_json};

use crate::error::InterpretError;
use serde_json::{Map, Value};
use tracing::trace;

/// Extract the most plausible structured snippet from a reply
pub fn extract_structure(text: &str) -> Option<String> {
    locate(text).map(|candidate| candidate.text)
}

/// Interpret a reply into the declared fields.
///
/// Values from genuine JSON keep their JSON types; values recovered from
/// `key: value` lines or natural language are coerced. Declared fields that
/// cannot be found are set to `null`, unless none is found at all.
pub fn interpret(text: &str, declared: &[String]) -> Result<Map<String, Value>, InterpretError> {
    let structural_error = match locate(text) {
        Some(candidate) => match parse_fields(&candidate.text, declared) {
            Ok(mut found) => {
                if candidate.origin == Origin::KeyValueLines {
                    coerce_strings(&mut found);
                }
                fill_missing(text, declared, &mut found);
                return Ok(found);
            }
            Err(err @ (InterpretError::ArrayResult | InterpretError::NotAnObject(_))) => {
                return Err(err)
            }
            Err(err) => {
                trace!("Structured candidate rejected ({}), trying text patterns", err);
                Some(err)
            }
        },
        None => None,
    };

    let mut found = Map::new();
    for name in declared {
        if let Some(value) = extract_from_text(text, name) {
            found.insert(name.clone(), value);
        }
    }

    if found.is_empty() {
        return Err(structural_error.unwrap_or(InterpretError::NoStructure));
    }

    fill_missing(text, declared, &mut found);
    Ok(found)
}

fn coerce_strings(fields: &mut Map<String, Value>) {
    for value in fields.values_mut() {
        if let Value::String(raw) = value {
            *value = coerce_value(raw);
        }
    }
}

fn fill_missing(text: &str, declared: &[String], found: &mut Map<String, Value>) {
    for name in declared {
        if !found.contains_key(name) {
            let value = extract_from_text(text, name).unwrap_or(Value::Null);
            found.insert(name.clone(), value);
        }
    }
}
