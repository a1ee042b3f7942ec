//! Prompt templates with `{{name}}` placeholders
//!
//! Reserved names are bound by the engine and always take precedence over
//! item payload fields, even when a payload carries a field of the same name.

use crate::error::TemplateError;
use crate::splitter::WorkItem;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("Invalid regex pattern")
});

pub const ITEMS: &str = "ITEMS";
pub const RESULTS: &str = "RESULTS";
pub const RESULTS_FILE: &str = "RESULTS_FILE";
pub const COUNT: &str = "COUNT";
pub const SUCCESS_COUNT: &str = "SUCCESS_COUNT";
pub const FAILURE_COUNT: &str = "FAILURE_COUNT";

/// Placeholder names resolved by the engine
pub const RESERVED_NAMES: [&str; 6] = [
    ITEMS,
    RESULTS,
    RESULTS_FILE,
    COUNT,
    SUCCESS_COUNT,
    FAILURE_COUNT,
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Values bound to reserved names for one render
pub type ReservedValues = BTreeMap<&'static str, String>;

/// A prompt string with `{{name}}` placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptTemplate {
    source: String,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// All placeholder names in order of first appearance
    pub fn placeholders(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        PLACEHOLDER_PATTERN
            .captures_iter(&self.source)
            .map(|cap| cap[1].to_string())
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Payload fields an item must carry, enumerated before execution
    pub fn required_fields(&self) -> Vec<String> {
        self.placeholders()
            .into_iter()
            .filter(|name| !is_reserved(name))
            .collect()
    }

    /// Required fields absent from an item's payload
    pub fn missing_fields(&self, item: &WorkItem) -> Vec<String> {
        self.required_fields()
            .into_iter()
            .filter(|field| !item.payload.contains_key(field))
            .collect()
    }

    /// Render for a work item.
    ///
    /// Reserved names resolve from `reserved`; reserved names without a bound
    /// value are left verbatim. Unknown payload names become empty strings,
    /// or a [`TemplateError::MissingField`] in strict mode.
    pub fn render(
        &self,
        item: &WorkItem,
        reserved: &ReservedValues,
        strict: bool,
    ) -> Result<String, TemplateError> {
        if strict {
            if let Some(field) = self.missing_fields(item).into_iter().next() {
                return Err(TemplateError::MissingField {
                    item_id: item.id.clone(),
                    field,
                });
            }
        }

        let rendered = PLACEHOLDER_PATTERN.replace_all(&self.source, |cap: &Captures| {
            let name = &cap[1];
            if is_reserved(name) {
                return reserved
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| cap[0].to_string());
            }
            item.payload.get(name).cloned().unwrap_or_default()
        });

        Ok(rendered.into_owned())
    }
}

impl From<&str> for PromptTemplate {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PromptTemplate {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Replace every occurrence of `{{name}}` with `value`
pub fn substitute_all(text: &str, name: &str, value: &str) -> String {
    text.replace(&format!("{{{{{}}}}}", name), value)
}
