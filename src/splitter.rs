//! Work splitting
//!
//! Turns one batch input into independent, addressable work items. Splitting
//! is pure and deterministic: the same rows always produce the same ids in
//! the same order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Fields of a single input row, substituted into prompt templates
pub type Payload = BTreeMap<String, String>;

/// A single unit of work for the mapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub payload: Payload,
    /// Zero-based position within the batch
    pub ordinal: usize,
    pub total_count: usize,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload: Payload, ordinal: usize, total_count: usize) -> Self {
        Self {
            id: id.into(),
            payload,
            ordinal,
            total_count,
        }
    }

    /// Look up a payload field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).map(String::as_str)
    }
}

/// Rows to be split into work items
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInput {
    pub rows: Vec<Payload>,
    /// Field whose value becomes the item id; ordinal-based ids otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_field: Option<String>,
}

impl BatchInput {
    pub fn new(rows: Vec<Payload>) -> Self {
        Self {
            rows,
            id_field: None,
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    /// Build rows from a JSON array of objects.
    ///
    /// Non-string values are rendered as JSON text; non-object array entries
    /// become a single `value` field.
    pub fn from_json(value: &Value) -> Self {
        let rows = match value {
            Value::Array(items) => items.iter().map(row_from_json).collect(),
            Value::Null => Vec::new(),
            other => vec![row_from_json(other)],
        };
        Self::new(rows)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

fn row_from_json(item: &Value) -> Payload {
    match item {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| (key.clone(), value_to_field(value)))
            .collect(),
        other => Payload::from([("value".to_string(), value_to_field(other))]),
    }
}

fn value_to_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Trait for batch splitters
pub trait Splitter: Send + Sync {
    fn split(&self, input: &BatchInput) -> Vec<WorkItem>;
}

/// One work item per input row
#[derive(Debug, Clone, Copy, Default)]
pub struct RowSplitter;

impl Splitter for RowSplitter {
    fn split(&self, input: &BatchInput) -> Vec<WorkItem> {
        let total = input.rows.len();
        let mut seen: HashMap<String, usize> = HashMap::new();

        input
            .rows
            .iter()
            .enumerate()
            .map(|(ordinal, row)| {
                let base = input
                    .id_field
                    .as_deref()
                    .and_then(|field| row.get(field))
                    .map(|value| value.trim())
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("item-{}", ordinal));

                let count = seen.entry(base.clone()).or_insert(0);
                *count += 1;
                let id = if *count == 1 {
                    base
                } else {
                    format!("{}#{}", base, count)
                };

                WorkItem::new(id, row.clone(), ordinal, total)
            })
            .collect()
    }
}

/// Split with the default row splitter
pub fn split(input: &BatchInput) -> Vec<WorkItem> {
    RowSplitter.split(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_split_is_deterministic() {
        let input = BatchInput::new(vec![
            row(&[("path", "src/a.rs")]),
            row(&[("path", "src/b.rs")]),
            row(&[("path", "src/c.rs")]),
        ])
        .with_id_field("path");

        let first = split(&input);
        let second = split(&input);
        assert_eq!(first, second);

        let ids: Vec<_> = first.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["src/a.rs", "src/b.rs", "src/c.rs"]);
        assert!(first.iter().all(|i| i.total_count == 3));
        assert_eq!(first[2].ordinal, 2);
    }

    #[test]
    fn test_split_empty_input() {
        assert!(split(&BatchInput::default()).is_empty());
    }

    #[test]
    fn test_ordinal_ids_without_id_field() {
        let input = BatchInput::new(vec![row(&[("x", "1")]), row(&[("x", "2")])]);
        let items = split(&input);
        assert_eq!(items[0].id, "item-0");
        assert_eq!(items[1].id, "item-1");
    }

    #[test]
    fn test_duplicate_ids_are_disambiguated() {
        let input = BatchInput::new(vec![
            row(&[("name", "dup")]),
            row(&[("name", "dup")]),
            row(&[("name", "")]),
        ])
        .with_id_field("name");

        let ids: Vec<_> = split(&input).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["dup", "dup#2", "item-2"]);
    }

    #[test]
    fn test_from_json_stringifies_values() {
        let input = BatchInput::from_json(&json!([
            {"title": "A", "score": 3, "tags": ["x"], "done": true},
            "bare"
        ]));

        assert_eq!(input.len(), 2);
        assert_eq!(input.rows[0]["score"], "3");
        assert_eq!(input.rows[0]["tags"], "[\"x\"]");
        assert_eq!(input.rows[0]["done"], "true");
        assert_eq!(input.rows[1]["value"], "bare");
    }
}
