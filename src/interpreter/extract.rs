//! Locating structured data inside free-form model replies

use super::repair::parse_lenient;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static FENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*(?:json|javascript|js)?[ \t]*\r?\n?(.*?)```")
        .expect("Invalid regex pattern")
});
static KEY_VALUE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:[-*]\s+)?["']?([A-Za-z_][A-Za-z0-9_\-]*)["']?\s*[:=]\s*(.*?)\s*$"#)
        .expect("Invalid regex pattern")
});

/// Where a structured candidate was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Fence,
    Brackets,
    /// Synthesised from `key: value` lines; every value is a string
    KeyValueLines,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub text: String,
    pub origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bracket {
    Object,
    Array,
}

impl Bracket {
    fn open(self) -> u8 {
        match self {
            Bracket::Object => b'{',
            Bracket::Array => b'[',
        }
    }

    fn close(self) -> u8 {
        match self {
            Bracket::Object => b'}',
            Bracket::Array => b']',
        }
    }

    /// Objects must contain a `:` so array-ish literals in braces are rejected
    fn plausible(self, candidate: &str) -> bool {
        match self {
            Bracket::Object => candidate.contains(':'),
            Bracket::Array => true,
        }
    }
}

enum Scan {
    Parsed(String),
    Unparsed(String),
    Nothing,
}

/// Find the most plausible structured snippet in `text`
pub fn locate(text: &str) -> Option<Candidate> {
    if let Some(fenced) = fenced_block(text) {
        return Some(Candidate {
            text: fenced,
            origin: Origin::Fence,
        });
    }

    if let Some(bracketed) = bracketed(text) {
        return Some(Candidate {
            text: bracketed,
            origin: Origin::Brackets,
        });
    }

    key_value_lines(text).map(|text| Candidate {
        text,
        origin: Origin::KeyValueLines,
    })
}

fn fenced_block(text: &str) -> Option<String> {
    FENCE_PATTERN
        .captures_iter(text)
        .map(|cap| cap[1].trim().to_string())
        .find(|content| content.starts_with('{') || content.starts_with('['))
}

fn bracketed(text: &str) -> Option<String> {
    let order = match (text.find('{'), text.find('[')) {
        (Some(object), Some(array)) if array < object => [Bracket::Array, Bracket::Object],
        (None, Some(_)) => [Bracket::Array, Bracket::Object],
        _ => [Bracket::Object, Bracket::Array],
    };

    let mut last_resort = None;
    for kind in order {
        match scan(text, kind) {
            Scan::Parsed(candidate) => return Some(candidate),
            Scan::Unparsed(candidate) => {
                last_resort.get_or_insert(candidate);
            }
            Scan::Nothing => {}
        }
    }
    last_resort
}

fn scan(text: &str, kind: Bracket) -> Scan {
    let Some(first) = text.bytes().position(|b| b == kind.open()) else {
        return Scan::Nothing;
    };

    let outer = matching_close(text, first, kind).map(|end| &text[first..=end]);
    if let Some(candidate) = outer {
        if kind.plausible(candidate) && parse_lenient(candidate).is_ok() {
            return Scan::Parsed(candidate.to_string());
        }
    }

    let mut pairs = balanced_pairs(text, kind);
    pairs.sort_by(|a, b| b.1.cmp(&a.1));
    for &(start, end) in &pairs {
        let candidate = &text[start..=end];
        if kind.plausible(candidate) && parse_lenient(candidate).is_ok() {
            return Scan::Parsed(candidate.to_string());
        }
    }

    outer
        .filter(|candidate| kind.plausible(candidate))
        .or_else(|| {
            pairs
                .iter()
                .map(|&(start, end)| &text[start..=end])
                .find(|candidate| kind.plausible(candidate))
        })
        .map(|candidate| Scan::Unparsed(candidate.to_string()))
        .unwrap_or(Scan::Nothing)
}

/// Index of the bracket closing the one at `start`, tracking string literals
fn matching_close(text: &str, start: usize, kind: Bracket) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == kind.open() => depth += 1,
            b if b == kind.close() => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Every balanced `(open, close)` index pair of one bracket kind
fn balanced_pairs(text: &str, kind: Bracket) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in text.as_bytes().iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            // Quotes only delimit strings inside a bracketed region
            b'"' if !stack.is_empty() => in_string = true,
            b if b == kind.open() => stack.push(index),
            b if b == kind.close() => {
                if let Some(open) = stack.pop() {
                    pairs.push((open, index));
                }
            }
            _ => {}
        }
    }
    pairs
}

fn key_value_lines(text: &str) -> Option<String> {
    let mut object = Map::new();
    for line in text.lines() {
        if let Some(cap) = KEY_VALUE_LINE.captures(line) {
            let key = cap[1].to_string();
            if !object.contains_key(&key) {
                object.insert(key, Value::String(cap[2].to_string()));
            }
        }
    }

    if object.is_empty() {
        None
    } else {
        Some(Value::Object(object).to_string())
    }
}
