//! Testing utilities and fixtures
//!
//! Mocks and small builders shared by unit and integration tests.

pub mod mocks;

use crate::splitter::{BatchInput, Payload};

/// Build a batch whose rows each carry one `field` value, keyed by that field
pub fn batch_of(field: &str, values: &[&str]) -> BatchInput {
    let rows = values
        .iter()
        .map(|value| Payload::from([(field.to_string(), value.to_string())]))
        .collect();
    BatchInput::new(rows).with_id_field(field)
}

/// Build a payload from string pairs
pub fn payload(pairs: &[(&str, &str)]) -> Payload {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
