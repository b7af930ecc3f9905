use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::row::{Row, Schema, Value};

/// Which fields of a row make up a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyFields {
    /// The full row
    #[default]
    All,
    Named(Vec<String>),
}

impl KeyFields {
    pub fn named<S: AsRef<str>>(names: &[S]) -> Self {
        KeyFields::Named(names.iter().map(|n| n.as_ref().to_string()).collect())
    }
}

impl FromStr for KeyFields {
    type Err = std::convert::Infallible;

    /// `*`, `all` or an empty string select the full row, otherwise a comma separated list.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed.eq_ignore_ascii_case("all") {
            return Ok(KeyFields::All);
        }
        Ok(KeyFields::Named(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

/// A validated projection of rows of one schema onto a set of key fields.
///
/// Ordinals are kept in schema order, so `[b, a]` and `[a, b]` project
/// identically and produce the same key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProjection {
    ordinals: Vec<usize>,
}

impl KeyProjection {
    pub fn new(schema: &Schema, fields: &KeyFields) -> Result<Self, PipelineError> {
        let ordinals = match fields {
            KeyFields::All => (0..schema.len()).collect(),
            KeyFields::Named(names) => {
                let mut resolved = BTreeSet::new();
                for name in names {
                    resolved.insert(schema.resolve(name)?);
                }
                resolved.into_iter().collect()
            }
        };
        Ok(Self { ordinals })
    }

    pub fn ordinals(&self) -> &[usize] {
        &self.ordinals
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        self.ordinals.binary_search(&ordinal).is_ok()
    }

    pub fn is_subset_of(&self, other: &KeyProjection) -> bool {
        self.ordinals.iter().all(|o| other.contains(*o))
    }

    /// Projected key values, with floats normalized.
    pub fn project(&self, row: &Row) -> Vec<Value> {
        self.ordinals
            .iter()
            .map(|&i| normalize(row.get(i).unwrap_or(&Value::Null)))
            .collect()
    }

    /// Canonical byte encoding of the projected key.
    pub fn encode(&self, row: &Row) -> anyhow::Result<Vec<u8>> {
        encode_values(&self.project(row))
    }
}

/// Encode already projected key values.
pub fn encode_values(values: &[Value]) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(values, bincode::config::standard())?)
}

/// Decode key bytes produced by [`encode_values`].
pub fn decode_values(bytes: &[u8]) -> anyhow::Result<Vec<Value>> {
    let (values, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(values)
}

/// `-0.0` and `0.0` compare equal and every NaN is the same key value.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Float(f) if f.is_nan() => Value::Float(f64::NAN),
        Value::Float(f) if *f == 0.0 => Value::Float(0.0),
        other => other.clone(),
    }
}
