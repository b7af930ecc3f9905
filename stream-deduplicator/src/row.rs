//! Typed rows flowing between the source, the stateful operators and the sink.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int,
    Float,
    Str,
    /// Milliseconds since the Unix epoch
    Timestamp,
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DataType::Bool),
            "int" | "long" | "bigint" => Ok(DataType::Int),
            "float" | "double" => Ok(DataType::Float),
            "str" | "string" => Ok(DataType::Str),
            "timestamp" => Ok(DataType::Timestamp),
            other => bail!("unknown data type '{other}'"),
        }
    }
}

/// A single field value. `Null` compares equal to `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(i64),
}

impl Value {
    /// Event-time reading of this value in epoch millis, if it carries one.
    pub fn as_event_time(&self) -> Option<i64> {
        match self {
            Value::Timestamp(ms) | Value::Int(ms) => Some(*ms),
            _ => None,
        }
    }

    fn from_json(data_type: DataType, json: &serde_json::Value) -> Result<Self> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let value = match data_type {
            DataType::Bool => Value::Bool(json.as_bool().context("expected a boolean")?),
            DataType::Int => Value::Int(json.as_i64().context("expected an integer")?),
            DataType::Float => Value::Float(json.as_f64().context("expected a number")?),
            DataType::Str => Value::Str(
                json.as_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| json.to_string()),
            ),
            DataType::Timestamp => match json {
                serde_json::Value::Number(n) => {
                    Value::Timestamp(n.as_i64().context("expected epoch millis")?)
                }
                serde_json::Value::String(s) => {
                    let parsed = chrono::DateTime::parse_from_rfc3339(s)
                        .with_context(|| format!("invalid RFC3339 timestamp '{s}'"))?;
                    Value::Timestamp(parsed.timestamp_millis())
                }
                other => bail!("expected a timestamp, got {other}"),
            },
        };
        Ok(value)
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) | Value::Timestamp(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Timestamp(ms) => write!(f, "{ms}ms"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Parse a schema of the form `name:type,name:type`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut fields = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, data_type) = part
                .split_once(':')
                .with_context(|| format!("schema field '{part}' must be name:type"))?;
            fields.push(Field::new(name.trim(), data_type.parse()?));
        }
        if fields.is_empty() {
            bail!("schema '{spec}' has no fields");
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Resolve a field name to its ordinal, failing the way key projection does.
    pub fn resolve(&self, name: &str) -> Result<usize, PipelineError> {
        self.index_of(name)
            .ok_or_else(|| PipelineError::KeyProjection {
                field: name.to_string(),
                available: self.field_names().join(", "),
            })
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Event time of this row read from the given ordinal.
    pub fn event_time(&self, index: usize) -> Option<i64> {
        self.values.get(index).and_then(Value::as_event_time)
    }

    /// Decode a JSON object keyed by field name. Missing fields are null.
    pub fn from_json(schema: &Schema, json: &serde_json::Value) -> Result<Self> {
        let object = json.as_object().context("row must be a JSON object")?;
        let values = schema
            .fields()
            .iter()
            .map(|field| match object.get(&field.name) {
                Some(v) => Value::from_json(field.data_type, v)
                    .with_context(|| format!("Failed to decode field '{}'", field.name)),
                None => Ok(Value::Null),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { values })
    }

    pub fn to_json(&self, schema: &Schema) -> serde_json::Value {
        let object = schema
            .fields()
            .iter()
            .zip(&self.values)
            .map(|(field, value)| (field.name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(object)
    }
}
