use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::{Number, Value};

use crate::types::{EnumMember, WireEnum};

/// JSON-like value delivered to event handlers.
///
/// Mirrors [`serde_json::Value`] with two extra variants so that normalized
/// fields can carry typed timestamps and enumeration members.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Timestamp(DateTime<Utc>),
    Enum(EnumMember),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
}

impl Payload {
    /// Looks up `key` when the payload is an object.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_enum<E: WireEnum>(&self) -> Option<E> {
        match self {
            Self::Enum(member) => member.to::<E>(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Payload]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Renders the payload back into plain JSON; typed values become strings.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            Self::Number(value) => Value::Number(value.clone()),
            Self::String(value) => Value::String(value.clone()),
            Self::Timestamp(value) => Value::String(format_timestamp(value)),
            Self::Enum(member) => Value::String(member.value.to_string()),
            Self::Array(items) => Value::Array(items.iter().map(Payload::to_json).collect()),
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(value),
            Value::Number(value) => Self::Number(value),
            Value::String(value) => Self::String(value),
            Value::Array(items) => Self::Array(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Payload::from(value)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Number(value) => value.serialize(serializer),
            Self::String(value) => serializer.serialize_str(value),
            Self::Timestamp(value) => serializer.serialize_str(&format_timestamp(value)),
            Self::Enum(member) => member.serialize(serializer),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
