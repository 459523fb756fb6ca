//! The value sum type crossing the script boundary
//!
//! A deliberately narrow shape: scalars, sequences, keyed maps, and nil.
//! Script runtimes marshal into and out of this type; dialect-specific
//! objects never reach flow attributes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attribute::AttrType;

/// Named arguments passed into and out of steps.
///
/// `BTreeMap` keeps keys sorted, which makes the serialized form canonical
/// for fingerprinting.
pub type Args = BTreeMap<String, Value>;

/// A value held in flow attributes or exchanged with scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent / nil
    Null,

    /// Boolean scalar
    Bool(bool),

    /// Integer scalar
    Int(i64),

    /// Floating-point scalar
    Float(f64),

    /// String scalar
    Str(String),

    /// Ordered sequence
    Seq(Vec<Value>),

    /// Keyed map with sorted keys
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Human-readable type name for error messages
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Seq(_) => "array",
            Self::Map(_) => "object",
        }
    }

    /// Check whether this value conforms to a declared attribute type
    #[must_use]
    pub fn conforms_to(&self, attr_type: AttrType) -> bool {
        match attr_type {
            AttrType::Any => true,
            AttrType::String => matches!(self, Self::Str(_)),
            AttrType::Number => matches!(self, Self::Int(_) | Self::Float(_)),
            AttrType::Bool => matches!(self, Self::Bool(_)),
            AttrType::Object => matches!(self, Self::Map(_)),
            AttrType::Array => matches!(self, Self::Seq(_)),
        }
    }

    /// Standard truthiness: `null` and `false` are falsy, everything else truthy
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Null | Self::Bool(false))
    }

    /// Get as string slice if this is a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as bool if this is a bool
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 if this is an integer
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as sequence if this is one
    #[must_use]
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    /// Get as map if this is one
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Seq(_) | Self::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                write!(f, "{json}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Seq(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Map(entries)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or(f64::NAN)),
                Self::Int,
            ),
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::Seq(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Int(i) => Self::from(i),
            Value::Float(x) => Self::from(x),
            Value::Str(s) => Self::String(s),
            Value::Seq(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Map(entries) => Self::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Build an [`Args`] map from name/value pairs
#[must_use]
pub fn args_from<const N: usize>(pairs: [(&str, Value); N]) -> Args {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip() {
        let value = Value::Map(
            [
                ("count".to_string(), Value::Int(3)),
                ("name".to_string(), Value::Str("widget".to_string())),
                (
                    "tags".to_string(),
                    Value::Seq(vec![Value::Str("a".to_string()), Value::Bool(true)]),
                ),
            ]
            .into_iter()
            .collect(),
        );

        let json = serde_json::to_string(&value).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, parsed);
    }

    #[test]
    fn test_integers_stay_integers() {
        let parsed: Value = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, Value::Int(42));

        let parsed: Value = serde_json::from_str("42.5").unwrap();
        assert_eq!(parsed, Value::Float(42.5));
    }

    #[test]
    fn test_conforms_to() {
        assert!(Value::Int(1).conforms_to(AttrType::Number));
        assert!(Value::Float(1.5).conforms_to(AttrType::Number));
        assert!(!Value::Str("1".to_string()).conforms_to(AttrType::Number));
        assert!(Value::Null.conforms_to(AttrType::Any));
        assert!(Value::Seq(vec![]).conforms_to(AttrType::Array));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Str(String::new()).is_truthy());
    }

    #[test]
    fn test_serde_json_conversion() {
        let json = serde_json::json!({"n": 1, "s": "x", "a": [1, 2], "z": null});
        let value = Value::from(json.clone());
        let back: serde_json::Value = value.into();
        assert_eq!(json, back);
    }
}
