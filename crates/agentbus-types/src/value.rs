//! Typed IO values.
//!
//! Every input, output, attribute and service argument carries one of six
//! value types. Writes convert the incoming value to the declared type with
//! the lenient rules of [`IoValue::convert`]; a failed conversion is a type
//! error and leaves the destination untouched.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The namespace an IO lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoKind {
    /// Receives values, typically through mappings.
    Input,
    /// Publishes values to mapped peers.
    Output,
    /// Local state, never published.
    Attribute,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoKind::Input => "input",
            IoKind::Output => "output",
            IoKind::Attribute => "attribute",
        };
        f.write_str(s)
    }
}

/// Declared type of an IO or service argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Valueless trigger.
    Impulsion,
    Bool,
    Int,
    Double,
    String,
    /// Opaque bytes.
    Data,
}

impl ValueType {
    /// Whether numeric constraints (`min`, `max`, ranges) apply.
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Int | ValueType::Double)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Impulsion => "impulsion",
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Data => "data",
        };
        f.write_str(s)
    }
}

/// A typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum IoValue {
    Impulsion,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Data(#[serde(with = "crate::serde_compat")] Vec<u8>),
}

impl IoValue {
    /// The type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            IoValue::Impulsion => ValueType::Impulsion,
            IoValue::Bool(_) => ValueType::Bool,
            IoValue::Int(_) => ValueType::Int,
            IoValue::Double(_) => ValueType::Double,
            IoValue::String(_) => ValueType::String,
            IoValue::Data(_) => ValueType::Data,
        }
    }

    /// The initial value of a freshly created IO of the given type.
    pub fn default_for(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Impulsion => IoValue::Impulsion,
            ValueType::Bool => IoValue::Bool(false),
            ValueType::Int => IoValue::Int(0),
            ValueType::Double => IoValue::Double(0.0),
            ValueType::String => IoValue::String(String::new()),
            ValueType::Data => IoValue::Data(Vec::new()),
        }
    }

    /// Convert this value to `target`, or `None` when no conversion exists.
    pub fn convert(&self, target: ValueType) -> Option<IoValue> {
        if self.value_type() == target {
            return Some(self.clone());
        }
        match (self, target) {
            (_, ValueType::Impulsion) => Some(IoValue::Impulsion),

            (IoValue::Int(i), ValueType::Bool) => Some(IoValue::Bool(*i != 0)),
            (IoValue::Double(d), ValueType::Bool) => Some(IoValue::Bool(*d != 0.0)),
            (IoValue::String(s), ValueType::Bool) => match s.trim().to_lowercase().as_str() {
                "true" | "1" => Some(IoValue::Bool(true)),
                "false" | "0" => Some(IoValue::Bool(false)),
                _ => None,
            },

            (IoValue::Bool(b), ValueType::Int) => Some(IoValue::Int(i64::from(*b))),
            (IoValue::Double(d), ValueType::Int) if d.is_finite() => Some(IoValue::Int(*d as i64)),
            (IoValue::String(s), ValueType::Int) => s.trim().parse().ok().map(IoValue::Int),

            (IoValue::Bool(b), ValueType::Double) => {
                Some(IoValue::Double(if *b { 1.0 } else { 0.0 }))
            }
            (IoValue::Int(i), ValueType::Double) => Some(IoValue::Double(*i as f64)),
            (IoValue::String(s), ValueType::Double) => s.trim().parse().ok().map(IoValue::Double),

            (IoValue::Bool(b), ValueType::String) => Some(IoValue::String(b.to_string())),
            (IoValue::Int(i), ValueType::String) => Some(IoValue::String(i.to_string())),
            (IoValue::Double(d), ValueType::String) => Some(IoValue::String(d.to_string())),

            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.convert(ValueType::Bool)? {
            IoValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.convert(ValueType::Int)? {
            IoValue::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.convert(ValueType::Double)? {
            IoValue::Double(d) => Some(d),
            _ => None,
        }
    }

    /// Borrow the string payload without conversion.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            IoValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the byte payload without conversion.
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            IoValue::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Short human-readable rendering for logs. Data is summarized by size.
    pub fn summary(&self) -> String {
        match self {
            IoValue::Impulsion => "impulsion".to_string(),
            IoValue::Bool(b) => b.to_string(),
            IoValue::Int(i) => i.to_string(),
            IoValue::Double(d) => d.to_string(),
            IoValue::String(s) => format!("{s:?}"),
            IoValue::Data(d) => format!("<{} bytes>", d.len()),
        }
    }
}

impl From<bool> for IoValue {
    fn from(v: bool) -> Self {
        IoValue::Bool(v)
    }
}

impl From<i64> for IoValue {
    fn from(v: i64) -> Self {
        IoValue::Int(v)
    }
}

impl From<i32> for IoValue {
    fn from(v: i32) -> Self {
        IoValue::Int(i64::from(v))
    }
}

impl From<f64> for IoValue {
    fn from(v: f64) -> Self {
        IoValue::Double(v)
    }
}

impl From<&str> for IoValue {
    fn from(v: &str) -> Self {
        IoValue::String(v.to_string())
    }
}

impl From<String> for IoValue {
    fn from(v: String) -> Self {
        IoValue::String(v)
    }
}

impl From<Vec<u8>> for IoValue {
    fn from(v: Vec<u8>) -> Self {
        IoValue::Data(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(IoValue::Int(3).convert(ValueType::Double), Some(IoValue::Double(3.0)));
        assert_eq!(IoValue::Double(3.9).convert(ValueType::Int), Some(IoValue::Int(3)));
        assert_eq!(IoValue::Bool(true).convert(ValueType::Int), Some(IoValue::Int(1)));
        assert_eq!(IoValue::Int(0).convert(ValueType::Bool), Some(IoValue::Bool(false)));
    }

    #[test]
    fn test_string_conversions() {
        assert_eq!(IoValue::from("42").convert(ValueType::Int), Some(IoValue::Int(42)));
        assert_eq!(IoValue::from("nope").convert(ValueType::Int), None);
        assert_eq!(IoValue::from("TRUE").convert(ValueType::Bool), Some(IoValue::Bool(true)));
        assert_eq!(
            IoValue::Double(1.5).convert(ValueType::String),
            Some(IoValue::String("1.5".into()))
        );
    }

    #[test]
    fn test_data_only_converts_to_data_or_impulsion() {
        let data = IoValue::Data(vec![1, 2]);
        assert_eq!(data.convert(ValueType::String), None);
        assert_eq!(data.convert(ValueType::Int), None);
        assert_eq!(data.convert(ValueType::Impulsion), Some(IoValue::Impulsion));
        assert_eq!(IoValue::from("x").convert(ValueType::Data), None);
    }

    #[test]
    fn test_non_finite_double_does_not_convert_to_int() {
        assert_eq!(IoValue::Double(f64::NAN).convert(ValueType::Int), None);
    }

    #[test]
    fn test_value_serialization_shape() {
        let json = serde_json::to_string(&IoValue::Int(7)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":7}"#);
        let json = serde_json::to_string(&IoValue::Impulsion).unwrap();
        assert_eq!(json, r#"{"type":"impulsion"}"#);
        let back: IoValue = serde_json::from_str(r#"{"type":"data","value":"AQI="}"#).unwrap();
        assert_eq!(back, IoValue::Data(vec![1, 2]));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(IoValue::default_for(ValueType::Int), IoValue::Int(0));
        assert_eq!(IoValue::default_for(ValueType::Impulsion), IoValue::Impulsion);
        assert_eq!(IoValue::default_for(ValueType::String).as_str(), Some(""));
    }
}
