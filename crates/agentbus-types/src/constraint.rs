//! IO value constraints.
//!
//! A constraint is written as text and attached to an input, output or
//! attribute:
//!
//! - `min 3` / `max 10.5` bound a numeric value
//! - `[1, 10]` bounds it on both sides (inclusive)
//! - `~ ^[a-z]+$` requires a string to match a regular expression

use crate::value::{IoValue, ValueType};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A parsed validation rule.
#[derive(Clone)]
pub enum Constraint {
    Min(f64),
    Max(f64),
    Range { min: f64, max: f64 },
    Pattern {
        regex: regex_lite::Regex,
        source: String,
    },
}

impl Constraint {
    /// Parse a constraint expression.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix("min") {
            return parse_number(rest).map(Constraint::Min);
        }
        if let Some(rest) = expr.strip_prefix("max") {
            return parse_number(rest).map(Constraint::Max);
        }
        if let Some(rest) = expr.strip_prefix('~') {
            let source = rest.trim();
            if source.is_empty() {
                return Err("empty regular expression".to_string());
            }
            let regex = regex_lite::Regex::new(source)
                .map_err(|e| format!("invalid regular expression '{source}': {e}"))?;
            return Ok(Constraint::Pattern {
                regex,
                source: source.to_string(),
            });
        }
        if let Some(inner) = expr.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let (lo, hi) = inner
                .split_once(',')
                .ok_or_else(|| format!("range '{expr}' needs two bounds separated by a comma"))?;
            let min = parse_number(lo)?;
            let max = parse_number(hi)?;
            if min > max {
                return Err(format!("range '{expr}' has min greater than max"));
            }
            return Ok(Constraint::Range { min, max });
        }
        Err(format!("unrecognized constraint '{expr}'"))
    }

    /// Whether this constraint may be attached to an IO of `value_type`.
    pub fn applies_to(&self, value_type: ValueType) -> bool {
        match self {
            Constraint::Pattern { .. } => value_type == ValueType::String,
            _ => value_type.is_numeric(),
        }
    }

    /// Validate a value already converted to the IO's declared type.
    pub fn check(&self, value: &IoValue) -> Result<(), String> {
        match (self, value) {
            (Constraint::Pattern { regex, source }, IoValue::String(s)) => {
                if regex.is_match(s) {
                    Ok(())
                } else {
                    Err(format!("{s:?} does not match ~ {source}"))
                }
            }
            (Constraint::Pattern { .. }, _) => Ok(()),
            (numeric, value) => {
                let n = match value {
                    IoValue::Int(i) => *i as f64,
                    IoValue::Double(d) => *d,
                    _ => return Ok(()),
                };
                if !n.is_finite() {
                    return Err(format!("{n} is not a finite number"));
                }
                match numeric {
                    Constraint::Min(min) if n < *min => Err(format!("{n} is below min {min}")),
                    Constraint::Max(max) if n > *max => Err(format!("{n} is above max {max}")),
                    Constraint::Range { min, max } if n < *min || n > *max => {
                        Err(format!("{n} is outside [{min}, {max}]"))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

fn parse_number(s: &str) -> Result<f64, String> {
    let s = s.trim();
    s.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| format!("'{s}' is not a number"))
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Min(v) => write!(f, "min {v}"),
            Constraint::Max(v) => write!(f, "max {v}"),
            Constraint::Range { min, max } => write!(f, "[{min}, {max}]"),
            Constraint::Pattern { source, .. } => write!(f, "~ {source}"),
        }
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constraint({self})")
    }
}

impl PartialEq for Constraint {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Serialize for Constraint {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let expr = String::deserialize(d)?;
        Constraint::parse(&expr).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(Constraint::parse("min 3").unwrap().to_string(), "min 3");
        assert_eq!(Constraint::parse("max -2.5").unwrap().to_string(), "max -2.5");
        assert_eq!(Constraint::parse(" [0, 10] ").unwrap().to_string(), "[0, 10]");
        assert_eq!(Constraint::parse("~ ^a+$").unwrap().to_string(), "~ ^a+$");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Constraint::parse("between 1 and 2").is_err());
        assert!(Constraint::parse("min abc").is_err());
        assert!(Constraint::parse("[5, 1]").is_err());
        assert!(Constraint::parse("[1 2]").is_err());
        assert!(Constraint::parse("~ (").is_err());
        assert!(Constraint::parse("~").is_err());
    }

    #[test]
    fn test_range_check() {
        let c = Constraint::parse("[0, 10]").unwrap();
        assert!(c.check(&IoValue::Int(0)).is_ok());
        assert!(c.check(&IoValue::Double(10.0)).is_ok());
        assert!(c.check(&IoValue::Int(11)).is_err());
        assert!(c.check(&IoValue::Double(-0.1)).is_err());
    }

    #[test]
    fn test_numeric_constraints_reject_non_finite() {
        for text in ["[0, 10]", "min 0", "max 10"] {
            let c = Constraint::parse(text).unwrap();
            assert!(c.check(&IoValue::Double(f64::NAN)).is_err(), "{text}");
            assert!(c.check(&IoValue::Double(f64::INFINITY)).is_err(), "{text}");
            assert!(c.check(&IoValue::Double(f64::NEG_INFINITY)).is_err(), "{text}");
        }
    }

    #[test]
    fn test_min_max_check() {
        let min = Constraint::parse("min 5").unwrap();
        assert!(min.check(&IoValue::Int(4)).is_err());
        assert!(min.check(&IoValue::Int(5)).is_ok());
        let max = Constraint::parse("max 5").unwrap();
        assert!(max.check(&IoValue::Double(5.5)).is_err());
    }

    #[test]
    fn test_pattern_check() {
        let c = Constraint::parse("~ ^[a-z]+$").unwrap();
        assert!(c.check(&IoValue::from("hello")).is_ok());
        assert!(c.check(&IoValue::from("Hello1")).is_err());
    }

    #[test]
    fn test_applies_to() {
        assert!(Constraint::parse("min 1").unwrap().applies_to(ValueType::Int));
        assert!(!Constraint::parse("min 1").unwrap().applies_to(ValueType::String));
        assert!(Constraint::parse("~ x").unwrap().applies_to(ValueType::String));
        assert!(!Constraint::parse("~ x").unwrap().applies_to(ValueType::Bool));
    }

    #[test]
    fn test_serde_as_text() {
        let c = Constraint::parse("[1, 2]").unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#""[1, 2]""#);
        let back: Constraint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
