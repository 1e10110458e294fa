//! Agent definition: the typed catalog of IOs and services an agent exposes.
//!
//! A [`Definition`] is plain data. Mutation rules (observers, publication,
//! freeze semantics) live in the kernel's definition store; this module only
//! knows how to look things up, validate a catalog and move it through JSON.

use crate::constraint::Constraint;
use crate::error::{BusError, BusResult};
use crate::value::{IoKind, IoValue, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Descriptive type information attached to an IO. Never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedType {
    pub type_name: String,
    pub specification: String,
}

/// An input, output or attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Current value, always of `value_type`.
    pub value: IoValue,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_type: Option<DetailedType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Constraint>,
    /// Outputs only.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub muted: bool,
}

impl IoDefinition {
    /// A new IO holding the default value of its type.
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            value: IoValue::default_for(value_type),
            description: String::new(),
            detailed_type: None,
            constraint: None,
            muted: false,
        }
    }
}

/// A named, typed argument of a service or reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A reply declared by a service. Replies are called back by the callee
/// using the caller's correlation token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentDefinition>,
    #[serde(default)]
    pub replies: Vec<ReplyDefinition>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            arguments: Vec::new(),
            replies: Vec::new(),
        }
    }

    pub fn reply(&self, name: &str) -> Option<&ReplyDefinition> {
        self.replies.iter().find(|r| r.name == name)
    }

    pub fn reply_mut(&mut self, name: &str) -> Option<&mut ReplyDefinition> {
        self.replies.iter_mut().find(|r| r.name == name)
    }

    /// Check an argument list against this service's signature.
    ///
    /// Arguments must match in count and type, except that an `Int` is
    /// accepted where a `Double` is declared.
    pub fn validate_arguments(&self, values: &[IoValue]) -> Result<(), String> {
        if values.len() != self.arguments.len() {
            return Err(format!(
                "expected {} arguments, got {}",
                self.arguments.len(),
                values.len()
            ));
        }
        for (decl, value) in self.arguments.iter().zip(values) {
            let actual = value.value_type();
            let accepted = actual == decl.value_type
                || (decl.value_type == ValueType::Double && actual == ValueType::Int);
            if !accepted {
                return Err(format!(
                    "argument '{}' expects {}, got {}",
                    decl.name, decl.value_type, actual
                ));
            }
        }
        Ok(())
    }
}

/// The full catalog of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub package: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub inputs: Vec<IoDefinition>,
    #[serde(default)]
    pub outputs: Vec<IoDefinition>,
    #[serde(default)]
    pub attributes: Vec<IoDefinition>,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

impl Definition {
    pub fn ios(&self, kind: IoKind) -> &[IoDefinition] {
        match kind {
            IoKind::Input => &self.inputs,
            IoKind::Output => &self.outputs,
            IoKind::Attribute => &self.attributes,
        }
    }

    pub fn ios_mut(&mut self, kind: IoKind) -> &mut Vec<IoDefinition> {
        match kind {
            IoKind::Input => &mut self.inputs,
            IoKind::Output => &mut self.outputs,
            IoKind::Attribute => &mut self.attributes,
        }
    }

    pub fn io(&self, kind: IoKind, name: &str) -> Option<&IoDefinition> {
        self.ios(kind).iter().find(|io| io.name == name)
    }

    pub fn io_mut(&mut self, kind: IoKind, name: &str) -> Option<&mut IoDefinition> {
        self.ios_mut(kind).iter_mut().find(|io| io.name == name)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceDefinition> {
        self.services.iter_mut().find(|s| s.name == name)
    }

    /// Parse and validate a definition document.
    pub fn from_json(json: &str) -> BusResult<Self> {
        let mut def: Definition = serde_json::from_str(json)?;
        def.normalize()?;
        Ok(def)
    }

    pub fn to_json(&self) -> BusResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate the catalog and coerce stored values to their declared types.
    ///
    /// Fails on duplicate names, values that cannot be converted, constraints
    /// that do not fit their IO or reject its value, and impulsion-typed
    /// service arguments.
    pub fn normalize(&mut self) -> BusResult<()> {
        for kind in [IoKind::Input, IoKind::Output, IoKind::Attribute] {
            let mut seen = HashSet::new();
            for io in self.ios_mut(kind).iter_mut() {
                validate_name(&io.name)?;
                if !seen.insert(io.name.clone()) {
                    return Err(BusError::already_exists(kind.to_string(), &io.name));
                }
                io.value = io.value.convert(io.value_type).ok_or_else(|| {
                    BusError::InvalidType(format!(
                        "{kind} '{}' declared {} cannot hold {}",
                        io.name,
                        io.value_type,
                        io.value.value_type()
                    ))
                })?;
                if let Some(constraint) = &io.constraint {
                    if !constraint.applies_to(io.value_type) {
                        return Err(BusError::InvalidConstraint(format!(
                            "'{constraint}' cannot apply to {} {kind} '{}'",
                            io.value_type, io.name
                        )));
                    }
                    constraint.check(&io.value).map_err(|reason| {
                        BusError::ConstraintViolation {
                            name: io.name.clone(),
                            reason,
                        }
                    })?;
                }
                if kind != IoKind::Output {
                    io.muted = false;
                }
            }
        }

        let mut services = HashSet::new();
        for service in &self.services {
            validate_name(&service.name)?;
            if !services.insert(service.name.as_str()) {
                return Err(BusError::already_exists("service", &service.name));
            }
            validate_arguments(&service.name, &service.arguments)?;
            let mut replies = HashSet::new();
            for reply in &service.replies {
                validate_name(&reply.name)?;
                if !replies.insert(reply.name.as_str()) {
                    return Err(BusError::already_exists("reply", &reply.name));
                }
                validate_arguments(&reply.name, &reply.arguments)?;
            }
        }
        Ok(())
    }
}

fn validate_arguments(owner: &str, args: &[ArgumentDefinition]) -> BusResult<()> {
    let mut seen = HashSet::new();
    for arg in args {
        validate_name(&arg.name)?;
        if arg.value_type == ValueType::Impulsion {
            return Err(BusError::InvalidType(format!(
                "argument '{}' of '{owner}' cannot be an impulsion",
                arg.name
            )));
        }
        if !seen.insert(arg.name.as_str()) {
            return Err(BusError::already_exists("argument", &arg.name));
        }
    }
    Ok(())
}

/// Names must be non-empty and free of surrounding whitespace.
pub fn validate_name(name: &str) -> BusResult<()> {
    if name.is_empty() || name.trim() != name {
        return Err(BusError::InvalidName(format!("{name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "package": "demo",
        "class": "Sensor",
        "version": "1.0",
        "inputs": [
            {"name": "gain", "type": "double", "value": {"type": "int", "value": 2},
             "constraint": "[0, 10]"}
        ],
        "outputs": [
            {"name": "level", "type": "int", "value": {"type": "int", "value": 0}},
            {"name": "tick", "type": "impulsion", "value": {"type": "impulsion"}}
        ],
        "services": [
            {"name": "reset", "arguments": [{"name": "to", "type": "int"}],
             "replies": [{"name": "done", "arguments": [{"name": "ok", "type": "bool"}]}]}
        ]
    }"#;

    #[test]
    fn test_from_json_coerces_values() {
        let def = Definition::from_json(SAMPLE).unwrap();
        assert_eq!(def.class, "Sensor");
        let gain = def.io(IoKind::Input, "gain").unwrap();
        assert_eq!(gain.value, IoValue::Double(2.0));
        assert!(def.io(IoKind::Output, "tick").is_some());
        assert_eq!(def.service("reset").unwrap().replies.len(), 1);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"{"outputs": [
            {"name": "a", "type": "int", "value": {"type": "int", "value": 1}},
            {"name": "a", "type": "bool", "value": {"type": "bool", "value": true}}
        ]}"#;
        assert!(matches!(
            Definition::from_json(json),
            Err(BusError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_default_violating_constraint_rejected() {
        let json = r#"{"inputs": [
            {"name": "x", "type": "int", "value": {"type": "int", "value": 50}, "constraint": "max 10"}
        ]}"#;
        assert!(matches!(
            Definition::from_json(json),
            Err(BusError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn test_impulsion_argument_rejected() {
        let json = r#"{"services": [{"name": "s", "arguments": [{"name": "a", "type": "impulsion"}]}]}"#;
        assert!(matches!(
            Definition::from_json(json),
            Err(BusError::InvalidType(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        assert!(matches!(
            Definition::from_json("{not json"),
            Err(BusError::Serialization(_))
        ));
    }

    #[test]
    fn test_validate_arguments() {
        let mut svc = ServiceDefinition::new("move");
        svc.arguments.push(ArgumentDefinition {
            name: "x".into(),
            value_type: ValueType::Double,
            description: String::new(),
        });
        assert!(svc.validate_arguments(&[IoValue::Int(3)]).is_ok());
        assert!(svc.validate_arguments(&[IoValue::from("3")]).is_err());
        assert!(svc.validate_arguments(&[]).is_err());
    }

    #[test]
    fn test_json_output_parses_back() {
        let def = Definition::from_json(SAMPLE).unwrap();
        let json = def.to_json().unwrap();
        assert!(json.contains("\"constraint\": \"[0, 10]\""));
        assert_eq!(Definition::from_json(&json).unwrap(), def);
    }
}
