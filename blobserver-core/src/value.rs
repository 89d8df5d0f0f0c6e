//! Tagged parameter values and per-kind parameter schemas
//!
//! Sources and detectors expose an untyped-looking key/value interface
//! over the control plane. Internally every value carries a tag, and
//! each kind declares a schema of recognized names; unknown names are
//! rejected rather than silently ignored.

use crate::error::{Error, Result};
use std::fmt;

/// A single control-plane value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Str(String),
    Bool(bool),
}

/// The tag of a [`Value`], used by parameter schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Str,
    Bool,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Bool(_) => ValueKind::Bool,
        }
    }

    /// Integer view. Floats are truncated, booleans map to 0/1.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i32),
            Value::Bool(v) => Some(*v as i32),
            Value::Str(_) => None,
        }
    }

    /// Float view. Integers widen losslessly enough for pixel work.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Int(v) => Some(*v as f32),
            Value::Float(v) => Some(*v),
            Value::Bool(_) | Value::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// The set of parameter names a source or detector kind recognizes,
/// with the tag each one expects.
#[derive(Debug, Clone, Copy)]
pub struct ParamSchema {
    entries: &'static [(&'static str, ValueKind)],
}

impl ParamSchema {
    pub const fn new(entries: &'static [(&'static str, ValueKind)]) -> Self {
        Self { entries }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| *n == name)
    }

    /// Check a write against the schema. Ints are accepted where a
    /// float is declared; everything else must match exactly.
    pub fn check(&self, name: &str, value: &Value) -> Result<()> {
        let Some((_, kind)) = self.entries.iter().find(|(n, _)| *n == name) else {
            return Err(Error::Validation(format!("Unknown parameter {}", name)));
        };
        let ok = match kind {
            ValueKind::Float => matches!(value.kind(), ValueKind::Float | ValueKind::Int),
            other => value.kind() == *other,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "Wrong type for parameter {}: expected {:?}, got {:?}",
                name,
                kind,
                value.kind()
            )))
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(n, _)| *n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: ParamSchema = ParamSchema::new(&[
        ("detectionLevel", ValueKind::Int),
        ("lifetime", ValueKind::Int),
        ("processNoise", ValueKind::Float),
        ("verbose", ValueKind::Bool),
    ]);

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Str("threshold".into()).to_string(), "threshold");
        assert_eq!(Value::Bool(true).to_string(), "true");
    }

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::Float(3.7).as_i32(), Some(3));
        assert_eq!(Value::Int(2).as_f32(), Some(2.0));
        assert_eq!(Value::Int(1).as_bool(), Some(true));
        assert_eq!(Value::Str("x".into()).as_i32(), None);
    }

    #[test]
    fn test_schema_accepts_known_name() {
        assert!(SCHEMA.check("detectionLevel", &Value::Int(200)).is_ok());
        assert!(SCHEMA.check("verbose", &Value::Bool(false)).is_ok());
    }

    #[test]
    fn test_schema_rejects_unknown_name() {
        let err = SCHEMA.check("gain", &Value::Int(1)).unwrap_err();
        assert!(err.to_string().contains("Unknown parameter gain"));
    }

    #[test]
    fn test_schema_rejects_wrong_type() {
        assert!(SCHEMA.check("lifetime", &Value::Str("30".into())).is_err());
    }

    #[test]
    fn test_schema_widens_int_to_float() {
        assert!(SCHEMA.check("processNoise", &Value::Int(1)).is_ok());
        assert!(SCHEMA.check("processNoise", &Value::Float(0.1)).is_ok());
    }
}
