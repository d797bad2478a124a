//! Parameter values — tagged scalars and named assignments.
//!
//! A [`Value`] is one of three kinds (integer, real, string). Values of the
//! same kind are totally ordered; comparing across kinds yields no ordering.
//! A [`Values`] map is a complete assignment of parameters to values; its
//! `Display` form is canonical (keys sorted, `name=value` joined by commas)
//! and serves as the point identity for history deduplication.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// The kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Integer,
    Real,
    String,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Integer => write!(f, "integer"),
            Kind::Real => write!(f, "real"),
            Kind::String => write!(f, "string"),
        }
    }
}

/// A parameter value. The serialized representation is tagged, so stored
/// values round-trip their kind exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Int(_) => Kind::Integer,
            Value::Float(_) => Kind::Real,
            Value::Str(_) => Kind::String,
        }
    }

    /// The integer payload. Panics on non-integer values: asking an integer
    /// question of a real or string value is a programming error, not a
    /// recoverable condition.
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            other => panic!("as_int on {} value", other.kind()),
        }
    }

    /// The floating-point payload. Panics on non-real values.
    pub fn as_float(&self) -> f64 {
        match self {
            Value::Float(v) => *v,
            other => panic!("as_float on {} value", other.kind()),
        }
    }

    /// The string payload. Panics on non-string values.
    pub fn as_str(&self) -> &str {
        match self {
            Value::Str(v) => v,
            other => panic!("as_str on {} value", other.kind()),
        }
    }
}

impl PartialOrd for Value {
    /// Ordering is defined within a kind only; cross-kind comparison
    /// returns `None`.
    fn partial_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// A complete assignment of parameter names to values.
///
/// Backed by a `BTreeMap`, so iteration order is the sorted key order the
/// canonical form requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Values(BTreeMap<String, Value>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-by-builder, for concise test and study construction.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }
}

impl Deref for Values {
    type Target = BTreeMap<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Values {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(String, Value)> for Values {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Values(iter.into_iter().collect())
    }
}

impl fmt::Display for Values {
    /// The canonical textual form: `a=1,b=x` with keys in sorted order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_accessors() {
        assert_eq!(Value::Int(3).kind(), Kind::Integer);
        assert_eq!(Value::Float(0.5).kind(), Kind::Real);
        assert_eq!(Value::Str("x".into()).kind(), Kind::String);

        assert_eq!(Value::Int(3).as_int(), 3);
        assert_eq!(Value::Float(0.5).as_float(), 0.5);
        assert_eq!(Value::Str("x".into()).as_str(), "x");
    }

    #[test]
    #[should_panic(expected = "as_int on real value")]
    fn wrong_kind_accessor_panics() {
        Value::Float(1.0).as_int();
    }

    #[test]
    fn ordering_within_kind_only() {
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::Float(0.1) < Value::Float(0.2));
        assert!(Value::Str("a".into()) < Value::Str("b".into()));
        assert_eq!(Value::Int(1).partial_cmp(&Value::Float(1.0)), None);
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::Str("adam".into()).to_string(), "adam");
    }

    #[test]
    fn values_string_sorts_keys() {
        let v = Values::new()
            .with("lr", 0.01)
            .with("batch", 32i64)
            .with("opt", "sgd");
        assert_eq!(v.to_string(), "batch=32,lr=0.01,opt=sgd");
    }

    #[test]
    fn values_string_is_point_identity() {
        let a = Values::new().with("x", 1i64).with("y", 2i64);
        let b = Values::new().with("y", 2i64).with("x", 1i64);
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a, b);
    }
}
