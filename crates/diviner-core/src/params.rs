//! Parameter domains.
//!
//! Only discrete domains are supported: an ordered, nonempty list of values
//! of a single kind, enumerated in declaration order.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::{Kind, Value};

/// A study's parameter space: name → domain.
pub type Params = BTreeMap<String, Param>;

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("discrete domain must not be empty")]
    Empty,
    #[error("discrete domain mixes kinds: {0} and {1}")]
    MixedKinds(Kind, Kind),
}

/// A discrete, ordered domain of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    values: Vec<Value>,
}

impl Param {
    /// Build a discrete domain. All values must share one kind, and the
    /// domain must be nonempty.
    pub fn discrete<I>(values: I) -> Result<Self, ParamError>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        let first = values.first().ok_or(ParamError::Empty)?;
        let kind = first.kind();
        for v in &values[1..] {
            if v.kind() != kind {
                return Err(ParamError::MixedKinds(kind, v.kind()));
            }
        }
        Ok(Param { values })
    }

    pub fn kind(&self) -> Kind {
        self.values[0].kind()
    }

    /// The domain in declaration order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `value` is a member of this domain.
    pub fn contains(&self, value: &Value) -> bool {
        self.values.contains(value)
    }

    /// Draw one value uniformly at random.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Value {
        self.values[rng.gen_range(0..self.values.len())].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_preserves_declaration_order() {
        let p = Param::discrete([2i64, 0, 1]).unwrap();
        assert_eq!(p.values(), &[Value::Int(2), Value::Int(0), Value::Int(1)]);
        assert_eq!(p.kind(), Kind::Integer);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn empty_domain_rejected() {
        let err = Param::discrete(Vec::<Value>::new()).unwrap_err();
        assert_eq!(err, ParamError::Empty);
    }

    #[test]
    fn mixed_kinds_rejected() {
        let err = Param::discrete([Value::Int(1), Value::Str("x".into())]).unwrap_err();
        assert_eq!(err, ParamError::MixedKinds(Kind::Integer, Kind::String));
    }

    #[test]
    fn contains_checks_membership() {
        let p = Param::discrete(["sgd", "adam"]).unwrap();
        assert!(p.contains(&Value::Str("sgd".into())));
        assert!(!p.contains(&Value::Str("rmsprop".into())));
    }

    #[test]
    fn sample_stays_in_domain() {
        let p = Param::discrete([0i64, 1, 2]).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            assert!(p.contains(&p.sample(&mut rng)));
        }
    }
}
