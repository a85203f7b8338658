//! Logical field values carried inside records.
//!
//! [`Value`] is the dynamically typed cell every record is made of. It has a
//! total equality and hash (floats compare by bit pattern) so that values can
//! key per-group aggregation state directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single field value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
  /// Absent value.
  Null,
  /// Boolean.
  Bool(bool),
  /// Signed 64-bit integer.
  Int(i64),
  /// 64-bit float. Equality and hashing use the raw bit pattern.
  Float(f64),
  /// UTF-8 string.
  Str(String),
  /// Opaque bytes.
  Bytes(Vec<u8>),
  /// Nested list of values.
  List(Vec<Value>),
}

impl Value {
  /// Returns the integer payload, if this is an `Int`.
  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      _ => None,
    }
  }

  /// Returns the value as a float, widening integers.
  pub fn as_float(&self) -> Option<f64> {
    match self {
      Value::Float(f) => Some(*f),
      Value::Int(i) => Some(*i as f64),
      _ => None,
    }
  }

  /// Returns the string payload, if this is a `Str`.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _ => None,
    }
  }

  /// Returns true for `Null`.
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  fn discriminant(&self) -> u8 {
    match self {
      Value::Null => 0,
      Value::Bool(_) => 1,
      Value::Int(_) => 2,
      Value::Float(_) => 3,
      Value::Str(_) => 4,
      Value::Bytes(_) => 5,
      Value::List(_) => 6,
    }
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Value::Null, Value::Null) => true,
      (Value::Bool(a), Value::Bool(b)) => a == b,
      (Value::Int(a), Value::Int(b)) => a == b,
      (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
      (Value::Str(a), Value::Str(b)) => a == b,
      (Value::Bytes(a), Value::Bytes(b)) => a == b,
      (Value::List(a), Value::List(b)) => a == b,
      _ => false,
    }
  }
}

impl Eq for Value {}

impl Hash for Value {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.discriminant().hash(state);
    match self {
      Value::Null => {}
      Value::Bool(b) => b.hash(state),
      Value::Int(i) => i.hash(state),
      Value::Float(f) => f.to_bits().hash(state),
      Value::Str(s) => s.hash(state),
      Value::Bytes(b) => b.hash(state),
      Value::List(l) => l.hash(state),
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => write!(f, "null"),
      Value::Bool(b) => write!(f, "{}", b),
      Value::Int(i) => write!(f, "{}", i),
      Value::Float(x) => write!(f, "{}", x),
      Value::Str(s) => write!(f, "{:?}", s),
      Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
      Value::List(l) => {
        write!(f, "[")?;
        for (i, v) in l.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{}", v)?;
        }
        write!(f, "]")
      }
    }
  }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self {
    Value::Int(i)
  }
}

impl From<f64> for Value {
  fn from(f: f64) -> Self {
    Value::Float(f)
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::Str(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::Str(s)
  }
}

impl From<Vec<u8>> for Value {
  fn from(b: Vec<u8>) -> Self {
    Value::Bytes(b)
  }
}

/// Grouping key: the values of a GroupBy node's key fields, in key order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub Vec<Value>);

impl GroupKey {
  /// Returns the key values.
  pub fn values(&self) -> &[Value] {
    &self.0
  }

  /// Consumes the key, returning its values.
  pub fn into_values(self) -> Vec<Value> {
    self.0
  }
}

impl fmt::Display for GroupKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", Value::List(self.0.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn floats_key_by_bit_pattern() {
    let mut m = HashMap::new();
    m.insert(Value::Float(1.5), 1);
    m.insert(Value::Float(1.5), 2);
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(&Value::Float(1.5)), Some(&2));
    assert_ne!(Value::Int(1), Value::Float(1.0));
  }

  #[test]
  fn group_keys_compare_structurally() {
    let a = GroupKey(vec![Value::from("x"), Value::Int(1)]);
    let b = GroupKey(vec![Value::from("x"), Value::Int(1)]);
    assert_eq!(a, b);
    assert_eq!(a.to_string(), "[\"x\", 1]");
  }
}
