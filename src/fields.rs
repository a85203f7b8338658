//! Ordered field lists.
//!
//! A [`Fields`] value names the columns of a record in order. Lineage queries
//! return `Fields`, and record factories resolve field names to positions
//! against them once at prepare time.

use std::fmt;
use std::sync::Arc;

/// Ordered, cheaply clonable list of field names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Fields(Arc<[String]>);

impl Fields {
  /// Creates a field list from anything yielding names.
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(names.into_iter().map(Into::into).collect())
  }

  /// An empty field list.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Number of fields.
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// True when there are no fields.
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Field name at `index`.
  pub fn get(&self, index: usize) -> Option<&str> {
    self.0.get(index).map(String::as_str)
  }

  /// Position of `name`, if present.
  pub fn index_of(&self, name: &str) -> Option<usize> {
    self.0.iter().position(|f| f == name)
  }

  /// True if `name` is one of the fields.
  pub fn contains(&self, name: &str) -> bool {
    self.index_of(name).is_some()
  }

  /// Iterates over the names in order.
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }

  /// `self` followed by `other`, in that order.
  pub fn concat(&self, other: &Fields) -> Fields {
    Fields::new(self.iter().chain(other.iter()))
  }

  /// Resolves every name in `wanted` to its position in `self`.
  ///
  /// Returns the first missing name on failure.
  pub fn positions_of(&self, wanted: &Fields) -> Result<Vec<usize>, String> {
    wanted
      .iter()
      .map(|name| self.index_of(name).ok_or_else(|| name.to_string()))
      .collect()
  }
}

impl fmt::Display for Fields {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}]", self.0.join(", "))
  }
}

impl<S: Into<String>> FromIterator<S> for Fields {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Fields::new(iter)
  }
}

impl From<&[&str]> for Fields {
  fn from(names: &[&str]) -> Self {
    Fields::new(names.iter().copied())
  }
}

impl<const N: usize> From<[&str; N]> for Fields {
  fn from(names: [&str; N]) -> Self {
    Fields::new(names)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn concat_preserves_order() {
    let a = Fields::from(["a", "b"]);
    let b = Fields::from(["c"]);
    assert_eq!(a.concat(&b), Fields::from(["a", "b", "c"]));
    assert_eq!(a.concat(&b).to_string(), "[a, b, c]");
  }

  #[test]
  fn positions_report_missing_field() {
    let f = Fields::from(["word", "count"]);
    assert_eq!(f.positions_of(&Fields::from(["count"])), Ok(vec![1]));
    assert_eq!(
      f.positions_of(&Fields::from(["count", "nope"])),
      Err("nope".to_string())
    );
  }
}
