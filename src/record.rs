//! Logical records and the factories that build them.
//!
//! A [`Record`] pairs a [`Fields`] schema with one value per field. Executors
//! never inspect schemas at runtime: each one resolves its factories once, at
//! prepare time, against the fields its parent produces.
//!
//! - [`FreshFactory`] builds a record straight from emitted values (sources,
//!   group-by outputs, decoded task input).
//! - [`AppendFactory`] extends the parent record with appended values
//!   (function outputs).
//! - [`ProjectionFactory`] selects a subset of the parent's fields by
//!   precomputed position.

use crate::fields::Fields;
use crate::value::Value;
use thiserror::Error;

/// Error type for record construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
  /// Number of values does not match the schema.
  #[error("expected {expected} values for {fields}, got {got}")]
  Arity {
    /// Schema being built.
    fields: Fields,
    /// Expected value count.
    expected: usize,
    /// Actual value count.
    got: usize,
  },
  /// A projected field is not produced by the parent.
  #[error("field '{field}' not found in {available}")]
  MissingField {
    /// Requested field.
    field: String,
    /// Fields the parent produces.
    available: Fields,
  },
}

/// A logical record: named, ordered values.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
  fields: Fields,
  values: Vec<Value>,
}

impl Record {
  /// Builds a record, checking arity against `fields`.
  pub fn new(fields: Fields, values: Vec<Value>) -> Result<Self, RecordError> {
    if fields.len() != values.len() {
      return Err(RecordError::Arity {
        expected: fields.len(),
        got: values.len(),
        fields,
      });
    }
    Ok(Self { fields, values })
  }

  /// The record's schema.
  pub fn fields(&self) -> &Fields {
    &self.fields
  }

  /// The record's values, in field order.
  pub fn values(&self) -> &[Value] {
    &self.values
  }

  /// Value at `index`.
  pub fn get(&self, index: usize) -> Option<&Value> {
    self.values.get(index)
  }

  /// Value of the named field.
  pub fn get_by_field(&self, name: &str) -> Option<&Value> {
    self.fields.index_of(name).and_then(|i| self.values.get(i))
  }

  /// Consumes the record, returning its values.
  pub fn into_values(self) -> Vec<Value> {
    self.values
  }
}

/// Builds records directly from a value list.
#[derive(Clone, Debug)]
pub struct FreshFactory {
  fields: Fields,
}

impl FreshFactory {
  /// Creates a factory producing records with `fields`.
  pub fn new(fields: Fields) -> Self {
    Self { fields }
  }

  /// Schema of produced records.
  pub fn fields(&self) -> &Fields {
    &self.fields
  }

  /// Wraps `values` in a record.
  pub fn create(&self, values: Vec<Value>) -> Result<Record, RecordError> {
    Record::new(self.fields.clone(), values)
  }
}

/// Builds records by appending values to a parent record.
#[derive(Clone, Debug)]
pub struct AppendFactory {
  parent_len: usize,
  appended: Fields,
  fields: Fields,
}

impl AppendFactory {
  /// Creates a factory appending `appended` to records shaped like `parent`.
  pub fn new(parent: &Fields, appended: Fields) -> Self {
    Self {
      parent_len: parent.len(),
      fields: parent.concat(&appended),
      appended,
    }
  }

  /// Schema of produced records (parent fields then appended fields).
  pub fn fields(&self) -> &Fields {
    &self.fields
  }

  /// Appends `values` to `parent`.
  pub fn create(&self, parent: &Record, values: Vec<Value>) -> Result<Record, RecordError> {
    if values.len() != self.appended.len() {
      return Err(RecordError::Arity {
        fields: self.appended.clone(),
        expected: self.appended.len(),
        got: values.len(),
      });
    }
    if parent.values.len() != self.parent_len {
      return Err(RecordError::Arity {
        fields: parent.fields.clone(),
        expected: self.parent_len,
        got: parent.values.len(),
      });
    }
    let mut all = Vec::with_capacity(self.fields.len());
    all.extend(parent.values.iter().cloned());
    all.extend(values);
    Ok(Record {
      fields: self.fields.clone(),
      values: all,
    })
  }
}

/// Selects a fixed subset of a parent record's fields.
#[derive(Clone, Debug)]
pub struct ProjectionFactory {
  fields: Fields,
  positions: Vec<usize>,
}

impl ProjectionFactory {
  /// Resolves `wanted` against `parent` once.
  pub fn new(parent: &Fields, wanted: Fields) -> Result<Self, RecordError> {
    let positions = parent
      .positions_of(&wanted)
      .map_err(|field| RecordError::MissingField {
        field,
        available: parent.clone(),
      })?;
    Ok(Self {
      fields: wanted,
      positions,
    })
  }

  /// Schema of produced records.
  pub fn fields(&self) -> &Fields {
    &self.fields
  }

  /// Projects `parent` to the resolved positions.
  pub fn create(&self, parent: &Record) -> Result<Record, RecordError> {
    let values = self
      .positions
      .iter()
      .map(|&i| {
        parent.values.get(i).cloned().ok_or_else(|| RecordError::Arity {
          fields: parent.fields.clone(),
          expected: i + 1,
          got: parent.values.len(),
        })
      })
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Record {
      fields: self.fields.clone(),
      values,
    })
  }
}
