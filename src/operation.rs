//! Per-record user transforms attached to function nodes.

use crate::config::{TaskConfig, TaskContext};
use crate::error::TaskError;
use crate::record::Record;
use crate::value::Value;

/// Receives values emitted by a transform or aggregation stage.
///
/// The executor behind it builds the outward record, runs every child
/// executor on it and writes it to the node's sink, if any.
pub trait Collector {
  /// Emits one record's worth of values.
  fn emit(&mut self, values: Vec<Value>) -> Result<(), TaskError>;
}

impl Collector for Vec<Vec<Value>> {
  fn emit(&mut self, values: Vec<Value>) -> Result<(), TaskError> {
    self.push(values);
    Ok(())
  }
}

/// Transform run once per input record of a function node.
///
/// `input` is projected to the node's selector fields. Emitted values must
/// match the node's appended fields; they are appended to the full parent
/// record.
pub trait RecordFunction: Send + Sync {
  /// Called once per task instance before the first record.
  fn prepare(&self, _config: &TaskConfig, _context: &TaskContext) -> Result<(), TaskError> {
    Ok(())
  }

  /// Processes one record.
  fn execute(&self, input: &Record, out: &mut dyn Collector) -> Result<(), TaskError>;
}

impl<F> RecordFunction for F
where
  F: Fn(&Record, &mut dyn Collector) -> Result<(), TaskError> + Send + Sync,
{
  fn execute(&self, input: &Record, out: &mut dyn Collector) -> Result<(), TaskError> {
    self(input, out)
  }
}
