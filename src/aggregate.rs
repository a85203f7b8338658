//! Two-stage grouped aggregation.
//!
//! A group-by node runs exactly one of two stages:
//!
//! - **stage 0** ([`Stage0Executor`]) folds the records of a batch into one
//!   partial per key and flushes `key ++ [partial]` at the end of the batch.
//!   Partials travel to stage 1 as an opaque `stage1_vl` field.
//! - **stage 1** ([`Stage1Executor`]) combines partials per key, folds them
//!   into the durable value from the [`StateStore`] on flush, emits the new
//!   values and stages them. The staged values are written, versioned by
//!   batch id, only when the batch commits; a rollback throws them away.
//!
//! Both stages are built from [`CombinerAggregator`]s, which must be
//! commutative and associative so at-least-once redelivery of partials is
//! harmless once state writes are versioned.

use crate::batch::{BatchId, CommitSignal};
use crate::config::{TaskConfig, TaskContext};
use crate::error::TaskError;
use crate::operation::Collector;
use crate::record::Record;
use crate::state::{StateFactory, StateStore};
use crate::value::{GroupKey, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Error type for aggregators and stage executors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
  /// Input is not a number.
  #[error("{aggregator}: expected a number, got {value}")]
  NotNumeric {
    /// Aggregator name.
    aggregator: &'static str,
    /// Offending value.
    value: Value,
  },
  /// The projected input record has no values.
  #[error("{aggregator}: input record has no values")]
  EmptyInput {
    /// Aggregator name.
    aggregator: &'static str,
  },
  /// Two values cannot be ordered.
  #[error("{aggregator}: cannot compare {left} with {right}")]
  Incomparable {
    /// Aggregator name.
    aggregator: &'static str,
    /// Left operand.
    left: Value,
    /// Right operand.
    right: Value,
  },
  /// Integer overflow while combining.
  #[error("{aggregator}: integer overflow")]
  Overflow {
    /// Aggregator name.
    aggregator: &'static str,
  },
  /// Stage used before `prepare`.
  #[error("aggregation stage used before prepare")]
  NotPrepared,
}

/// Commutative, associative fold over record values.
pub trait CombinerAggregator: Send + Sync {
  /// Name used in errors and logs.
  fn name(&self) -> &'static str;

  /// Value contributed by one input record.
  fn init(&self, input: &Record) -> Result<Value, AggregationError>;

  /// Combines two partial values.
  fn combine(&self, a: &Value, b: &Value) -> Result<Value, AggregationError>;

  /// Identity element for [`combine`](Self::combine).
  fn zero(&self) -> Value;
}

fn first_value<'a>(name: &'static str, input: &'a Record) -> Result<&'a Value, AggregationError> {
  input
    .get(0)
    .ok_or(AggregationError::EmptyInput { aggregator: name })
}

fn add(name: &'static str, a: &Value, b: &Value) -> Result<Value, AggregationError> {
  match (a, b) {
    (Value::Null, other) | (other, Value::Null) => Ok(other.clone()),
    (Value::Int(x), Value::Int(y)) => x
      .checked_add(*y)
      .map(Value::Int)
      .ok_or(AggregationError::Overflow { aggregator: name }),
    _ => match (a.as_float(), b.as_float()) {
      (Some(x), Some(y)) => Ok(Value::Float(x + y)),
      (None, _) => Err(AggregationError::NotNumeric {
        aggregator: name,
        value: a.clone(),
      }),
      (_, None) => Err(AggregationError::NotNumeric {
        aggregator: name,
        value: b.clone(),
      }),
    },
  }
}

fn compare(name: &'static str, a: &Value, b: &Value) -> Result<Ordering, AggregationError> {
  let ordering = match (a, b) {
    (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
    (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    _ => match (a.as_float(), b.as_float()) {
      (Some(x), Some(y)) => x.partial_cmp(&y),
      _ => None,
    },
  };
  ordering.ok_or_else(|| AggregationError::Incomparable {
    aggregator: name,
    left: a.clone(),
    right: b.clone(),
  })
}

/// Counts records.
#[derive(Clone, Copy, Debug, Default)]
pub struct Count;

impl CombinerAggregator for Count {
  fn name(&self) -> &'static str {
    "count"
  }

  fn init(&self, _input: &Record) -> Result<Value, AggregationError> {
    Ok(Value::Int(1))
  }

  fn combine(&self, a: &Value, b: &Value) -> Result<Value, AggregationError> {
    add(self.name(), a, b)
  }

  fn zero(&self) -> Value {
    Value::Int(0)
  }
}

/// Sums the first input field.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sum;

impl CombinerAggregator for Sum {
  fn name(&self) -> &'static str {
    "sum"
  }

  fn init(&self, input: &Record) -> Result<Value, AggregationError> {
    let v = first_value(self.name(), input)?;
    match v {
      Value::Int(_) | Value::Float(_) | Value::Null => Ok(v.clone()),
      other => Err(AggregationError::NotNumeric {
        aggregator: self.name(),
        value: other.clone(),
      }),
    }
  }

  fn combine(&self, a: &Value, b: &Value) -> Result<Value, AggregationError> {
    add(self.name(), a, b)
  }

  fn zero(&self) -> Value {
    Value::Int(0)
  }
}

/// Smallest value of the first input field. Nulls are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct Min;

impl CombinerAggregator for Min {
  fn name(&self) -> &'static str {
    "min"
  }

  fn init(&self, input: &Record) -> Result<Value, AggregationError> {
    first_value(self.name(), input).cloned()
  }

  fn combine(&self, a: &Value, b: &Value) -> Result<Value, AggregationError> {
    if a.is_null() {
      return Ok(b.clone());
    }
    if b.is_null() {
      return Ok(a.clone());
    }
    Ok(match compare(self.name(), a, b)? {
      Ordering::Greater => b.clone(),
      _ => a.clone(),
    })
  }

  fn zero(&self) -> Value {
    Value::Null
  }
}

/// Largest value of the first input field. Nulls are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct Max;

impl CombinerAggregator for Max {
  fn name(&self) -> &'static str {
    "max"
  }

  fn init(&self, input: &Record) -> Result<Value, AggregationError> {
    first_value(self.name(), input).cloned()
  }

  fn combine(&self, a: &Value, b: &Value) -> Result<Value, AggregationError> {
    if a.is_null() {
      return Ok(b.clone());
    }
    if b.is_null() {
      return Ok(a.clone());
    }
    Ok(match compare(self.name(), a, b)? {
      Ordering::Less => b.clone(),
      _ => a.clone(),
    })
  }

  fn zero(&self) -> Value {
    Value::Null
  }
}

/// One stage of a group-by node.
pub trait AggregationStage: Send {
  /// Opens resources. Called once, before the first record.
  fn prepare(&mut self, config: &TaskConfig, context: &TaskContext) -> Result<(), TaskError>;

  /// Folds one projected input record into the accumulator for `key`.
  fn execute(&mut self, key: GroupKey, input: &Record) -> Result<(), TaskError>;

  /// End of `batch`: emits `key ++ [value]` per key touched in the batch.
  fn flush(&mut self, batch: BatchId, out: &mut dyn Collector) -> Result<(), TaskError>;

  /// Drops in-batch accumulators without emitting.
  fn discard(&mut self);
}

/// A stage whose output is only durable once the batch commits.
pub trait CommittingStage: AggregationStage {
  /// Applies or drops the state staged for the signal's batch.
  fn commit(&mut self, signal: CommitSignal) -> Result<(), TaskError>;
}

/// Per-key accumulators that remember first-seen key order.
#[derive(Debug, Default)]
struct Accumulators {
  values: HashMap<GroupKey, Value>,
  order: Vec<GroupKey>,
}

impl Accumulators {
  fn fold(
    &mut self,
    key: GroupKey,
    partial: Value,
    agg: &dyn CombinerAggregator,
  ) -> Result<(), AggregationError> {
    match self.values.get_mut(&key) {
      Some(current) => *current = agg.combine(current, &partial)?,
      None => {
        self.order.push(key.clone());
        self.values.insert(key, partial);
      }
    }
    Ok(())
  }

  fn drain(&mut self) -> impl Iterator<Item = (GroupKey, Value)> + '_ {
    let values = &mut self.values;
    self.order.drain(..).filter_map(move |k| {
      let v = values.remove(&k)?;
      Some((k, v))
    })
  }

  fn len(&self) -> usize {
    self.order.len()
  }

  fn clear(&mut self) {
    self.values.clear();
    self.order.clear();
  }
}

fn keyed(key: GroupKey, value: Value) -> Vec<Value> {
  let mut out = key.into_values();
  out.push(value);
  out
}

/// Stage 0: per-batch partials, emitted on flush and then forgotten.
pub struct Stage0Executor {
  aggregator: Arc<dyn CombinerAggregator>,
  acc: Accumulators,
}

impl Stage0Executor {
  /// Creates a stage folding with `aggregator`.
  pub fn new(aggregator: Arc<dyn CombinerAggregator>) -> Self {
    Self {
      aggregator,
      acc: Accumulators::default(),
    }
  }
}

impl AggregationStage for Stage0Executor {
  fn prepare(&mut self, _config: &TaskConfig, context: &TaskContext) -> Result<(), TaskError> {
    debug!(task = %context.task_name, aggregator = self.aggregator.name(), "stage 0 prepared");
    Ok(())
  }

  fn execute(&mut self, key: GroupKey, input: &Record) -> Result<(), TaskError> {
    let partial = self.aggregator.init(input)?;
    self.acc.fold(key, partial, self.aggregator.as_ref())?;
    Ok(())
  }

  fn flush(&mut self, batch: BatchId, out: &mut dyn Collector) -> Result<(), TaskError> {
    trace!(%batch, keys = self.acc.len(), "stage 0 flush");
    for (key, partial) in self.acc.drain() {
      out.emit(keyed(key, partial))?;
    }
    Ok(())
  }

  fn discard(&mut self) {
    self.acc.clear();
  }
}

/// Stage 1: combines partials against durable state and commits per batch.
pub struct Stage1Executor {
  combiner: Arc<dyn CombinerAggregator>,
  store_aggregator: Arc<dyn CombinerAggregator>,
  state: Arc<dyn StateFactory>,
  store_name: String,
  pre_aggregated: bool,
  store: Option<Box<dyn StateStore>>,
  acc: Accumulators,
  staged: BTreeMap<BatchId, HashMap<GroupKey, Value>>,
}

impl Stage1Executor {
  /// Creates a stage.
  ///
  /// With `pre_aggregated` set, every input record carries a single partial
  /// produced by stage 0; otherwise partials come from `combiner.init`.
  pub fn new(
    combiner: Arc<dyn CombinerAggregator>,
    store_aggregator: Arc<dyn CombinerAggregator>,
    state: Arc<dyn StateFactory>,
    store_name: impl Into<String>,
    pre_aggregated: bool,
  ) -> Self {
    Self {
      combiner,
      store_aggregator,
      state,
      store_name: store_name.into(),
      pre_aggregated,
      store: None,
      acc: Accumulators::default(),
      staged: BTreeMap::new(),
    }
  }

  /// Batches with staged but not yet committed state.
  pub fn staged_batches(&self) -> Vec<BatchId> {
    self.staged.keys().copied().collect()
  }
}

impl AggregationStage for Stage1Executor {
  fn prepare(&mut self, _config: &TaskConfig, context: &TaskContext) -> Result<(), TaskError> {
    self.store = Some(self.state.make_store(&self.store_name, context)?);
    debug!(
      task = %context.task_name,
      store = %self.store_name,
      aggregator = self.combiner.name(),
      "stage 1 prepared"
    );
    Ok(())
  }

  fn execute(&mut self, key: GroupKey, input: &Record) -> Result<(), TaskError> {
    let partial = if self.pre_aggregated {
      input
        .get(0)
        .cloned()
        .ok_or(AggregationError::EmptyInput {
          aggregator: self.combiner.name(),
        })?
    } else {
      self.combiner.init(input)?
    };
    self.acc.fold(key, partial, self.combiner.as_ref())?;
    Ok(())
  }

  fn flush(&mut self, batch: BatchId, out: &mut dyn Collector) -> Result<(), TaskError> {
    let store = self.store.as_ref().ok_or(AggregationError::NotPrepared)?;
    let staged = self.staged.entry(batch).or_default();
    let mut emitted = Vec::with_capacity(self.acc.len());
    for (key, partial) in self.acc.drain() {
      let stored = store.get(&key)?;
      let value = match (staged.get(&key), stored) {
        (Some(pending), _) => self.store_aggregator.combine(pending, &partial)?,
        (None, Some(v)) if v.version >= batch => {
          trace!(%batch, %key, "already committed, replaying stored value");
          emitted.push(keyed(key, v.value));
          continue;
        }
        (None, Some(v)) => self.store_aggregator.combine(&v.value, &partial)?,
        (None, None) => {
          let zero = self.store_aggregator.zero();
          self.store_aggregator.combine(&zero, &partial)?
        }
      };
      staged.insert(key.clone(), value.clone());
      emitted.push(keyed(key, value));
    }
    if staged.is_empty() {
      self.staged.remove(&batch);
    }
    for values in emitted {
      out.emit(values)?;
    }
    Ok(())
  }

  fn discard(&mut self) {
    self.acc.clear();
  }
}

impl CommittingStage for Stage1Executor {
  fn commit(&mut self, signal: CommitSignal) -> Result<(), TaskError> {
    match signal {
      CommitSignal::Commit(batch) => {
        let store = self.store.as_mut().ok_or(AggregationError::NotPrepared)?;
        let stale: Vec<BatchId> = self.staged.range(..batch).map(|(b, _)| *b).collect();
        for b in stale {
          warn!(batch = %b, "dropping state staged for an uncommitted earlier batch");
          self.staged.remove(&b);
        }
        let Some(values) = self.staged.remove(&batch) else {
          return Ok(());
        };
        let mut applied = 0usize;
        for (key, value) in values {
          if store.put(key, value, batch)? {
            applied += 1;
          }
        }
        store.sync()?;
        debug!(%batch, applied, store = %self.store_name, "committed");
      }
      CommitSignal::Rollback(batch) => {
        self.acc.clear();
        if let Some(values) = self.staged.remove(&batch) {
          debug!(%batch, keys = values.len(), "rolled back staged state");
        }
        if let Some(store) = self.store.as_mut() {
          store.revert()?;
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fields::Fields;
  use crate::state::InMemoryStateFactory;

  fn rec(values: Vec<Value>) -> Record {
    let fields: Fields = (0..values.len()).map(|i| format!("f{i}")).collect();
    Record::new(fields, values).unwrap()
  }

  fn key(s: &str) -> GroupKey {
    GroupKey(vec![Value::from(s)])
  }

  #[test]
  fn builtins_fold_as_expected() {
    assert_eq!(Sum.combine(&Value::Int(2), &Value::Float(0.5)).unwrap(), Value::Float(2.5));
    assert_eq!(Min.combine(&Value::Null, &Value::Int(3)).unwrap(), Value::Int(3));
    assert_eq!(Max.combine(&Value::from("a"), &Value::from("b")).unwrap(), Value::from("b"));
    assert!(matches!(
      Sum.combine(&Value::Int(i64::MAX), &Value::Int(1)),
      Err(AggregationError::Overflow { .. })
    ));
    assert!(matches!(
      Max.combine(&Value::from("a"), &Value::Int(1)),
      Err(AggregationError::Incomparable { .. })
    ));
  }

  #[test]
  fn stage0_emits_one_partial_per_key_in_first_seen_order() {
    let mut s0 = Stage0Executor::new(Arc::new(Count));
    s0.prepare(&TaskConfig::default(), &TaskContext::new("t")).unwrap();
    for w in ["b", "a", "b"] {
      s0.execute(key(w), &rec(vec![Value::from(w)])).unwrap();
    }
    let mut out: Vec<Vec<Value>> = Vec::new();
    s0.flush(BatchId::new(1), &mut out).unwrap();
    assert_eq!(
      out,
      vec![
        vec![Value::from("b"), Value::Int(2)],
        vec![Value::from("a"), Value::Int(1)],
      ]
    );
    let mut again: Vec<Vec<Value>> = Vec::new();
    s0.flush(BatchId::new(2), &mut again).unwrap();
    assert!(again.is_empty());
  }

  #[test]
  fn stage1_commits_on_commit_and_drops_on_rollback() {
    let state = InMemoryStateFactory::new();
    let mut s1 = Stage1Executor::new(
      Arc::new(Count),
      Arc::new(Count),
      Arc::new(state.clone()),
      "counts",
      true,
    );
    s1.prepare(&TaskConfig::default(), &TaskContext::new("t")).unwrap();

    s1.execute(key("a"), &rec(vec![Value::Int(2)])).unwrap();
    s1.execute(key("a"), &rec(vec![Value::Int(3)])).unwrap();
    let mut out: Vec<Vec<Value>> = Vec::new();
    s1.flush(BatchId::new(1), &mut out).unwrap();
    assert_eq!(out, vec![vec![Value::from("a"), Value::Int(5)]]);
    assert_eq!(state.value(&key("a")), None);
    s1.commit(CommitSignal::Commit(BatchId::new(1))).unwrap();
    assert_eq!(state.value(&key("a")), Some(Value::Int(5)));

    s1.execute(key("a"), &rec(vec![Value::Int(1)])).unwrap();
    s1.flush(BatchId::new(2), &mut Vec::<Vec<Value>>::new()).unwrap();
    s1.commit(CommitSignal::Rollback(BatchId::new(2))).unwrap();
    assert!(s1.staged_batches().is_empty());
    assert_eq!(state.value(&key("a")), Some(Value::Int(5)));
  }

  #[test]
  fn stage1_rollback_drops_unflushed_partials() {
    let state = InMemoryStateFactory::new();
    let mut s1 = Stage1Executor::new(
      Arc::new(Sum),
      Arc::new(Sum),
      Arc::new(state.clone()),
      "sums",
      true,
    );
    s1.prepare(&TaskConfig::default(), &TaskContext::new("t")).unwrap();
    s1.execute(key("a"), &rec(vec![Value::Int(5)])).unwrap();
    s1.commit(CommitSignal::Rollback(BatchId::new(1))).unwrap();

    let mut out: Vec<Vec<Value>> = Vec::new();
    s1.flush(BatchId::new(2), &mut out).unwrap();
    s1.commit(CommitSignal::Commit(BatchId::new(2))).unwrap();
    assert!(out.is_empty());
    assert_eq!(state.value(&key("a")), None);
  }

  #[test]
  fn stage1_replays_committed_batches_without_double_counting() {
    let state = InMemoryStateFactory::new();
    let mut s1 = Stage1Executor::new(
      Arc::new(Sum),
      Arc::new(Sum),
      Arc::new(state.clone()),
      "sums",
      false,
    );
    s1.prepare(&TaskConfig::default(), &TaskContext::new("t")).unwrap();
    s1.execute(key("x"), &rec(vec![Value::Int(4)])).unwrap();
    s1.flush(BatchId::new(3), &mut Vec::<Vec<Value>>::new()).unwrap();
    s1.commit(CommitSignal::Commit(BatchId::new(3))).unwrap();

    s1.execute(key("x"), &rec(vec![Value::Int(4)])).unwrap();
    let mut out: Vec<Vec<Value>> = Vec::new();
    s1.flush(BatchId::new(3), &mut out).unwrap();
    s1.commit(CommitSignal::Commit(BatchId::new(3))).unwrap();
    assert_eq!(out, vec![vec![Value::from("x"), Value::Int(4)]]);
    assert_eq!(state.value(&key("x")), Some(Value::Int(4)));
  }

  #[test]
  fn stage1_requires_prepare() {
    let mut s1 = Stage1Executor::new(
      Arc::new(Count),
      Arc::new(Count),
      Arc::new(InMemoryStateFactory::new()),
      "c",
      true,
    );
    let err = s1.flush(BatchId::new(1), &mut Vec::<Vec<Value>>::new()).unwrap_err();
    assert!(matches!(err, TaskError::Aggregation(AggregationError::NotPrepared)));
  }
}
