//! # Task interpreter
//!
//! A task runs a connected piece of the operator graph. [`TaskExecutor::build`]
//! compiles that piece into a tree of executors whose shape mirrors the
//! subgraph: one executor per node, each holding the executors of its
//! successors inside the task. Lineage is resolved once, at build time.
//!
//! The host drives the tree through four entry points, each dispatched on the
//! node's kind with an exhaustive `match`:
//!
//! - [`prepare`](TaskExecutor::prepare) resolves record factories, opens feeds,
//!   aggregation stages and sinks, top-down;
//! - [`execute`](TaskExecutor::execute) handles one physical record: a start
//!   signal makes a source pull a batch; a data record is decoded and every
//!   logical record in it runs through the tree;
//! - [`flush`](TaskExecutor::flush) ends a batch: group-by stages emit, sinks
//!   cut their last bin;
//! - [`commit`](TaskExecutor::commit) lets stage-1 group-bys apply or drop
//!   their staged state; a rollback also clears every group-by's in-batch
//!   accumulators.
//!
//! Everything inside one tree is single-threaded; one physical record is fully
//! processed before the next is accepted.

use crate::aggregate::{AggregationStage, CommittingStage, Stage0Executor, Stage1Executor};
use crate::batch::{Anchor, BatchId, CommitSignal, PhysicalRecord, StartSignal};
use crate::codec;
use crate::config::{TaskConfig, TaskContext};
use crate::error::TaskError;
use crate::feed::{MessageId, UpstreamFeed};
use crate::fields::Fields;
use crate::graph::{GraphError, GraphView, NodeId, NodeKind, Operator, Topology};
use crate::lineage::{self, STAGE1_FIELD};
use crate::operation::{Collector, RecordFunction};
use crate::record::{AppendFactory, FreshFactory, ProjectionFactory, Record};
use crate::sink::{SinkProvider, SinkWriter};
use crate::value::{GroupKey, Value};
use crate::wait::WaitStrategy;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// What the hosting task tells its executors about their surroundings.
pub trait TaskOwner {
  /// Schema of the physical records delivered to the task root, if known.
  fn input_schema(&self) -> Option<&Fields>;

  /// Stream name a node's output is written to, if any.
  fn exposed_name(&self, node: NodeId) -> Option<&str>;
}

/// Field lineage of one node, resolved at build time.
#[derive(Clone, Debug)]
struct Lineage {
  input: Fields,
  logic_input: Fields,
  full_output: Fields,
}

enum ActiveStage {
  Stage0(Box<dyn AggregationStage>),
  Stage1(Box<dyn CommittingStage>),
}

impl ActiveStage {
  fn prepare(&mut self, config: &TaskConfig, context: &TaskContext) -> Result<(), TaskError> {
    match self {
      ActiveStage::Stage0(s) => s.prepare(config, context),
      ActiveStage::Stage1(s) => s.prepare(config, context),
    }
  }

  fn execute(&mut self, key: GroupKey, input: &Record) -> Result<(), TaskError> {
    match self {
      ActiveStage::Stage0(s) => s.execute(key, input),
      ActiveStage::Stage1(s) => s.execute(key, input),
    }
  }

  fn flush(&mut self, batch: BatchId, out: &mut dyn Collector) -> Result<(), TaskError> {
    match self {
      ActiveStage::Stage0(s) => s.flush(batch, out),
      ActiveStage::Stage1(s) => s.flush(batch, out),
    }
  }

  fn discard(&mut self) {
    match self {
      ActiveStage::Stage0(s) => s.discard(),
      ActiveStage::Stage1(s) => s.discard(),
    }
  }
}

enum KindState {
  Unprepared,
  Source {
    feed: Box<dyn UpstreamFeed>,
    output: FreshFactory,
    max_batch_size: usize,
    outstanding: HashMap<BatchId, Vec<MessageId>>,
    empty_streak: u64,
    wait: Box<dyn WaitStrategy>,
  },
  Function {
    function: Arc<dyn RecordFunction>,
    projection: ProjectionFactory,
    output: AppendFactory,
  },
  Projection {
    projection: ProjectionFactory,
  },
  GroupBy {
    projection: ProjectionFactory,
    key_positions: Vec<usize>,
    output: FreshFactory,
    stage: ActiveStage,
    open_batch: Option<BatchId>,
  },
  PassThrough,
}

/// How records reach an executor.
#[derive(Clone, Copy)]
enum Upstream<'a> {
  /// Task root: physical records with the owner's input schema.
  Root,
  /// Child of a fan-out or merge: physical records, decoded with the parent's factory.
  Physical(&'a FreshFactory),
  /// Child of any other executor: logical records.
  Logical,
}

type SinkRef<'a> = Option<&'a mut (dyn SinkWriter + 'static)>;

enum Output<'a> {
  Append(&'a AppendFactory, &'a Record),
  Fresh(&'a FreshFactory),
}

/// Collector handed to transforms and aggregation stages.
struct Outlet<'a> {
  output: Output<'a>,
  children: &'a mut [TaskExecutor],
  sink: SinkRef<'a>,
  anchor: Anchor,
}

impl Collector for Outlet<'_> {
  fn emit(&mut self, values: Vec<Value>) -> Result<(), TaskError> {
    let record = match self.output {
      Output::Append(factory, parent) => factory.create(parent, values)?,
      Output::Fresh(factory) => factory.create(values)?,
    };
    emit_record(self.children, self.sink.as_deref_mut(), self.anchor, record)
  }
}

fn emit_record(
  children: &mut [TaskExecutor],
  sink: SinkRef<'_>,
  anchor: Anchor,
  record: Record,
) -> Result<(), TaskError> {
  for child in children.iter_mut() {
    child.process(&record, anchor)?;
  }
  if let Some(sink) = sink {
    sink.emit(&record, anchor)?;
  }
  Ok(())
}

/// One node of a task's executor tree.
pub struct TaskExecutor {
  id: NodeId,
  label: String,
  op: Operator,
  lineage: Lineage,
  children: Vec<TaskExecutor>,
  state: KindState,
  decoder: Option<FreshFactory>,
  sink: Option<Box<dyn SinkWriter>>,
}

impl TaskExecutor {
  /// Compiles the subtree of `topology` rooted at `root`, restricted to `members`.
  pub fn build(
    topology: &Topology,
    root: NodeId,
    members: &BTreeSet<NodeId>,
  ) -> Result<TaskExecutor, GraphError> {
    let node = topology.node(root)?;
    let lineage = Lineage {
      input: lineage::input_fields(topology, root)?,
      logic_input: lineage::logic_input_fields(topology, root)?,
      full_output: lineage::full_output_fields(topology, root)?,
    };
    let children = topology
      .successors(root)
      .iter()
      .filter(|s| members.contains(*s))
      .map(|s| TaskExecutor::build(topology, *s, members))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(TaskExecutor {
      id: root,
      label: node.label(root),
      op: node.operator().clone(),
      lineage,
      children,
      state: KindState::Unprepared,
      decoder: None,
      sink: None,
    })
  }

  /// Node this executor runs.
  pub fn id(&self) -> NodeId {
    self.id
  }

  /// Node kind.
  pub fn kind(&self) -> NodeKind {
    self.op.kind()
  }

  /// Node label used in logs and state-store names.
  pub fn label(&self) -> &str {
    &self.label
  }

  /// Child executors inside this task.
  pub fn children(&self) -> &[TaskExecutor] {
    &self.children
  }

  /// Fields of records this executor emits.
  pub fn output_fields(&self) -> &Fields {
    &self.lineage.full_output
  }

  /// Consecutive empty ticks of a prepared source.
  pub fn empty_streak(&self) -> Option<u64> {
    match &self.state {
      KindState::Source { empty_streak, .. } => Some(*empty_streak),
      _ => None,
    }
  }

  /// Message ids a prepared source still holds for `batch`.
  pub fn outstanding(&self, batch: BatchId) -> Option<&[MessageId]> {
    match &self.state {
      KindState::Source { outstanding, .. } => outstanding.get(&batch).map(Vec::as_slice),
      _ => None,
    }
  }

  /// Batches a prepared source holds message ids for, ascending.
  pub fn outstanding_batches(&self) -> Vec<BatchId> {
    match &self.state {
      KindState::Source { outstanding, .. } => {
        let mut batches: Vec<BatchId> = outstanding.keys().copied().collect();
        batches.sort_unstable();
        batches
      }
      _ => Vec::new(),
    }
  }

  /// Prepares the whole tree.
  pub fn prepare(
    &mut self,
    config: &TaskConfig,
    context: &TaskContext,
    sinks: &dyn SinkProvider,
    owner: &dyn TaskOwner,
  ) -> Result<(), TaskError> {
    self.prepare_node(config, context, sinks, owner, Upstream::Root)
  }

  fn prepare_node(
    &mut self,
    config: &TaskConfig,
    context: &TaskContext,
    sinks: &dyn SinkProvider,
    owner: &dyn TaskOwner,
    upstream: Upstream<'_>,
  ) -> Result<(), TaskError> {
    let input = &self.lineage.input;
    self.decoder = match upstream {
      Upstream::Root => Some(FreshFactory::new(
        owner.input_schema().cloned().unwrap_or_else(|| input.clone()),
      )),
      Upstream::Physical(parent) => Some(parent.clone()),
      Upstream::Logical => None,
    };
    let record_fields = match &self.decoder {
      Some(d) => d.fields().clone(),
      None => input.clone(),
    };

    self.state = match &self.op {
      Operator::Source(spec) => {
        let mut feed = spec.feed.create(context.instance);
        feed.open(config, context)?;
        let wait = context.wait_strategies.resolve(config)?;
        KindState::Source {
          feed,
          output: FreshFactory::new(self.lineage.full_output.clone()),
          max_batch_size: config.max_batch_size.max(1),
          outstanding: HashMap::new(),
          empty_streak: 0,
          wait,
        }
      }
      Operator::Function(spec) => {
        spec.function.prepare(config, context)?;
        KindState::Function {
          function: Arc::clone(&spec.function),
          projection: ProjectionFactory::new(&record_fields, self.lineage.logic_input.clone())?,
          output: AppendFactory::new(&record_fields, spec.appended.clone()),
        }
      }
      Operator::Projection(spec) => KindState::Projection {
        projection: ProjectionFactory::new(&record_fields, spec.output.clone())?,
      },
      Operator::GroupBy(spec) => {
        let key_positions =
          record_fields
            .positions_of(&spec.key)
            .map_err(|field| TaskError::MissingKey {
              node: self.id,
              field,
            })?;
        let mut stage = if spec.stage0_flag {
          ActiveStage::Stage0(Box::new(Stage0Executor::new(Arc::clone(&spec.stage0))))
        } else {
          let pre_aggregated = self.lineage.logic_input == Fields::from([STAGE1_FIELD]);
          ActiveStage::Stage1(Box::new(Stage1Executor::new(
            Arc::clone(&spec.stage1),
            Arc::clone(&spec.store),
            Arc::clone(&spec.state),
            self.label.clone(),
            pre_aggregated,
          )))
        };
        stage.prepare(config, context)?;
        KindState::GroupBy {
          projection: ProjectionFactory::new(&record_fields, spec.input.clone())?,
          key_positions,
          output: FreshFactory::new(self.lineage.full_output.clone()),
          stage,
          open_batch: None,
        }
      }
      Operator::FanOut | Operator::Merge { .. } => KindState::PassThrough,
    };

    self.sink = match owner.exposed_name(self.id) {
      Some(name) => {
        debug!(node = %self.label, stream = name, "sink attached");
        Some(sinks.open(name, config, context)?)
      }
      None => None,
    };
    debug!(node = %self.label, kind = %self.kind(), children = self.children.len(), "prepared");

    let forward = match (&self.state, &self.decoder) {
      (KindState::PassThrough, Some(decoder)) => Some(decoder.clone()),
      _ => None,
    };
    let child_upstream = match &forward {
      Some(decoder) => Upstream::Physical(decoder),
      None => Upstream::Logical,
    };
    for child in &mut self.children {
      child.prepare_node(config, context, sinks, owner, child_upstream)?;
    }
    Ok(())
  }

  /// Handles one physical record delivered to this executor.
  pub fn execute(&mut self, record: &PhysicalRecord) -> Result<(), TaskError> {
    let id = self.id;
    if matches!(self.state, KindState::Unprepared) {
      return Err(TaskError::NotPrepared { node: id });
    }
    let is_source = matches!(self.state, KindState::Source { .. });
    let forwards = matches!(self.state, KindState::PassThrough) && self.decoder.is_some();
    match record {
      PhysicalRecord::Start(start) if is_source => self.pull_batch(*start),
      PhysicalRecord::Data { .. } if is_source => Err(TaskError::SourceOnDataPath { node: id }),
      PhysicalRecord::Data { .. } if forwards => {
        for child in &mut self.children {
          child.execute(record)?;
        }
        Ok(())
      }
      PhysicalRecord::Data { batch, payload } => {
        let decoder = self
          .decoder
          .clone()
          .ok_or(TaskError::NotPrepared { node: id })?;
        let anchor = Anchor::from(*batch);
        let mut count = 0usize;
        for values in codec::decode(payload.clone()) {
          let logical = decoder.create(values?)?;
          self.process(&logical, anchor)?;
          count += 1;
        }
        trace!(node = %self.label, %batch, records = count, "decoded");
        Ok(())
      }
      PhysicalRecord::Start(_) => Err(TaskError::UnexpectedRecord {
        node: id,
        detail: "a start signal".to_string(),
      }),
      PhysicalRecord::Commit(_) => Err(TaskError::UnexpectedRecord {
        node: id,
        detail: "a commit signal on the data path".to_string(),
      }),
    }
  }

  /// Runs one logical record through this executor.
  fn process(&mut self, input: &Record, anchor: Anchor) -> Result<(), TaskError> {
    let id = self.id;
    match &mut self.state {
      KindState::Unprepared => Err(TaskError::NotPrepared { node: id }),
      KindState::Source { .. } => Err(TaskError::SourceOnDataPath { node: id }),
      KindState::Function {
        function,
        projection,
        output,
      } => {
        let projected = projection.create(input)?;
        let mut outlet = Outlet {
          output: Output::Append(output, input),
          children: &mut self.children,
          sink: self.sink.as_deref_mut(),
          anchor,
        };
        function.execute(&projected, &mut outlet)
      }
      KindState::Projection { projection } => {
        let record = projection.create(input)?;
        emit_record(&mut self.children, self.sink.as_deref_mut(), anchor, record)
      }
      KindState::GroupBy {
        projection,
        key_positions,
        stage,
        open_batch,
        ..
      } => {
        if let Some(stale) = open_batch.replace(anchor.batch) {
          if stale != anchor.batch {
            warn!(
              node = %self.label,
              stale = %stale,
              batch = %anchor.batch,
              "batch changed without a flush, discarding accumulators"
            );
            stage.discard();
          }
        }
        let key = key_positions
          .iter()
          .map(|&i| {
            input.get(i).cloned().ok_or_else(|| TaskError::MissingKey {
              node: id,
              field: format!("#{i}"),
            })
          })
          .collect::<Result<Vec<_>, _>>()?;
        let projected = projection.create(input)?;
        stage.execute(GroupKey(key), &projected)
      }
      KindState::PassThrough => {
        emit_record(&mut self.children, self.sink.as_deref_mut(), anchor, input.clone())
      }
    }
  }

  /// Source batch-pull step for one start signal.
  fn pull_batch(&mut self, start: StartSignal) -> Result<(), TaskError> {
    let id = self.id;
    let KindState::Source {
      feed,
      output,
      max_batch_size,
      outstanding,
      empty_streak,
      wait,
    } = &mut self.state
    else {
      return Err(TaskError::NotPrepared { node: id });
    };

    if let Some(previous) = start.batch.previous() {
      if let Some(ids) = outstanding.remove(&previous) {
        for msg in &ids {
          if start.previous_failed {
            feed.fail(*msg)?;
          } else {
            feed.ack(*msg)?;
          }
        }
        debug!(
          node = %self.label,
          batch = %previous,
          count = ids.len(),
          failed = start.previous_failed,
          "resolved previous batch"
        );
      }
    }
    if !outstanding.is_empty() {
      warn!(
        node = %self.label,
        batch = %start.batch,
        retained = outstanding.len(),
        "message ids retained for batches other than the previous one"
      );
    }

    let anchor = Anchor::from(start.batch);
    let mut collected: Vec<MessageId> = Vec::new();
    let mut deferred: Option<TaskError> = None;
    for _ in 0..*max_batch_size {
      let emission = match feed.pull() {
        Ok(Some(emission)) => emission,
        Ok(None) => break,
        Err(e) => {
          deferred = Some(e.into());
          break;
        }
      };
      collected.push(emission.message_id);
      let emitted = output
        .create(emission.values)
        .map_err(TaskError::from)
        .and_then(|record| {
          emit_record(&mut self.children, self.sink.as_deref_mut(), anchor, record)
        });
      if let Err(e) = emitted {
        deferred = Some(e);
        break;
      }
    }

    if collected.is_empty() {
      *empty_streak += 1;
      wait.empty_emit(*empty_streak);
    } else {
      *empty_streak = 0;
    }
    trace!(node = %self.label, batch = %start.batch, pulled = collected.len(), "tick");

    let Some(fault) = deferred else {
      outstanding.entry(start.batch).or_default().extend(collected);
      return Ok(());
    };
    for msg in &collected {
      if let Err(e) = feed.fail(*msg) {
        warn!(node = %self.label, %msg, error = %e, "could not fail message");
      }
    }
    error!(
      node = %self.label,
      batch = %start.batch,
      failed = collected.len(),
      error = %fault,
      "pull failed"
    );
    Err(TaskError::PullFailed {
      node: id,
      batch: start.batch,
      source: Box::new(fault),
    })
  }

  /// Ends the anchor's batch: stage output, then the sink, then children.
  pub fn flush(&mut self, anchor: Anchor) -> Result<(), TaskError> {
    if let KindState::GroupBy {
      output,
      stage,
      open_batch,
      ..
    } = &mut self.state
    {
      if let Some(stale) = open_batch.take_if(|b| *b != anchor.batch) {
        warn!(
          node = %self.label,
          stale = %stale,
          batch = %anchor.batch,
          "flush for another batch, discarding accumulators"
        );
        stage.discard();
      }
      let mut outlet = Outlet {
        output: Output::Fresh(output),
        children: &mut self.children,
        sink: self.sink.as_deref_mut(),
        anchor,
      };
      stage.flush(anchor.batch, &mut outlet)?;
      *open_batch = None;
    }
    if let Some(sink) = self.sink.as_mut() {
      sink.flush(anchor)?;
    }
    for child in &mut self.children {
      child.flush(anchor)?;
    }
    Ok(())
  }

  /// Applies a commit or rollback signal, then recurses.
  pub fn commit(&mut self, record: &PhysicalRecord) -> Result<(), TaskError> {
    let PhysicalRecord::Commit(signal) = record else {
      return Err(TaskError::UnexpectedRecord {
        node: self.id,
        detail: "a non-commit record on the commit path".to_string(),
      });
    };
    if let KindState::GroupBy {
      stage, open_batch, ..
    } = &mut self.state
    {
      if let ActiveStage::Stage1(committing) = &mut *stage {
        committing.commit(*signal)?;
      }
      if let CommitSignal::Rollback(batch) = signal {
        stage.discard();
        *open_batch = None;
        trace!(node = %self.label, %batch, "accumulators discarded on rollback");
      }
    }
    for child in &mut self.children {
      child.commit(record)?;
    }
    Ok(())
  }
}

impl std::fmt::Debug for TaskExecutor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskExecutor")
      .field("node", &self.label)
      .field("kind", &self.kind())
      .field("children", &self.children)
      .finish()
  }
}
