//! In-process host for a topology.
//!
//! [`LocalTopology`] plays the streaming substrate: it runs every task
//! instance on its own blocking tokio task, routes physical records between
//! tasks by stream name, ticks the [`BatchCoordinator`] and acks or fails the
//! batch depending on how the tasks fared. One call to
//! [`run_batch`](LocalTopology::run_batch) walks one full coordinator cycle.
//!
//! Within a batch, tasks are flushed in topological order of their roots, and
//! every record routed to a task is delivered before that task is flushed, so
//! all records of batch `n` reach a task before anything of batch `n + 1`.

use crate::batch::{Anchor, BatchId, CommitSignal, PhysicalRecord};
use crate::codec::{self, CodecError};
use crate::config::{TaskConfig, TaskContext};
use crate::coordinator::{BatchCoordinator, Signal};
use crate::error::TaskError;
use crate::executor::TaskExecutor;
use crate::fields::Fields;
use crate::graph::{GraphError, Topology};
use crate::plan::{self, TaskPlan, TaskSpec};
use crate::record::{FreshFactory, Record, RecordError};
use crate::sink::{ChannelOutput, Routed};
use crate::wait::WaitStrategyRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error type for the local runtime itself. Task faults are reported through
/// [`BatchOutcome::Failed`] instead.
#[derive(Error, Debug)]
pub enum RuntimeError {
  /// The topology could not be planned.
  #[error(transparent)]
  Graph(#[from] GraphError),
  /// A task instance failed to prepare.
  #[error("task '{task}' failed to prepare: {source}")]
  Prepare {
    /// Task name.
    task: String,
    /// Cause.
    #[source]
    source: TaskError,
  },
  /// A task worker stopped answering.
  #[error("task '{task}' worker is gone")]
  WorkerGone {
    /// Task name.
    task: String,
  },
  /// A task failed to apply the rollback that closes a cycle.
  ///
  /// The coordinator has already moved on; the next batch starts normally.
  #[error("task '{task}' failed to roll back {batch}: {source}")]
  Rollback {
    /// Batch being rolled back.
    batch: BatchId,
    /// Task name.
    task: String,
    /// Cause.
    #[source]
    source: TaskError,
  },
  /// The coordinator did not emit the signal the cycle expects.
  #[error("coordinator out of step: {0}")]
  OutOfStep(String),
  /// Collected output could not be decoded.
  #[error(transparent)]
  Codec(#[from] CodecError),
  /// Collected output did not fit its stream schema.
  #[error(transparent)]
  Record(#[from] RecordError),
}

/// How a batch ended.
#[derive(Debug)]
pub enum BatchOutcome {
  /// Every task processed and committed the batch.
  Committed(BatchId),
  /// A task failed; the batch was rolled back and will be replayed.
  Failed {
    /// Batch that failed.
    batch: BatchId,
    /// The task that failed.
    task: String,
    /// The fault.
    error: TaskError,
  },
}

impl BatchOutcome {
  /// The batch this outcome is about.
  pub fn batch(&self) -> BatchId {
    match self {
      BatchOutcome::Committed(b) => *b,
      BatchOutcome::Failed { batch, .. } => *batch,
    }
  }

  /// True if the batch committed.
  pub fn is_committed(&self) -> bool {
    matches!(self, BatchOutcome::Committed(_))
  }
}

type Reply = oneshot::Sender<Result<(), TaskError>>;

enum Command {
  Execute(PhysicalRecord, Reply),
  Flush(Anchor, Reply),
  Commit(PhysicalRecord, Reply),
}

struct Worker {
  task: usize,
  name: String,
  tx: mpsc::UnboundedSender<Command>,
  join: JoinHandle<()>,
}

impl Worker {
  async fn call(
    &self,
    make: impl FnOnce(Reply) -> Command,
  ) -> Result<Result<(), TaskError>, RuntimeError> {
    let (reply, rx) = oneshot::channel();
    let gone = || RuntimeError::WorkerGone {
      task: self.name.clone(),
    };
    self.tx.send(make(reply)).map_err(|_| gone())?;
    rx.await.map_err(|_| gone())
  }
}

fn spawn_worker(
  task: usize,
  spec: TaskSpec,
  mut executor: TaskExecutor,
  config: TaskConfig,
  context: TaskContext,
  output: ChannelOutput,
) -> (Worker, oneshot::Receiver<Result<(), TaskError>>) {
  let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
  let (ready_tx, ready_rx) = oneshot::channel();
  let name = format!("{}[{}]", spec.name, context.instance);
  let join = tokio::task::spawn_blocking(move || {
    let prepared = executor.prepare(&config, &context, &output, &spec);
    let ok = prepared.is_ok();
    let _ = ready_tx.send(prepared);
    if !ok {
      return;
    }
    while let Some(cmd) = rx.blocking_recv() {
      let (result, reply) = match cmd {
        Command::Execute(record, reply) => (executor.execute(&record), reply),
        Command::Flush(anchor, reply) => (executor.flush(anchor), reply),
        Command::Commit(record, reply) => (executor.commit(&record), reply),
      };
      let _ = reply.send(result);
    }
    debug!(task = %spec.name, instance = context.instance, "worker stopped");
  });
  (
    Worker {
      task,
      name,
      tx,
      join,
    },
    ready_rx,
  )
}

/// A topology running in this process.
pub struct LocalTopology {
  plan: TaskPlan,
  coordinator: BatchCoordinator,
  workers: Vec<Worker>,
  router: mpsc::UnboundedReceiver<Routed>,
  collected: HashMap<String, Vec<(BatchId, Record)>>,
}

impl LocalTopology {
  /// Plans `topology` and starts every task instance with the built-in wait strategies.
  pub async fn start(topology: &Topology, config: TaskConfig) -> Result<Self, RuntimeError> {
    Self::start_with(topology, config, Arc::new(WaitStrategyRegistry::default())).await
  }

  /// Like [`start`](Self::start), resolving wait strategies from `registry`.
  pub async fn start_with(
    topology: &Topology,
    config: TaskConfig,
    registry: Arc<WaitStrategyRegistry>,
  ) -> Result<Self, RuntimeError> {
    let plan = plan::plan(topology)?;
    let (router_tx, router) = mpsc::unbounded_channel();
    let output = ChannelOutput::new(router_tx);

    let mut workers = Vec::new();
    let mut pending = Vec::new();
    for (index, spec) in plan.tasks.iter().enumerate() {
      for instance in 0..spec.parallelism {
        let executor = TaskExecutor::build(topology, spec.root, &spec.members)?;
        let context = TaskContext::new(spec.name.clone())
          .with_instance(instance, spec.parallelism)
          .with_wait_strategies(Arc::clone(&registry));
        let (worker, ready) = spawn_worker(
          index,
          spec.clone(),
          executor,
          config.clone(),
          context,
          output.clone(),
        );
        pending.push((worker.name.clone(), ready));
        workers.push(worker);
      }
    }
    for (task, ready) in pending {
      match ready.await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => return Err(RuntimeError::Prepare { task, source }),
        Err(_) => return Err(RuntimeError::WorkerGone { task }),
      }
    }
    info!(
      topology = topology.name(),
      tasks = plan.tasks.len(),
      instances = workers.len(),
      "topology started"
    );
    Ok(Self {
      plan,
      coordinator: BatchCoordinator::new(),
      workers,
      router,
      collected: HashMap::new(),
    })
  }

  /// The task plan being run.
  pub fn plan(&self) -> &TaskPlan {
    &self.plan
  }

  /// Records committed on the exposed stream `stream` so far, with their batch.
  pub fn output(&self, stream: &str) -> &[(BatchId, Record)] {
    self.collected.get(stream).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Removes and returns the records collected for `stream`.
  pub fn take_output(&mut self, stream: &str) -> Vec<(BatchId, Record)> {
    self.collected.remove(stream).unwrap_or_default()
  }

  fn tick(&mut self) -> Result<Signal, RuntimeError> {
    self.coordinator
      .tick()
      .map(|e| e.signal)
      .ok_or_else(|| RuntimeError::OutOfStep(format!("no signal in {:?}", self.coordinator.phase())))
  }

  /// Sends a command to every worker whose task matches `filter`; stops at the first fault.
  async fn broadcast(
    &self,
    filter: impl Fn(&TaskSpec) -> bool,
    make: impl Fn(Reply) -> Command,
  ) -> Result<Option<(String, TaskError)>, RuntimeError> {
    for worker in &self.workers {
      if !filter(&self.plan.tasks[worker.task]) {
        continue;
      }
      if let Err(e) = worker.call(&make).await? {
        return Ok(Some((worker.name.clone(), e)));
      }
    }
    Ok(None)
  }

  /// Delivers everything routed so far, staging records of exposed streams.
  async fn route(
    &mut self,
    staged: &mut Vec<(String, PhysicalRecord)>,
  ) -> Result<Option<(String, TaskError)>, RuntimeError> {
    while let Ok(Routed { stream, record }) = self.router.try_recv() {
      if self.plan.user_streams.contains(&stream) {
        staged.push((stream.clone(), record.clone()));
      }
      for task in self.plan.subscribers(&stream) {
        for worker in self.workers.iter().filter(|w| w.task == task) {
          let cmd_record = record.clone();
          if let Err(e) = worker.call(|r| Command::Execute(cmd_record, r)).await? {
            return Ok(Some((worker.name.clone(), e)));
          }
        }
      }
    }
    Ok(None)
  }

  async fn process(
    &mut self,
    start: PhysicalRecord,
    staged: &mut Vec<(String, PhysicalRecord)>,
  ) -> Result<Option<(String, TaskError)>, RuntimeError> {
    let anchor = start.anchor();
    let fault = self
      .broadcast(
        |t| t.input_streams.is_empty(),
        |r| Command::Execute(start.clone(), r),
      )
      .await?;
    if fault.is_some() {
      return Ok(fault);
    }
    for task in 0..self.plan.tasks.len() {
      if let Some(fault) = self.route(staged).await? {
        return Ok(Some(fault));
      }
      for worker in self.workers.iter().filter(|w| w.task == task) {
        if let Err(e) = worker.call(|r| Command::Flush(anchor, r)).await? {
          return Ok(Some((worker.name.clone(), e)));
        }
      }
    }
    self.route(staged).await
  }

  /// Runs one full coordinator cycle: start, propagate, commit.
  ///
  /// Task faults before the commit land in [`BatchOutcome::Failed`]. A fault
  /// while applying the closing rollback is returned as
  /// [`RuntimeError::Rollback`]; the batch's commit, if any, stands.
  pub async fn run_batch(&mut self) -> Result<BatchOutcome, RuntimeError> {
    let start = match self.tick()? {
      Signal::Start(s) => PhysicalRecord::Start(s),
      other => return Err(RuntimeError::OutOfStep(format!("expected start, got {other:?}"))),
    };
    let batch = start.batch();
    let mut staged = Vec::new();

    let mut fault = self.process(start, &mut staged).await?;
    if fault.is_none() {
      self.coordinator.ack();
      let commit = match self.tick()? {
        Signal::Commit(c @ CommitSignal::Commit(_)) => PhysicalRecord::Commit(c),
        other => {
          return Err(RuntimeError::OutOfStep(format!("expected commit, got {other:?}")));
        }
      };
      fault = self
        .broadcast(|_| true, |r| Command::Commit(commit.clone(), r))
        .await?;
    }

    if let Some((task, error)) = fault {
      error!(%batch, task = %task, error = %error, "batch failed");
      self.coordinator.fail();
      self.rollback(batch).await?;
      while self.router.try_recv().is_ok() {}
      return Ok(BatchOutcome::Failed { batch, task, error });
    }

    self.coordinator.ack();
    self.rollback(batch).await?;
    for (stream, record) in staged {
      self.collect(&stream, &record)?;
    }
    debug!(%batch, "batch committed");
    Ok(BatchOutcome::Committed(batch))
  }

  /// Emits the rollback signal of the current cycle and acks it.
  async fn rollback(&mut self, batch: BatchId) -> Result<(), RuntimeError> {
    let record = match self.tick()? {
      Signal::Commit(c @ CommitSignal::Rollback(_)) => PhysicalRecord::Commit(c),
      other => {
        return Err(RuntimeError::OutOfStep(format!("expected rollback, got {other:?}")));
      }
    };
    let fault = self
      .broadcast(|_| true, |r| Command::Commit(record.clone(), r))
      .await?;
    self.coordinator.ack();
    match fault {
      Some((task, source)) => {
        error!(%batch, task = %task, error = %source, "rollback failed");
        Err(RuntimeError::Rollback {
          batch,
          task,
          source,
        })
      }
      None => Ok(()),
    }
  }

  fn collect(&mut self, stream: &str, record: &PhysicalRecord) -> Result<(), RuntimeError> {
    let PhysicalRecord::Data { batch, payload } = record else {
      return Ok(());
    };
    let fields = self
      .plan
      .streams
      .get(stream)
      .cloned()
      .unwrap_or_else(Fields::empty);
    let factory = FreshFactory::new(fields);
    let out = self.collected.entry(stream.to_string()).or_default();
    for values in codec::decode(payload.clone()) {
      out.push((*batch, factory.create(values?)?));
    }
    Ok(())
  }

  /// Stops every worker and waits for them to exit.
  pub async fn shutdown(self) {
    let mut joins = Vec::with_capacity(self.workers.len());
    for worker in self.workers {
      drop(worker.tx);
      joins.push((worker.name, worker.join));
    }
    for (name, join) in joins {
      if let Err(e) = join.await {
        warn!(task = %name, error = %e, "worker panicked");
      }
    }
  }
}
