use batchweave::aggregate::Count;
use batchweave::batch::BatchId;
use batchweave::config::TaskConfig;
use batchweave::error::TaskError;
use batchweave::feed::{MemoryFeed, MessageId};
use batchweave::graph::{GraphBuilder, GroupBySpec, Topology};
use batchweave::operation::{Collector, RecordFunction};
use batchweave::record::Record;
use batchweave::config::TaskContext;
use batchweave::runtime::{BatchOutcome, LocalTopology, RuntimeError};
use batchweave::state::{InMemoryStateFactory, StateError, StateFactory, StateStore, Versioned};
use batchweave::value::{GroupKey, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn word_count(feed: &MemoryFeed, state: Arc<dyn StateFactory>) -> Topology {
  let split: Arc<dyn RecordFunction> =
    Arc::new(|r: &Record, out: &mut dyn Collector| -> Result<(), TaskError> {
      let line = r.get(0).and_then(Value::as_str).unwrap_or_default();
      for word in line.split_whitespace() {
        out.emit(vec![Value::from(word)])?;
      }
      Ok(())
    });
  let mut g = GraphBuilder::new("word-count");
  let lines = g.new_stream(Arc::new(feed.clone()));
  let words = g.each(lines, ["line"], split, ["word"]).unwrap();
  let words = g.project(words, ["word"]).unwrap();
  let counts = g
    .group_by_two_stage(
      words,
      GroupBySpec::new(["word"], ["word"], Arc::new(Count), state, ["count"]),
    )
    .unwrap();
  g.expose(counts, "counts").unwrap();
  g.build().unwrap()
}

fn counts(local: &LocalTopology, batch: u64) -> Vec<(String, i64)> {
  local
    .output("counts")
    .iter()
    .filter(|(b, _)| *b == BatchId::new(batch))
    .map(|(_, r)| {
      let word = r.get(0).and_then(Value::as_str).unwrap_or_default().to_string();
      (word, r.get(1).and_then(Value::as_int).unwrap_or_default())
    })
    .collect()
}

fn key(word: &str) -> GroupKey {
  GroupKey(vec![Value::from(word)])
}

#[tokio::test(flavor = "multi_thread")]
async fn test_word_count_accumulates_across_batches() {
  batchweave::logging::init_for_tests();
  let feed = MemoryFeed::new(["line"]);
  let state = InMemoryStateFactory::new();
  let topology = word_count(&feed, Arc::new(state.clone()));
  let mut local = LocalTopology::start(&topology, TaskConfig::default()).await.unwrap();
  assert_eq!(local.plan().tasks.len(), 2);

  feed.push(vec![Value::from("the cat the")]);
  feed.push(vec![Value::from("dog")]);
  let outcome = local.run_batch().await.unwrap();
  assert!(matches!(outcome, BatchOutcome::Committed(b) if b == BatchId::new(1)));
  assert_eq!(
    counts(&local, 1),
    vec![("the".to_string(), 2), ("cat".to_string(), 1), ("dog".to_string(), 1)]
  );
  assert_eq!(state.value(&key("the")), Some(Value::Int(2)));
  // batch 1 is acked when batch 2 starts
  assert!(feed.acked().is_empty());

  feed.push(vec![Value::from("the end")]);
  let outcome = local.run_batch().await.unwrap();
  assert!(outcome.is_committed());
  assert_eq!(feed.acked(), vec![MessageId::new(1), MessageId::new(2)]);
  assert_eq!(
    counts(&local, 2),
    vec![("the".to_string(), 3), ("end".to_string(), 1)]
  );
  assert_eq!(state.value(&key("the")), Some(Value::Int(3)));
  assert_eq!(state.value(&key("cat")), Some(Value::Int(1)));

  local.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_batch_commits_without_output() {
  let feed = MemoryFeed::new(["line"]);
  let state = InMemoryStateFactory::new();
  let topology = word_count(&feed, Arc::new(state.clone()));
  let mut local = LocalTopology::start(&topology, TaskConfig::default()).await.unwrap();

  let outcome = local.run_batch().await.unwrap();
  assert_eq!(outcome.batch(), BatchId::new(1));
  assert!(outcome.is_committed());
  assert!(local.output("counts").is_empty());
  assert!(state.snapshot().is_empty());

  local.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_batch_is_replayed_without_double_counting() {
  batchweave::logging::init_for_tests();
  let feed = MemoryFeed::new(["line"]);
  let state = InMemoryStateFactory::new();
  let topology = word_count(&feed, Arc::new(state.clone()));
  let mut local = LocalTopology::start(&topology, TaskConfig::default()).await.unwrap();

  feed.push(vec![Value::from("a b")]);
  feed.push(vec![Value::from("a")]);
  feed.fail_pull_after(1, "upstream hiccup");

  match local.run_batch().await.unwrap() {
    BatchOutcome::Failed { batch, error, .. } => {
      assert_eq!(batch, BatchId::new(1));
      assert!(matches!(error, TaskError::PullFailed { .. }));
    }
    other => panic!("expected a failed batch, got {other:?}"),
  }
  assert!(local.output("counts").is_empty());
  assert!(state.snapshot().is_empty());
  assert_eq!(feed.failed(), vec![MessageId::new(1)]);

  let outcome = local.run_batch().await.unwrap();
  assert!(matches!(outcome, BatchOutcome::Committed(b) if b == BatchId::new(2)));
  assert_eq!(
    counts(&local, 2),
    vec![("a".to_string(), 2), ("b".to_string(), 1)]
  );
  assert_eq!(state.value(&key("a")), Some(Value::Int(2)));

  let outcome = local.run_batch().await.unwrap();
  assert!(outcome.is_committed());
  assert_eq!(state.value(&key("a")), Some(Value::Int(2)));
  assert_eq!(feed.acked().len(), 2);
  assert_eq!(feed.in_flight_len(), 0);

  local.shutdown().await;
}

/// In-memory state whose next revert fails once when armed.
#[derive(Clone, Default)]
struct FailingRevert {
  inner: InMemoryStateFactory,
  armed: Arc<AtomicBool>,
}

struct FailingRevertStore {
  inner: Box<dyn StateStore>,
  armed: Arc<AtomicBool>,
}

impl StateStore for FailingRevertStore {
  fn get(&self, key: &GroupKey) -> Result<Option<Versioned>, StateError> {
    self.inner.get(key)
  }

  fn put(&mut self, key: GroupKey, value: Value, version: BatchId) -> Result<bool, StateError> {
    self.inner.put(key, value, version)
  }

  fn revert(&mut self) -> Result<(), StateError> {
    if self.armed.swap(false, Ordering::SeqCst) {
      return Err(StateError::Storage("volume detached".to_string()));
    }
    self.inner.revert()
  }
}

impl StateFactory for FailingRevert {
  fn make_store(
    &self,
    name: &str,
    context: &TaskContext,
  ) -> Result<Box<dyn StateStore>, StateError> {
    Ok(Box::new(FailingRevertStore {
      inner: self.inner.make_store(name, context)?,
      armed: Arc::clone(&self.armed),
    }))
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_fault_is_returned_and_commit_stands() {
  batchweave::logging::init_for_tests();
  let feed = MemoryFeed::new(["line"]);
  let state = FailingRevert::default();
  let topology = word_count(&feed, Arc::new(state.clone()));
  let mut local = LocalTopology::start(&topology, TaskConfig::default()).await.unwrap();

  feed.push(vec![Value::from("a a")]);
  state.armed.store(true, Ordering::SeqCst);
  match local.run_batch().await {
    Err(RuntimeError::Rollback { batch, source, .. }) => {
      assert_eq!(batch, BatchId::new(1));
      assert!(matches!(source, TaskError::State(StateError::Storage(_))));
    }
    other => panic!("expected a rollback fault, got {other:?}"),
  }
  assert_eq!(state.inner.value(&key("a")), Some(Value::Int(2)));

  let outcome = local.run_batch().await.unwrap();
  assert!(matches!(outcome, BatchOutcome::Committed(b) if b == BatchId::new(2)));
  assert_eq!(feed.acked(), vec![MessageId::new(1)]);
  assert!(feed.failed().is_empty());
  assert_eq!(state.inner.value(&key("a")), Some(Value::Int(2)));

  local.shutdown().await;
}
