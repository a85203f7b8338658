//! Upstream feeds: the pull-based inputs behind source nodes.
//!
//! A feed hands out one emission at a time, each tagged with an opaque
//! [`MessageId`]. The source executor records the ids of every emission pulled
//! for a batch and later acks or fails them all together, once the coordinator
//! has decided the batch's outcome. Feeds must accept ack/fail out of pull
//! order, and failing an id that is no longer in flight is a no-op.

use crate::config::{TaskConfig, TaskContext};
use crate::fields::Fields;
use crate::value::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

/// Opaque identifier of one upstream message.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
  /// Creates a message id from a raw value.
  #[inline]
  pub const fn new(id: u64) -> Self {
    Self(id)
  }

  /// Returns the raw value.
  #[inline]
  pub const fn as_u64(self) -> u64 {
    self.0
  }
}

impl fmt::Display for MessageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "msg:{}", self.0)
  }
}

/// One pulled message: its values in the feed's declared field order.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedEmission {
  /// Record values.
  pub values: Vec<Value>,
  /// Id to ack or fail once the batch resolves.
  pub message_id: MessageId,
}

/// Error type for upstream feeds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
  /// The feed could not be opened.
  #[error("failed to open feed: {0}")]
  Open(String),
  /// A pull failed.
  #[error("pull failed: {0}")]
  Pull(String),
  /// The feed refused an ack or fail.
  #[error("could not resolve {id}: {reason}")]
  Resolve {
    /// Message being resolved.
    id: MessageId,
    /// Reason given by the feed.
    reason: String,
  },
  /// The feed was used before `open`.
  #[error("feed is not open")]
  NotOpen,
}

/// A pull-based upstream source of records.
pub trait UpstreamFeed: Send {
  /// Connects the feed. Called once, at prepare time.
  fn open(&mut self, config: &TaskConfig, context: &TaskContext) -> Result<(), FeedError>;

  /// Pulls at most one emission. `Ok(None)` means nothing is available now.
  fn pull(&mut self) -> Result<Option<FeedEmission>, FeedError>;

  /// Confirms `id` was processed.
  fn ack(&mut self, id: MessageId) -> Result<(), FeedError>;

  /// Reports `id` as not processed; the feed decides whether to redeliver.
  fn fail(&mut self, id: MessageId) -> Result<(), FeedError>;
}

/// Creates one feed per source task instance.
pub trait FeedFactory: Send + Sync {
  /// Fields of every emission, in order.
  fn output_fields(&self) -> Fields;

  /// Creates the feed for instance `instance` of the source task.
  fn create(&self, instance: usize) -> Box<dyn UpstreamFeed>;
}

#[derive(Debug, Default)]
struct MemoryFeedState {
  next_id: u64,
  pending: VecDeque<(MessageId, Vec<Value>)>,
  in_flight: HashMap<MessageId, Vec<Value>>,
  acked: Vec<MessageId>,
  failed: Vec<MessageId>,
  pull_faults: VecDeque<(usize, String)>,
}

/// In-process queue feed with fail-driven redelivery.
///
/// Clones share one queue, so the test or host keeps a handle for pushing
/// messages and inspecting acks while executors pull from their own copies.
/// A failed message goes back to the front of the queue with its original id.
#[derive(Clone, Debug)]
pub struct MemoryFeed {
  fields: Fields,
  state: Arc<Mutex<MemoryFeedState>>,
  opened: bool,
}

impl MemoryFeed {
  /// Creates an empty feed emitting records with `fields`.
  pub fn new(fields: impl Into<Fields>) -> Self {
    Self {
      fields: fields.into(),
      state: Arc::new(Mutex::new(MemoryFeedState {
        next_id: 1,
        ..MemoryFeedState::default()
      })),
      opened: false,
    }
  }

  fn with_state<R>(&self, f: impl FnOnce(&mut MemoryFeedState) -> R) -> R {
    match self.state.lock() {
      Ok(mut guard) => f(&mut guard),
      Err(poisoned) => f(&mut poisoned.into_inner()),
    }
  }

  /// Enqueues a message and returns its id.
  pub fn push(&self, values: Vec<Value>) -> MessageId {
    self.with_state(|s| {
      let id = MessageId(s.next_id);
      s.next_id += 1;
      s.pending.push_back((id, values));
      id
    })
  }

  /// Enqueues a message under a caller-chosen id.
  pub fn push_with_id(&self, id: MessageId, values: Vec<Value>) {
    self.with_state(|s| {
      s.next_id = s.next_id.max(id.0 + 1);
      s.pending.push_back((id, values));
    })
  }

  /// Makes a future pull fail: after `successes` more successful pulls, the
  /// next pull returns [`FeedError::Pull`] with `reason`.
  pub fn fail_pull_after(&self, successes: usize, reason: impl Into<String>) {
    self.with_state(|s| s.pull_faults.push_back((successes, reason.into())))
  }

  /// Ids acked so far, in ack order.
  pub fn acked(&self) -> Vec<MessageId> {
    self.with_state(|s| s.acked.clone())
  }

  /// Ids failed so far, in fail order. Only ids that were in flight count.
  pub fn failed(&self) -> Vec<MessageId> {
    self.with_state(|s| s.failed.clone())
  }

  /// Messages waiting to be pulled.
  pub fn pending_len(&self) -> usize {
    self.with_state(|s| s.pending.len())
  }

  /// Messages pulled but neither acked nor failed.
  pub fn in_flight_len(&self) -> usize {
    self.with_state(|s| s.in_flight.len())
  }
}

impl UpstreamFeed for MemoryFeed {
  fn open(&mut self, _config: &TaskConfig, context: &TaskContext) -> Result<(), FeedError> {
    debug!(task = %context.task_name, instance = context.instance, "memory feed opened");
    self.opened = true;
    Ok(())
  }

  fn pull(&mut self) -> Result<Option<FeedEmission>, FeedError> {
    if !self.opened {
      return Err(FeedError::NotOpen);
    }
    self.with_state(|s| {
      if let Some((remaining, _)) = s.pull_faults.front_mut() {
        if *remaining == 0 {
          let (_, reason) = s.pull_faults.pop_front().unwrap_or_default();
          return Err(FeedError::Pull(reason));
        }
        *remaining -= 1;
      }
      let Some((id, values)) = s.pending.pop_front() else {
        return Ok(None);
      };
      s.in_flight.insert(id, values.clone());
      trace!(%id, "pulled");
      Ok(Some(FeedEmission {
        values,
        message_id: id,
      }))
    })
  }

  fn ack(&mut self, id: MessageId) -> Result<(), FeedError> {
    self.with_state(|s| {
      if s.in_flight.remove(&id).is_some() {
        s.acked.push(id);
      }
    });
    Ok(())
  }

  fn fail(&mut self, id: MessageId) -> Result<(), FeedError> {
    self.with_state(|s| {
      if let Some(values) = s.in_flight.remove(&id) {
        s.failed.push(id);
        s.pending.push_front((id, values));
      }
    });
    Ok(())
  }
}

impl FeedFactory for MemoryFeed {
  fn output_fields(&self) -> Fields {
    self.fields.clone()
  }

  fn create(&self, _instance: usize) -> Box<dyn UpstreamFeed> {
    Box::new(MemoryFeed {
      fields: self.fields.clone(),
      state: Arc::clone(&self.state),
      opened: false,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn opened(feed: &MemoryFeed) -> Box<dyn UpstreamFeed> {
    let mut f = feed.create(0);
    f.open(&TaskConfig::default(), &TaskContext::new("src")).unwrap();
    f
  }

  #[test]
  fn failed_messages_are_redelivered_with_same_id() {
    let feed = MemoryFeed::new(["word"]);
    let a = feed.push(vec![Value::from("a")]);
    let mut f = opened(&feed);
    let first = f.pull().unwrap().unwrap();
    assert_eq!(first.message_id, a);
    f.fail(a).unwrap();
    f.fail(a).unwrap();
    assert_eq!(feed.failed(), vec![a]);
    let again = f.pull().unwrap().unwrap();
    assert_eq!(again.message_id, a);
    f.ack(a).unwrap();
    assert_eq!(feed.acked(), vec![a]);
    assert!(f.pull().unwrap().is_none());
  }

  #[test]
  fn injected_fault_fires_after_successes() {
    let feed = MemoryFeed::new(["n"]);
    for i in 0..3 {
      feed.push(vec![Value::Int(i)]);
    }
    feed.fail_pull_after(1, "broker reset");
    let mut f = opened(&feed);
    assert!(f.pull().unwrap().is_some());
    assert_eq!(f.pull().unwrap_err(), FeedError::Pull("broker reset".into()));
    assert!(f.pull().unwrap().is_some());
  }

  #[test]
  fn pull_before_open_is_rejected() {
    let feed = MemoryFeed::new(["n"]);
    let mut f = feed.create(0);
    assert_eq!(f.pull().unwrap_err(), FeedError::NotOpen);
  }
}
