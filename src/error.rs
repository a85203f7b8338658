//! # Task errors
//!
//! Every concern owns its own error enum (`GraphError`, `CodecError`,
//! `FeedError`, ...). [`TaskError`] is what the executor tree returns from
//! `prepare`, `execute`, `flush` and `commit`: it wraps each of those with
//! `#[from]` so `?` works across module boundaries, and adds the faults that
//! only the interpreter itself can raise.
//!
//! ## Fault classes
//!
//! - **Construction**: a bad graph or unresolvable lineage. Fatal.
//! - **Upstream pull**: surfaced as [`TaskError::PullFailed`] after every
//!   message id collected in the tick has been failed on the feed.
//! - **Transform / aggregation**: raised by user code and propagated through
//!   the tree unchanged.
//! - **Wait strategy**: raised at prepare time, naming the strategy.

use crate::aggregate::AggregationError;
use crate::batch::BatchId;
use crate::codec::CodecError;
use crate::feed::FeedError;
use crate::graph::{GraphError, NodeId};
use crate::record::RecordError;
use crate::sink::SinkError;
use crate::state::StateError;
use crate::wait::WaitStrategyError;
use thiserror::Error;

/// Error raised by a task executor tree.
#[derive(Error, Debug)]
pub enum TaskError {
  /// Graph wiring or lineage fault.
  #[error(transparent)]
  Graph(#[from] GraphError),
  /// A record did not fit its schema.
  #[error(transparent)]
  Record(#[from] RecordError),
  /// A physical payload could not be decoded or encoded.
  #[error(transparent)]
  Codec(#[from] CodecError),
  /// A sink writer failed.
  #[error(transparent)]
  Sink(#[from] SinkError),
  /// The upstream feed failed.
  #[error(transparent)]
  Feed(#[from] FeedError),
  /// An aggregator failed.
  #[error(transparent)]
  Aggregation(#[from] AggregationError),
  /// The state store failed.
  #[error(transparent)]
  State(#[from] StateError),
  /// The configured wait strategy could not be created.
  #[error(transparent)]
  WaitStrategy(#[from] WaitStrategyError),
  /// A user transform failed.
  #[error("transform failed: {0}")]
  Transform(String),
  /// A data record reached a source executor.
  #[error("source node {node} received a data record")]
  SourceOnDataPath {
    /// Source node.
    node: NodeId,
  },
  /// A control record reached an executor that cannot handle it.
  #[error("node {node} cannot handle {detail}")]
  UnexpectedRecord {
    /// Receiving node.
    node: NodeId,
    /// What was received.
    detail: String,
  },
  /// An operation ran before `prepare`.
  #[error("node {node} used before prepare")]
  NotPrepared {
    /// Node.
    node: NodeId,
  },
  /// A record lacks a grouping-key field.
  #[error("node {node}: record has no key field '{field}'")]
  MissingKey {
    /// Group-by node.
    node: NodeId,
    /// Missing key field.
    field: String,
  },
  /// The source tick for `batch` failed; every id it collected was failed upstream.
  #[error("source {node} failed pulling {batch}: {source}")]
  PullFailed {
    /// Source node.
    node: NodeId,
    /// Batch being pulled.
    batch: BatchId,
    /// Deferred fault.
    #[source]
    source: Box<TaskError>,
  },
}

impl TaskError {
  /// Builds a transform fault from any displayable error.
  pub fn transform(err: impl std::fmt::Display) -> Self {
    TaskError::Transform(err.to_string())
  }

  /// True for faults raised while wiring the graph or resolving lineage.
  pub fn is_construction(&self) -> bool {
    matches!(self, TaskError::Graph(_) | TaskError::NotPrepared { .. })
  }
}
