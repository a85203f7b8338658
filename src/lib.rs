//! # Batchweave
//!
//! Batch dataflow plans on a streaming substrate.
//!
//! Batchweave runs a DAG of typed operators (sources, per-record functions,
//! projections, fan-outs, merges and grouped aggregations) against a host
//! that only guarantees per-batch, at-least-once delivery with explicit
//! ack/fail. Grouped aggregation stays exactly-once: stage-1 state is written
//! per batch with versioned, idempotent puts, and only when the batch commits.
//!
//! ## Key Pieces
//!
//! - **Operator graph**: [`graph::GraphBuilder`] builds and validates a DAG and
//!   seals it into a [`graph::Topology`]; [`lineage`] answers which fields each
//!   node sees and produces.
//! - **Batch coordinator**: [`coordinator::BatchCoordinator`], the five-phase
//!   start / commit / rollback cycle.
//! - **Task interpreter**: [`executor::TaskExecutor`], the per-task executor
//!   tree with `prepare`, `execute`, `flush` and `commit`.
//! - **Aggregation stages**: [`aggregate`], two-stage commutative aggregation
//!   over [`state`] stores.
//! - **Batch codec**: [`codec`], many logical records per physical record.
//! - **Local runtime**: [`runtime::LocalTopology`] hosts a whole topology in
//!   process on tokio.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batchweave::aggregate::Count;
//! use batchweave::config::TaskConfig;
//! use batchweave::feed::MemoryFeed;
//! use batchweave::graph::{GraphBuilder, GroupBySpec};
//! use batchweave::runtime::LocalTopology;
//! use batchweave::state::InMemoryStateFactory;
//! use batchweave::value::Value;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let feed = MemoryFeed::new(["word"]);
//! feed.push(vec![Value::from("hello")]);
//!
//! let mut g = GraphBuilder::new("word-count");
//! let words = g.new_stream(Arc::new(feed.clone()));
//! let spec = GroupBySpec::new(["word"], ["word"], Arc::new(Count), Arc::new(InMemoryStateFactory::new()), ["count"]);
//! let counts = g.group_by_two_stage(words, spec)?;
//! g.expose(counts, "counts")?;
//!
//! let mut local = LocalTopology::start(&g.build()?, TaskConfig::default()).await?;
//! local.run_batch().await?;
//! for (batch, record) in local.output("counts") {
//!     println!("{batch}: {:?}", record.values());
//! }
//! local.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Batch ids, anchors and the physical records exchanged with the host.
pub mod batch;
/// Bin codec for logical records inside physical records.
pub mod codec;
/// Task configuration and context.
pub mod config;
/// Global batch-commit state machine.
pub mod coordinator;
/// Task errors.
pub mod error;
/// Task executor trees.
pub mod executor;
/// Pull-based upstream feeds.
pub mod feed;
/// Ordered field names.
pub mod fields;
/// Operator graph construction and sealed topologies.
pub mod graph;
/// Field lineage queries.
pub mod lineage;
/// Subscriber setup.
pub mod logging;
/// Per-record user transforms.
pub mod operation;
/// Partitioning a topology into tasks.
pub mod plan;
/// Logical records and record factories.
pub mod record;
/// In-process host.
pub mod runtime;
/// Sink writers for exposed streams.
pub mod sink;
/// Exactly-once state stores for grouped aggregation.
pub mod state;
/// Two-stage grouped aggregation.
pub mod aggregate;
/// Field values and grouping keys.
pub mod value;
/// Wait strategies for empty source ticks.
pub mod wait;

#[cfg(test)]
mod coordinator_test;
#[cfg(test)]
mod error_test;
#[cfg(test)]
mod graph_test;
