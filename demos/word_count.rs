//! Word count over a few batches, with counts kept in a scratch directory.
//!
//! Run with `cargo run --example word_count`.

use batchweave::aggregate::Count;
use batchweave::config::TaskConfig;
use batchweave::error::TaskError;
use batchweave::feed::MemoryFeed;
use batchweave::graph::{GraphBuilder, GroupBySpec};
use batchweave::operation::{Collector, RecordFunction};
use batchweave::record::Record;
use batchweave::runtime::{BatchOutcome, LocalTopology};
use batchweave::state::FileStateFactory;
use batchweave::value::Value;
use std::sync::Arc;
use tracing::{Level, info, warn};

const TEXT: &[&str] = &[
  "the quick brown fox",
  "jumps over the lazy dog",
  "the dog sleeps",
  "a fox runs",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  batchweave::logging::init(Level::INFO);

  let config = TaskConfig::from_json(
    r#"{
      "topology.spout.max.batch.size": 2,
      "topology.spout.wait.strategy": "backoff",
      "topology.sink.max.bin.size": 64
    }"#,
  )?;
  let state_dir = tempfile::tempdir()?;

  let feed = MemoryFeed::new(["line"]);
  for line in TEXT {
    feed.push(vec![Value::from(*line)]);
  }

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
  g.set_name(lines, "lines")?;
  let words = g.each(lines, ["line"], split, ["word"])?;
  let words = g.project(words, ["word"])?;
  let spec = GroupBySpec::new(
    ["word"],
    ["word"],
    Arc::new(Count),
    Arc::new(FileStateFactory::new(state_dir.path())),
    ["count"],
  );
  let counts = g.group_by_two_stage(words, spec)?;
  g.set_name(counts, "word-counts")?;
  g.expose(counts, "counts")?;
  let topology = g.build()?;

  let mut local = LocalTopology::start(&topology, config).await?;
  while feed.pending_len() > 0 {
    match local.run_batch().await? {
      BatchOutcome::Committed(batch) => {
        for (_, record) in local.take_output("counts") {
          info!(%batch, values = ?record.values(), "count");
        }
      }
      BatchOutcome::Failed { batch, task, error } => {
        warn!(%batch, %task, %error, "batch failed, replaying");
      }
    }
  }
  // acks the last batch
  local.run_batch().await?;
  local.shutdown().await;
  info!(dir = %state_dir.path().display(), "state written");
  Ok(())
}
