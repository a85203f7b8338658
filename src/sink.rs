//! Sinks: named, externally visible outputs of a node.
//!
//! A node whose output is exposed under a stream name gets a [`SinkWriter`]
//! at prepare time. Every record the node emits is written to it, anchored to
//! the batch being processed, and the writer is flushed at the end of every
//! batch.
//!
//! [`BinningWriter`] is the codec-backed writer used by the local runtime: it
//! packs logical records into bins of at most `topology.sink.max.bin.size`
//! records and sends each bin as one [`PhysicalRecord::Data`].

use crate::batch::{Anchor, BatchId, PhysicalRecord};
use crate::codec::{BinEncoder, CodecError};
use crate::config::{TaskConfig, TaskContext};
use crate::record::Record;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

/// Error type for sink writers.
#[derive(Error, Debug)]
pub enum SinkError {
  /// A record could not be encoded.
  #[error(transparent)]
  Codec(#[from] CodecError),
  /// The receiving side of the stream is gone.
  #[error("stream '{stream}' is closed")]
  Closed {
    /// Stream name.
    stream: String,
  },
  /// The writer could not be opened.
  #[error("cannot open sink '{name}': {reason}")]
  Open {
    /// Stream name.
    name: String,
    /// Reason.
    reason: String,
  },
}

/// Writer bound to one exposed stream.
pub trait SinkWriter: Send {
  /// Writes one record produced within the anchor's batch.
  fn emit(&mut self, record: &Record, anchor: Anchor) -> Result<(), SinkError>;

  /// Pushes out everything buffered for the anchor's batch.
  fn flush(&mut self, anchor: Anchor) -> Result<(), SinkError>;
}

/// Opens sink writers by stream name.
pub trait SinkProvider: Send + Sync {
  /// Opens the writer for `name`.
  fn open(
    &self,
    name: &str,
    config: &TaskConfig,
    context: &TaskContext,
  ) -> Result<Box<dyn SinkWriter>, SinkError>;
}

/// A physical record addressed to a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Routed {
  /// Stream name.
  pub stream: String,
  /// Record to deliver to the stream's subscribers.
  pub record: PhysicalRecord,
}

/// Opens [`BinningWriter`]s that send to one channel.
#[derive(Clone, Debug)]
pub struct ChannelOutput {
  tx: UnboundedSender<Routed>,
}

impl ChannelOutput {
  /// Creates a provider sending to `tx`.
  pub fn new(tx: UnboundedSender<Routed>) -> Self {
    Self { tx }
  }
}

impl SinkProvider for ChannelOutput {
  fn open(
    &self,
    name: &str,
    config: &TaskConfig,
    _context: &TaskContext,
  ) -> Result<Box<dyn SinkWriter>, SinkError> {
    if self.tx.is_closed() {
      return Err(SinkError::Open {
        name: name.to_string(),
        reason: "router is closed".to_string(),
      });
    }
    Ok(Box::new(BinningWriter::new(
      name,
      config.max_bin_size,
      self.tx.clone(),
    )))
  }
}

/// Packs records into bins, one batch at a time.
#[derive(Debug)]
pub struct BinningWriter {
  stream: String,
  max_bin_size: usize,
  batch: Option<BatchId>,
  encoder: BinEncoder,
  tx: UnboundedSender<Routed>,
}

impl BinningWriter {
  /// Creates a writer for `stream`. A `max_bin_size` of 0 is treated as 1.
  pub fn new(stream: impl Into<String>, max_bin_size: usize, tx: UnboundedSender<Routed>) -> Self {
    Self {
      stream: stream.into(),
      max_bin_size: max_bin_size.max(1),
      batch: None,
      encoder: BinEncoder::new(),
      tx,
    }
  }

  fn drop_stale(&mut self, batch: BatchId) {
    if let Some(current) = self.batch {
      if current != batch && !self.encoder.is_empty() {
        warn!(
          stream = %self.stream,
          stale = %current,
          records = self.encoder.len(),
          "dropping records of a batch that was never flushed"
        );
        self.encoder.clear();
      }
    }
    self.batch = Some(batch);
  }

  fn cut(&mut self, batch: BatchId) -> Result<(), SinkError> {
    let records = self.encoder.len();
    let payload = self.encoder.finish();
    trace!(stream = %self.stream, %batch, records, bytes = payload.len(), "bin");
    self.tx
      .send(Routed {
        stream: self.stream.clone(),
        record: PhysicalRecord::Data { batch, payload },
      })
      .map_err(|_| SinkError::Closed {
        stream: self.stream.clone(),
      })
  }
}

impl SinkWriter for BinningWriter {
  fn emit(&mut self, record: &Record, anchor: Anchor) -> Result<(), SinkError> {
    self.drop_stale(anchor.batch);
    self.encoder.push(record.values())?;
    if self.encoder.len() >= self.max_bin_size {
      self.cut(anchor.batch)?;
    }
    Ok(())
  }

  fn flush(&mut self, anchor: Anchor) -> Result<(), SinkError> {
    self.drop_stale(anchor.batch);
    if self.encoder.is_empty() {
      return Ok(());
    }
    self.cut(anchor.batch)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::decode;
  use crate::fields::Fields;
  use crate::value::Value;
  use tokio::sync::mpsc;

  fn record(n: i64) -> Record {
    Record::new(Fields::from(["n"]), vec![Value::Int(n)]).unwrap()
  }

  fn payload_len(routed: &Routed) -> usize {
    match &routed.record {
      PhysicalRecord::Data { payload, .. } => decode(payload.clone()).count(),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn bins_are_cut_at_max_size_and_on_flush() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut w = BinningWriter::new("out", 2, tx);
    let anchor = Anchor::from(BatchId::new(1));
    for n in 0..5 {
      w.emit(&record(n), anchor).unwrap();
    }
    w.flush(anchor).unwrap();
    let mut sizes = Vec::new();
    while let Ok(r) = rx.try_recv() {
      assert_eq!(r.stream, "out");
      sizes.push(payload_len(&r));
    }
    assert_eq!(sizes, vec![2, 2, 1]);
  }

  #[test]
  fn unflushed_records_of_an_older_batch_are_dropped() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut w = BinningWriter::new("out", 10, tx);
    w.emit(&record(1), Anchor::from(BatchId::new(1))).unwrap();
    w.emit(&record(2), Anchor::from(BatchId::new(2))).unwrap();
    w.flush(Anchor::from(BatchId::new(2))).unwrap();
    let r = rx.try_recv().unwrap();
    assert_eq!(r.record.batch(), BatchId::new(2));
    assert_eq!(payload_len(&r), 1);
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn closed_channel_is_reported() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let mut w = BinningWriter::new("gone", 1, tx);
    let err = w.emit(&record(1), Anchor::from(BatchId::new(1))).unwrap_err();
    assert!(matches!(err, SinkError::Closed { ref stream } if stream == "gone"));
  }
}
