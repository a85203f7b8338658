//! Batch identity and the physical records exchanged with the host.
//!
//! Batch ids are assigned by the [`BatchCoordinator`](crate::coordinator::BatchCoordinator)
//! and are assumed strictly sequential and gap-free: a source resolves the
//! outstanding messages of batch `n - 1` when it sees the start of batch `n`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically increasing batch identifier. The first batch is `1`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl BatchId {
  /// Creates a batch id from a raw value.
  #[inline]
  pub const fn new(id: u64) -> Self {
    Self(id)
  }

  /// Returns the raw value.
  #[inline]
  pub const fn as_u64(self) -> u64 {
    self.0
  }

  /// The batch immediately before this one, if any.
  pub fn previous(self) -> Option<BatchId> {
    self.0.checked_sub(1).map(BatchId)
  }

  /// The batch immediately after this one.
  pub fn next(self) -> BatchId {
    BatchId(self.0 + 1)
  }
}

impl fmt::Display for BatchId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "batch:{}", self.0)
  }
}

/// Tag attached to emitted records so the host can tie them to the batch
/// that produced them.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Anchor {
  /// Batch the anchored records belong to.
  pub batch: BatchId,
}

impl From<BatchId> for Anchor {
  fn from(batch: BatchId) -> Self {
    Self { batch }
  }
}

/// Control record that starts a batch at every source task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StartSignal {
  /// Batch being started.
  pub batch: BatchId,
  /// Whether the previous batch failed and its messages must be failed upstream.
  pub previous_failed: bool,
}

/// Commit-phase control record.
///
/// On the wire a rollback is the negated batch number; [`CommitSignal::to_wire`]
/// and [`CommitSignal::from_wire`] convert between the two forms.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CommitSignal {
  /// Make the batch's staged state durable.
  Commit(BatchId),
  /// Discard any staged, uncommitted state for the batch.
  Rollback(BatchId),
}

impl CommitSignal {
  /// The batch this signal refers to.
  pub fn batch(&self) -> BatchId {
    match self {
      CommitSignal::Commit(b) | CommitSignal::Rollback(b) => *b,
    }
  }

  /// Signed wire form: positive commits, negative rolls back.
  pub fn to_wire(&self) -> i64 {
    match self {
      CommitSignal::Commit(b) => b.0 as i64,
      CommitSignal::Rollback(b) => -(b.0 as i64),
    }
  }

  /// Parses the signed wire form.
  pub fn from_wire(id: i64) -> Self {
    if id < 0 {
      CommitSignal::Rollback(BatchId(id.unsigned_abs()))
    } else {
      CommitSignal::Commit(BatchId(id as u64))
    }
  }
}

/// Unit of delivery between the host and a task.
#[derive(Clone, Debug, PartialEq)]
pub enum PhysicalRecord {
  /// Batch start, delivered to source tasks.
  Start(StartSignal),
  /// Encoded logical records produced within `batch`.
  Data {
    /// Batch the payload belongs to.
    batch: BatchId,
    /// Bin-encoded logical records.
    payload: Bytes,
  },
  /// Commit or rollback, delivered to every task.
  Commit(CommitSignal),
}

impl PhysicalRecord {
  /// The batch id carried by the record.
  pub fn batch(&self) -> BatchId {
    match self {
      PhysicalRecord::Start(s) => s.batch,
      PhysicalRecord::Data { batch, .. } => *batch,
      PhysicalRecord::Commit(c) => c.batch(),
    }
  }

  /// Anchor for records derived from this one.
  pub fn anchor(&self) -> Anchor {
    Anchor::from(self.batch())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn first_batch_has_no_predecessor() {
    assert_eq!(BatchId::new(0).previous(), None);
    assert_eq!(BatchId::new(5).previous(), Some(BatchId::new(4)));
  }

  #[test]
  fn rollback_is_negated_on_the_wire() {
    assert_eq!(CommitSignal::Rollback(BatchId::new(7)).to_wire(), -7);
    assert_eq!(CommitSignal::from_wire(-7), CommitSignal::Rollback(BatchId::new(7)));
    assert_eq!(CommitSignal::from_wire(3), CommitSignal::Commit(BatchId::new(3)));
  }
}
