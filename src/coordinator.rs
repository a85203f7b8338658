//! Global batch lifecycle.
//!
//! The [`BatchCoordinator`] is ticked once per scheduling opportunity and
//! cycles through five phases:
//!
//! ```text
//!   0 AwaitingStart ──tick: Start(n)──▶ 1 Propagating ──ack──▶ 2 ReadyToCommit
//!        ▲                                                          │ tick: Commit(n)
//!        │ack                                                       ▼
//!   4 Rollback ◀──────────────── fail (any phase) ──────────── 3 AwaitingCommit
//!     tick: Rollback(n)                                             │ack
//!                                                                   ▼
//!                                                                4 Rollback
//! ```
//!
//! An ack in phase 3 also lands in phase 4, whose rollback signal then only
//! clears leftovers of a batch that already committed. The next ack returns
//! to phase 0. A fail forces phase 4 from anywhere and marks the batch failed;
//! the next start signal carries that flag so sources fail the batch's
//! messages upstream.
//!
//! Nothing else decides batch boundaries: every executor reacts to the batch
//! ids carried in the records it sees.

use crate::batch::{BatchId, CommitSignal, StartSignal};
use rand::Rng;
use tracing::{debug, trace, warn};

/// Coordinator phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Phase {
  /// Next tick starts a batch.
  AwaitingStart = 0,
  /// The batch is flowing through the tasks.
  Propagating = 1,
  /// Next tick emits the commit signal.
  ReadyToCommit = 2,
  /// Waiting for the commit to be acknowledged.
  AwaitingCommit = 3,
  /// Tick emits the rollback signal.
  Rollback = 4,
}

impl Phase {
  fn advance(self) -> Phase {
    match self {
      Phase::AwaitingStart => Phase::Propagating,
      Phase::Propagating => Phase::ReadyToCommit,
      Phase::ReadyToCommit => Phase::AwaitingCommit,
      Phase::AwaitingCommit => Phase::Rollback,
      Phase::Rollback => Phase::AwaitingStart,
    }
  }
}

/// A control signal emitted by the coordinator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
  /// Start of a batch, delivered to source tasks.
  Start(StartSignal),
  /// Commit or rollback, delivered to every task.
  Commit(CommitSignal),
}

/// A signal together with the id under which the host tracks it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Emission {
  /// The signal.
  pub signal: Signal,
  /// Opaque id for the host's ack/fail tracking.
  pub message_id: u64,
}

/// The five-phase batch state machine.
#[derive(Debug)]
pub struct BatchCoordinator {
  phase: Phase,
  batch: BatchId,
  failed: bool,
  rollback_sent: bool,
}

impl Default for BatchCoordinator {
  fn default() -> Self {
    Self::new()
  }
}

impl BatchCoordinator {
  /// A coordinator in phase 0 that will start batch 1 first.
  pub fn new() -> Self {
    Self {
      phase: Phase::AwaitingStart,
      batch: BatchId::new(0),
      failed: false,
      rollback_sent: false,
    }
  }

  /// Current phase.
  pub fn phase(&self) -> Phase {
    self.phase
  }

  /// Latest batch started.
  pub fn current_batch(&self) -> BatchId {
    self.batch
  }

  /// Whether the current cycle has failed.
  pub fn last_failed(&self) -> bool {
    self.failed
  }

  fn emission(signal: Signal) -> Emission {
    Emission {
      signal,
      message_id: rand::thread_rng().r#gen(),
    }
  }

  /// Advances the state machine by one scheduling opportunity.
  ///
  /// Phase 4 emits its rollback once per entry into the phase, not on every
  /// tick; further ticks return `None` until the rollback is acked.
  pub fn tick(&mut self) -> Option<Emission> {
    match self.phase {
      Phase::AwaitingStart => {
        self.batch = self.batch.next();
        let start = StartSignal {
          batch: self.batch,
          previous_failed: self.failed,
        };
        self.failed = false;
        self.phase = Phase::Propagating;
        debug!(batch = %self.batch, previous_failed = start.previous_failed, "start");
        Some(Self::emission(Signal::Start(start)))
      }
      Phase::ReadyToCommit => {
        self.phase = Phase::AwaitingCommit;
        debug!(batch = %self.batch, "commit");
        Some(Self::emission(Signal::Commit(CommitSignal::Commit(self.batch))))
      }
      Phase::Rollback if !self.rollback_sent => {
        self.rollback_sent = true;
        debug!(batch = %self.batch, failed = self.failed, "rollback");
        Some(Self::emission(Signal::Commit(CommitSignal::Rollback(self.batch))))
      }
      Phase::Propagating | Phase::AwaitingCommit | Phase::Rollback => None,
    }
  }

  /// The last emitted signal was fully processed.
  pub fn ack(&mut self) {
    let from = self.phase;
    self.phase = from.advance();
    if self.phase == Phase::Rollback {
      self.rollback_sent = false;
    }
    trace!(?from, to = ?self.phase, "ack");
  }

  /// The last emitted signal, or the batch it belongs to, failed.
  pub fn fail(&mut self) {
    warn!(batch = %self.batch, phase = ?self.phase, "batch failed");
    self.phase = Phase::Rollback;
    self.failed = true;
    self.rollback_sent = false;
  }
}
