use crate::batch::{BatchId, CommitSignal, StartSignal};
use crate::coordinator::{BatchCoordinator, Phase, Signal};

fn signal(c: &mut BatchCoordinator) -> Option<Signal> {
  c.tick().map(|e| e.signal)
}

#[test]
fn test_phase_walk_with_failure() {
  let mut c = BatchCoordinator::new();
  assert_eq!(c.phase(), Phase::AwaitingStart);

  assert_eq!(
    signal(&mut c),
    Some(Signal::Start(StartSignal {
      batch: BatchId::new(1),
      previous_failed: false,
    }))
  );
  assert_eq!(c.phase(), Phase::Propagating);
  assert_eq!(signal(&mut c), None);

  c.ack();
  assert_eq!(c.phase(), Phase::ReadyToCommit);

  assert_eq!(
    signal(&mut c),
    Some(Signal::Commit(CommitSignal::Commit(BatchId::new(1))))
  );
  assert_eq!(c.phase(), Phase::AwaitingCommit);

  c.fail();
  assert_eq!(c.phase(), Phase::Rollback);
  assert!(c.last_failed());
  assert_eq!(
    signal(&mut c),
    Some(Signal::Commit(CommitSignal::Rollback(BatchId::new(1))))
  );

  c.ack();
  assert_eq!(c.phase(), Phase::AwaitingStart);
  assert_eq!(
    signal(&mut c),
    Some(Signal::Start(StartSignal {
      batch: BatchId::new(2),
      previous_failed: true,
    }))
  );
  assert!(!c.last_failed());
}

#[test]
fn test_successful_cycle_passes_through_cleanup() {
  let mut c = BatchCoordinator::new();
  signal(&mut c);
  c.ack();
  signal(&mut c);
  c.ack();
  assert_eq!(c.phase(), Phase::Rollback);
  assert!(!c.last_failed());
  assert_eq!(
    signal(&mut c),
    Some(Signal::Commit(CommitSignal::Rollback(BatchId::new(1))))
  );
  c.ack();
  assert!(matches!(
    signal(&mut c),
    Some(Signal::Start(StartSignal { previous_failed: false, .. }))
  ));
  assert_eq!(c.current_batch(), BatchId::new(2));
}

#[test]
fn test_rollback_is_emitted_once_per_entry() {
  let mut c = BatchCoordinator::new();
  signal(&mut c);
  c.fail();
  assert!(signal(&mut c).is_some());
  assert_eq!(signal(&mut c), None);
  assert_eq!(signal(&mut c), None);
  c.fail();
  assert!(signal(&mut c).is_some());
}

#[test]
fn test_commit_wire_form_of_rollback_is_negated_batch() {
  let mut c = BatchCoordinator::new();
  for _ in 0..3 {
    signal(&mut c);
    c.ack();
    signal(&mut c);
    c.ack();
    signal(&mut c);
    c.ack();
  }
  signal(&mut c);
  c.fail();
  match signal(&mut c) {
    Some(Signal::Commit(commit)) => assert_eq!(commit.to_wire(), -4),
    other => panic!("expected rollback, got {other:?}"),
  }
}
