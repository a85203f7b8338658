use crate::batch::BatchId;
use crate::error::TaskError;
use crate::feed::FeedError;
use crate::graph::{GraphError, NodeId};
use std::error::Error as _;

#[test]
fn test_pull_failed_keeps_source() {
  let err = TaskError::PullFailed {
    node: NodeId::new(0),
    batch: BatchId::new(3),
    source: Box::new(TaskError::Feed(FeedError::Pull("broker gone".into()))),
  };
  let msg = err.to_string();
  assert!(msg.contains("batch:3"), "{msg}");
  assert!(err.source().is_some());
}

#[test]
fn test_graph_errors_are_construction_faults() {
  let err: TaskError = GraphError::UnknownNode(NodeId::new(9)).into();
  assert!(err.is_construction());
  assert!(!TaskError::transform("boom").is_construction());
}

#[test]
fn test_transform_helper_formats_cause() {
  let err = TaskError::transform(std::io::Error::other("disk"));
  assert_eq!(err.to_string(), "transform failed: disk");
}
