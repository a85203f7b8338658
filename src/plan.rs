//! Splitting a sealed topology into tasks.
//!
//! Every source, fan-out and merge node roots a task. A task owns its root
//! plus every node reachable from it without passing through another root, so
//! each non-root node belongs to exactly one task. Records cross task
//! boundaries only through named streams: the output of a node that feeds
//! another task's root is written to `stream-<index>`, unless the node was
//! exposed under a name of its own.

use crate::executor::TaskOwner;
use crate::fields::Fields;
use crate::graph::{GraphError, GraphView, NodeId, NodeKind, Topology};
use crate::lineage;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// One task of a plan.
#[derive(Clone, Debug)]
pub struct TaskSpec {
  /// Task name (the root node's label).
  pub name: String,
  /// Root node.
  pub root: NodeId,
  /// Root and every node compiled into the same executor tree.
  pub members: BTreeSet<NodeId>,
  /// Streams delivering records to the root. Empty for sources.
  pub input_streams: Vec<String>,
  /// Schema of records on the input streams.
  pub input_schema: Option<Fields>,
  /// Member nodes whose output is written to a stream.
  pub exposed: HashMap<NodeId, String>,
  /// Number of parallel instances.
  pub parallelism: usize,
}

impl TaskOwner for TaskSpec {
  fn input_schema(&self) -> Option<&Fields> {
    self.input_schema.as_ref()
  }

  fn exposed_name(&self, node: NodeId) -> Option<&str> {
    self.exposed.get(&node).map(String::as_str)
  }
}

/// A topology split into tasks, in topological order of their roots.
#[derive(Clone, Debug)]
pub struct TaskPlan {
  /// Tasks; sources come before the tasks they feed.
  pub tasks: Vec<TaskSpec>,
  /// Every stream with the schema of its records.
  pub streams: HashMap<String, Fields>,
  /// Streams exposed by name on the graph builder.
  pub user_streams: BTreeSet<String>,
}

impl TaskPlan {
  /// Indices of the tasks whose root reads `stream`.
  pub fn subscribers(&self, stream: &str) -> Vec<usize> {
    self.tasks
      .iter()
      .enumerate()
      .filter(|(_, t)| t.input_streams.iter().any(|s| s == stream))
      .map(|(i, _)| i)
      .collect()
  }
}

fn is_root(kind: NodeKind) -> bool {
  matches!(kind, NodeKind::Source | NodeKind::FanOut | NodeKind::Merge)
}

/// Name of the stream carrying `node`'s output.
pub fn stream_name(topology: &Topology, node: NodeId) -> String {
  topology
    .exposed_name(node)
    .map(str::to_string)
    .unwrap_or_else(|| format!("stream-{}", node.index()))
}

/// Splits `topology` into tasks.
pub fn plan(topology: &Topology) -> Result<TaskPlan, GraphError> {
  let mut roots = Vec::new();
  for id in topology.topological_order() {
    if is_root(topology.node(id)?.kind()) {
      roots.push(id);
    }
  }

  let mut streams: HashMap<String, Fields> = HashMap::new();
  let mut user_streams = BTreeSet::new();
  for (node, name) in topology.exposed() {
    streams.insert(name.to_string(), lineage::full_output_fields(topology, node)?);
    user_streams.insert(name.to_string());
  }

  let mut tasks = Vec::with_capacity(roots.len());
  for &root in &roots {
    let members = collect_members(topology, root)?;
    let node = topology.node(root)?;

    let mut input_streams = Vec::new();
    for &pred in topology.predecessors(root) {
      let name = stream_name(topology, pred);
      streams
        .entry(name.clone())
        .or_insert(lineage::full_output_fields(topology, pred)?);
      input_streams.push(name);
    }
    let input_schema = match node.kind() {
      NodeKind::Source => None,
      _ => Some(lineage::input_fields(topology, root)?),
    };

    let parallelism = if node.kind() == NodeKind::Source {
      node.parallelism()
    } else {
      for m in &members {
        let p = topology.node(*m)?.parallelism();
        if p > 1 {
          warn!(
            node = %topology.node(*m)?.label(*m),
            parallelism = p,
            "only source tasks run in parallel locally, using 1"
          );
        }
      }
      1
    };

    tasks.push(TaskSpec {
      name: node.label(root),
      root,
      members,
      input_streams,
      input_schema,
      exposed: HashMap::new(),
      parallelism,
    });
  }

  // A node writes to a stream if it is exposed or feeds another task's root.
  for task in &mut tasks {
    for &m in &task.members {
      let feeds_root = topology
        .successors(m)
        .iter()
        .any(|s| roots.contains(s));
      if feeds_root || topology.exposed_name(m).is_some() {
        task.exposed.insert(m, stream_name(topology, m));
      }
    }
    debug!(
      task = %task.name,
      members = task.members.len(),
      inputs = ?task.input_streams,
      outputs = task.exposed.len(),
      "planned task"
    );
  }

  Ok(TaskPlan {
    tasks,
    streams,
    user_streams,
  })
}

fn collect_members(topology: &Topology, root: NodeId) -> Result<BTreeSet<NodeId>, GraphError> {
  let mut members = BTreeSet::from([root]);
  let mut queue = VecDeque::from([root]);
  while let Some(id) = queue.pop_front() {
    for &s in topology.successors(id) {
      if is_root(topology.node(s)?.kind()) || !members.insert(s) {
        continue;
      }
      queue.push_back(s);
    }
  }
  Ok(members)
}
