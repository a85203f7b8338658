//! # Operator graph
//!
//! A batch dataflow plan is a DAG of typed operators. The graph is built in
//! two phases:
//!
//! 1. [`GraphBuilder`] adds nodes strictly below existing ones (so the graph
//!    is acyclic by construction), names them, sets parallelism hints and the
//!    stage-0 flag of group-by nodes, and exposes nodes as named streams.
//! 2. [`GraphBuilder::build`] validates the wiring and the field lineage of
//!    every node and seals the result into an immutable [`Topology`].
//!
//! Edges live in adjacency lists indexed by [`NodeId`]; nodes never point back
//! at their graph. Field lineage is computed on demand by the functions in
//! [`crate::lineage`], which take any [`GraphView`].
//!
//! ```rust
//! use batchweave::aggregate::Count;
//! use batchweave::feed::MemoryFeed;
//! use batchweave::graph::{GraphBuilder, GroupBySpec};
//! use batchweave::lineage::full_output_fields;
//! use batchweave::state::InMemoryStateFactory;
//! use std::sync::Arc;
//!
//! let mut g = GraphBuilder::new("counts");
//! let words = g.new_stream(Arc::new(MemoryFeed::new(["word"])));
//! let counts = g
//!     .group_by(
//!         words,
//!         GroupBySpec::new(["word"], ["word"], Arc::new(Count), Arc::new(InMemoryStateFactory::new()), ["count"]),
//!     )
//!     .unwrap();
//! let topology = g.build().unwrap();
//! assert_eq!(full_output_fields(&topology, counts).unwrap().to_string(), "[word, count]");
//! ```

use crate::aggregate::CombinerAggregator;
use crate::feed::FeedFactory;
use crate::fields::Fields;
use crate::lineage::{self, STAGE1_FIELD};
use crate::operation::RecordFunction;
use crate::state::StateFactory;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identifier of a node within one graph.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
  /// Creates a node id from a raw index.
  #[inline]
  pub const fn new(index: usize) -> Self {
    Self(index)
  }

  /// Returns the raw index.
  #[inline]
  pub const fn index(self) -> usize {
    self.0
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Error type for graph construction and lineage queries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
  /// The id does not belong to this graph.
  #[error("unknown node {0}")]
  UnknownNode(NodeId),
  /// A non-source node has no predecessor.
  #[error("node {node} has no predecessor")]
  MissingPredecessor {
    /// Node.
    node: NodeId,
  },
  /// A node that needs a unique predecessor has several.
  #[error("node {node} has {count} predecessors, expected exactly one")]
  MultiplePredecessors {
    /// Node.
    node: NodeId,
    /// Number of predecessors.
    count: usize,
  },
  /// A fan-out's appended fields were queried but its predecessor does not group.
  #[error("fan-out {node} has no grouping predecessor")]
  NoGroupingFields {
    /// Fan-out node.
    node: NodeId,
  },
  /// A group-by operation was applied to another kind of node.
  #[error("node {node} is a {kind}, not a group-by")]
  NotGroupBy {
    /// Node.
    node: NodeId,
    /// Its kind.
    kind: NodeKind,
  },
  /// A node reads a field its input does not carry.
  #[error("node {node} reads field '{field}' missing from its input {available}")]
  UnknownField {
    /// Node.
    node: NodeId,
    /// Field read.
    field: String,
    /// Fields available.
    available: Fields,
  },
  /// A merge predecessor's output does not match the merged schema's arity.
  #[error("merge {node}: predecessor {pred} yields {found} fields, schema has {expected}")]
  MergeArity {
    /// Merge node.
    node: NodeId,
    /// Offending predecessor.
    pred: NodeId,
    /// Fields in the merged schema.
    expected: usize,
    /// Fields the predecessor yields.
    found: usize,
  },
  /// Two nodes were exposed under the same stream name.
  #[error("stream '{stream}' is already exposed")]
  DuplicateStream {
    /// Stream name.
    stream: String,
  },
  /// Parallelism hints must be at least 1.
  #[error("node {node}: parallelism must be at least 1")]
  InvalidParallelism {
    /// Node.
    node: NodeId,
  },
}

/// Closed set of operator kinds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
  /// Pull-based upstream feed.
  Source,
  /// Per-record transform appending fields.
  Function,
  /// Field projection.
  Projection,
  /// Repartition point; passes records through.
  FanOut,
  /// Grouped aggregation.
  GroupBy,
  /// Union of several predecessors with an explicit schema.
  Merge,
}

impl fmt::Display for NodeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      NodeKind::Source => "source",
      NodeKind::Function => "function",
      NodeKind::Projection => "projection",
      NodeKind::FanOut => "fan-out",
      NodeKind::GroupBy => "group-by",
      NodeKind::Merge => "merge",
    };
    f.write_str(s)
  }
}

/// Payload of a source node.
#[derive(Clone)]
pub struct SourceSpec {
  /// Feed factory; one feed per source task instance.
  pub feed: Arc<dyn FeedFactory>,
}

/// Payload of a function node.
#[derive(Clone)]
pub struct FunctionSpec {
  /// Fields the transform reads.
  pub selector: Fields,
  /// The transform.
  pub function: Arc<dyn RecordFunction>,
  /// Fields the transform appends.
  pub appended: Fields,
}

/// Payload of a projection node.
#[derive(Clone, Debug)]
pub struct ProjectionSpec {
  /// Fields kept, in output order.
  pub output: Fields,
}

/// Payload of a group-by node.
#[derive(Clone)]
pub struct GroupBySpec {
  /// Grouping key fields.
  pub key: Fields,
  /// Fields the aggregation reads.
  pub input: Fields,
  /// Partial aggregator run by stage 0.
  pub stage0: Arc<dyn CombinerAggregator>,
  /// Combining aggregator run by stage 1.
  pub stage1: Arc<dyn CombinerAggregator>,
  /// Aggregator folding batch results into durable state.
  pub store: Arc<dyn CombinerAggregator>,
  /// Creates the durable state store.
  pub state: Arc<dyn StateFactory>,
  /// Declared aggregate output fields.
  pub output: Fields,
  /// Whether this node runs stage 0.
  pub stage0_flag: bool,
}

impl GroupBySpec {
  /// A group-by using `aggregator` for both stages and for durable state.
  pub fn new(
    key: impl Into<Fields>,
    input: impl Into<Fields>,
    aggregator: Arc<dyn CombinerAggregator>,
    state: Arc<dyn StateFactory>,
    output: impl Into<Fields>,
  ) -> Self {
    Self {
      key: key.into(),
      input: input.into(),
      stage0: Arc::clone(&aggregator),
      stage1: Arc::clone(&aggregator),
      store: aggregator,
      state,
      output: output.into(),
      stage0_flag: false,
    }
  }

  /// Uses distinct aggregators per stage.
  pub fn with_stages(
    mut self,
    stage0: Arc<dyn CombinerAggregator>,
    stage1: Arc<dyn CombinerAggregator>,
    store: Arc<dyn CombinerAggregator>,
  ) -> Self {
    self.stage0 = stage0;
    self.stage1 = stage1;
    self.store = store;
    self
  }
}

/// Kind-tagged operator payload.
#[derive(Clone)]
pub enum Operator {
  /// See [`SourceSpec`].
  Source(SourceSpec),
  /// See [`FunctionSpec`].
  Function(FunctionSpec),
  /// See [`ProjectionSpec`].
  Projection(ProjectionSpec),
  /// Pass-through repartition point.
  FanOut,
  /// See [`GroupBySpec`].
  GroupBy(GroupBySpec),
  /// Union with a caller-supplied schema.
  Merge {
    /// Schema shared by every predecessor.
    schema: Fields,
  },
}

impl Operator {
  /// The operator's kind.
  pub fn kind(&self) -> NodeKind {
    match self {
      Operator::Source(_) => NodeKind::Source,
      Operator::Function(_) => NodeKind::Function,
      Operator::Projection(_) => NodeKind::Projection,
      Operator::FanOut => NodeKind::FanOut,
      Operator::GroupBy(_) => NodeKind::GroupBy,
      Operator::Merge { .. } => NodeKind::Merge,
    }
  }
}

impl fmt::Debug for Operator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Operator::Source(s) => f
        .debug_struct("Source")
        .field("fields", &s.feed.output_fields())
        .finish(),
      Operator::Function(s) => f
        .debug_struct("Function")
        .field("selector", &s.selector)
        .field("appended", &s.appended)
        .finish(),
      Operator::Projection(s) => f.debug_struct("Projection").field("output", &s.output).finish(),
      Operator::FanOut => f.write_str("FanOut"),
      Operator::GroupBy(s) => f
        .debug_struct("GroupBy")
        .field("key", &s.key)
        .field("input", &s.input)
        .field("output", &s.output)
        .field("stage0", &s.stage0_flag)
        .finish(),
      Operator::Merge { schema } => f.debug_struct("Merge").field("schema", schema).finish(),
    }
  }
}

/// A graph vertex: an operator plus its name and parallelism hint.
#[derive(Clone, Debug)]
pub struct Node {
  name: Option<String>,
  parallelism: usize,
  op: Operator,
}

impl Node {
  /// Creates an unnamed node with parallelism 1.
  pub fn new(op: Operator) -> Self {
    Self {
      name: None,
      parallelism: 1,
      op,
    }
  }

  /// Structurally equal node, not linked into any graph.
  pub fn copy(&self) -> Node {
    self.clone()
  }

  /// Optional display name.
  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  /// Parallelism hint.
  pub fn parallelism(&self) -> usize {
    self.parallelism
  }

  /// Operator payload.
  pub fn operator(&self) -> &Operator {
    &self.op
  }

  /// Operator kind.
  pub fn kind(&self) -> NodeKind {
    self.op.kind()
  }

  /// True for group-by nodes flagged as stage 0.
  pub fn is_stage0(&self) -> bool {
    matches!(&self.op, Operator::GroupBy(g) if g.stage0_flag)
  }

  /// Grouping key fields of a group-by node.
  pub fn grouping_fields(&self) -> Option<&Fields> {
    match &self.op {
      Operator::GroupBy(g) => Some(&g.key),
      _ => None,
    }
  }

  /// Name if set, otherwise `<kind>-<index>`.
  pub fn label(&self, id: NodeId) -> String {
    match &self.name {
      Some(n) => n.clone(),
      None => format!("{}-{}", self.kind(), id.index()),
    }
  }
}

/// Read access to nodes and edges, shared by builder and sealed topology.
pub trait GraphView {
  /// Node by id.
  fn node(&self, id: NodeId) -> Result<&Node, GraphError>;

  /// Direct predecessors, in link order.
  fn predecessors(&self, id: NodeId) -> &[NodeId];

  /// Direct successors, in link order.
  fn successors(&self, id: NodeId) -> &[NodeId];
}

#[derive(Clone, Debug, Default)]
struct Adjacency {
  nodes: Vec<Node>,
  preds: Vec<Vec<NodeId>>,
  succs: Vec<Vec<NodeId>>,
}

impl Adjacency {
  fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
    self.nodes.get(id.0).ok_or(GraphError::UnknownNode(id))
  }

  fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
    self.nodes.get_mut(id.0).ok_or(GraphError::UnknownNode(id))
  }

  fn edges(list: &[Vec<NodeId>], id: NodeId) -> &[NodeId] {
    list.get(id.0).map(Vec::as_slice).unwrap_or(&[])
  }

  fn insert(&mut self, preds: &[NodeId], node: Node) -> Result<NodeId, GraphError> {
    for p in preds {
      self.node(*p)?;
    }
    let id = NodeId(self.nodes.len());
    self.nodes.push(node);
    self.preds.push(preds.to_vec());
    self.succs.push(Vec::new());
    for p in preds {
      self.succs[p.0].push(id);
    }
    Ok(id)
  }
}

/// Mutable graph under construction.
#[derive(Clone, Debug)]
pub struct GraphBuilder {
  name: String,
  graph: Adjacency,
  exposed: HashMap<NodeId, String>,
}

impl GraphBuilder {
  /// Starts an empty graph.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      graph: Adjacency::default(),
      exposed: HashMap::new(),
    }
  }

  /// Inserts `node` below `pred`.
  pub fn attach(&mut self, pred: NodeId, node: Node) -> Result<NodeId, GraphError> {
    self.graph.insert(&[pred], node)
  }

  /// Adds a source node reading from `feed`.
  pub fn new_stream(&mut self, feed: Arc<dyn FeedFactory>) -> NodeId {
    let id = NodeId(self.graph.nodes.len());
    self.graph.nodes.push(Node::new(Operator::Source(SourceSpec { feed })));
    self.graph.preds.push(Vec::new());
    self.graph.succs.push(Vec::new());
    id
  }

  /// Adds a function node reading `selector` and appending `appended`.
  pub fn each(
    &mut self,
    pred: NodeId,
    selector: impl Into<Fields>,
    function: Arc<dyn RecordFunction>,
    appended: impl Into<Fields>,
  ) -> Result<NodeId, GraphError> {
    self.attach(
      pred,
      Node::new(Operator::Function(FunctionSpec {
        selector: selector.into(),
        function,
        appended: appended.into(),
      })),
    )
  }

  /// Adds a projection node keeping `output`.
  pub fn project(&mut self, pred: NodeId, output: impl Into<Fields>) -> Result<NodeId, GraphError> {
    self.attach(
      pred,
      Node::new(Operator::Projection(ProjectionSpec {
        output: output.into(),
      })),
    )
  }

  /// Adds a fan-out node.
  pub fn fan_out(&mut self, pred: NodeId) -> Result<NodeId, GraphError> {
    self.attach(pred, Node::new(Operator::FanOut))
  }

  /// Adds a group-by node.
  pub fn group_by(&mut self, pred: NodeId, spec: GroupBySpec) -> Result<NodeId, GraphError> {
    self.attach(pred, Node::new(Operator::GroupBy(spec)))
  }

  /// Adds a stage-0 group-by, a fan-out repartitioning on the key, and a
  /// stage-1 group-by reading the partials. Returns the stage-1 node.
  pub fn group_by_two_stage(&mut self, pred: NodeId, spec: GroupBySpec) -> Result<NodeId, GraphError> {
    let stage1 = Node::new(Operator::GroupBy(spec));
    let partial = self.attach(pred, stage1.copy())?;
    self.set_stage0(partial)?;
    let shuffle = self.fan_out(partial)?;
    let mut stage1 = stage1;
    if let Operator::GroupBy(g) = &mut stage1.op {
      g.input = Fields::from([STAGE1_FIELD]);
    }
    self.attach(shuffle, stage1)
  }

  /// Adds a merge of `preds` producing `schema`.
  pub fn merge(&mut self, preds: &[NodeId], schema: impl Into<Fields>) -> Result<NodeId, GraphError> {
    let id = NodeId(self.graph.nodes.len());
    if preds.is_empty() {
      return Err(GraphError::MissingPredecessor { node: id });
    }
    self.graph.insert(
      preds,
      Node::new(Operator::Merge {
        schema: schema.into(),
      }),
    )
  }

  /// Names a node.
  pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<(), GraphError> {
    self.graph.node_mut(id)?.name = Some(name.into());
    Ok(())
  }

  /// Sets a node's parallelism hint.
  pub fn set_parallelism(&mut self, id: NodeId, parallelism: usize) -> Result<(), GraphError> {
    if parallelism == 0 {
      return Err(GraphError::InvalidParallelism { node: id });
    }
    self.graph.node_mut(id)?.parallelism = parallelism;
    Ok(())
  }

  /// Flags a group-by node as stage 0.
  pub fn set_stage0(&mut self, id: NodeId) -> Result<(), GraphError> {
    let node = self.graph.node_mut(id)?;
    let kind = node.kind();
    match &mut node.op {
      Operator::GroupBy(g) => {
        g.stage0_flag = true;
        Ok(())
      }
      _ => Err(GraphError::NotGroupBy { node: id, kind }),
    }
  }

  /// Exposes a node's output as the named stream `stream`.
  pub fn expose(&mut self, id: NodeId, stream: impl Into<String>) -> Result<(), GraphError> {
    self.graph.node(id)?;
    let stream = stream.into();
    if self.exposed.iter().any(|(n, s)| *s == stream && *n != id) {
      return Err(GraphError::DuplicateStream { stream });
    }
    self.exposed.insert(id, stream);
    Ok(())
  }

  /// Validates wiring and lineage and seals the graph.
  pub fn build(self) -> Result<Topology, GraphError> {
    for (index, node) in self.graph.nodes.iter().enumerate() {
      let id = NodeId(index);
      let preds = self.graph.preds[index].len();
      match node.kind() {
        NodeKind::Source => {}
        NodeKind::Merge if preds == 0 => {
          return Err(GraphError::MissingPredecessor { node: id });
        }
        NodeKind::Merge => {}
        _ if preds == 0 => return Err(GraphError::MissingPredecessor { node: id }),
        _ if preds > 1 => {
          return Err(GraphError::MultiplePredecessors { node: id, count: preds });
        }
        _ => {}
      }
      lineage::validate(&self, id)?;
    }
    Ok(Topology {
      name: self.name,
      graph: self.graph,
      exposed: self.exposed,
    })
  }
}

impl GraphView for GraphBuilder {
  fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
    self.graph.node(id)
  }

  fn predecessors(&self, id: NodeId) -> &[NodeId] {
    Adjacency::edges(&self.graph.preds, id)
  }

  fn successors(&self, id: NodeId) -> &[NodeId] {
    Adjacency::edges(&self.graph.succs, id)
  }
}

/// A sealed, validated operator graph.
#[derive(Clone, Debug)]
pub struct Topology {
  name: String,
  graph: Adjacency,
  exposed: HashMap<NodeId, String>,
}

impl Topology {
  /// Graph name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Number of nodes.
  pub fn len(&self) -> usize {
    self.graph.nodes.len()
  }

  /// True if the graph has no nodes.
  pub fn is_empty(&self) -> bool {
    self.graph.nodes.is_empty()
  }

  /// All node ids in topological order.
  ///
  /// Ids are assigned on insertion and every node is inserted after all of
  /// its predecessors, so id order is a topological order.
  pub fn topological_order(&self) -> impl Iterator<Item = NodeId> + '_ {
    (0..self.graph.nodes.len()).map(NodeId)
  }

  /// Source node ids.
  pub fn sources(&self) -> Vec<NodeId> {
    self.topological_order()
      .filter(|id| matches!(self.graph.nodes[id.0].kind(), NodeKind::Source))
      .collect()
  }

  /// Stream name a node is exposed under, if any.
  pub fn exposed_name(&self, id: NodeId) -> Option<&str> {
    self.exposed.get(&id).map(String::as_str)
  }

  /// All exposed `(node, stream)` pairs.
  pub fn exposed(&self) -> impl Iterator<Item = (NodeId, &str)> + '_ {
    self.exposed.iter().map(|(id, s)| (*id, s.as_str()))
  }
}

impl GraphView for Topology {
  fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
    self.graph.node(id)
  }

  fn predecessors(&self, id: NodeId) -> &[NodeId] {
    Adjacency::edges(&self.graph.preds, id)
  }

  fn successors(&self, id: NodeId) -> &[NodeId] {
    Adjacency::edges(&self.graph.succs, id)
  }
}
