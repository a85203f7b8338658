use crate::aggregate::{Count, Sum};
use crate::error::TaskError;
use crate::feed::MemoryFeed;
use crate::fields::Fields;
use crate::graph::{GraphBuilder, GraphError, GraphView, GroupBySpec, NodeId, NodeKind};
use crate::lineage::{
  appended_output_fields, full_output_fields, input_fields, logic_input_fields, STAGE1_FIELD,
};
use crate::operation::{Collector, RecordFunction};
use crate::record::Record;
use crate::state::InMemoryStateFactory;
use crate::value::Value;
use std::sync::Arc;

fn length() -> Arc<dyn RecordFunction> {
  Arc::new(|r: &Record, out: &mut dyn Collector| -> Result<(), TaskError> {
    let n = r.get(0).and_then(Value::as_str).map_or(0, str::len);
    out.emit(vec![Value::Int(n as i64)])
  })
}

fn sum_by(key: &str, input: &str, output: &str) -> GroupBySpec {
  GroupBySpec::new(
    [key],
    [input],
    Arc::new(Sum),
    Arc::new(InMemoryStateFactory::new()),
    [output],
  )
}

fn f(names: &[&str]) -> Fields {
  Fields::from(names)
}

#[test]
fn test_function_output_is_input_then_appended() {
  let mut g = GraphBuilder::new("g");
  let src = g.new_stream(Arc::new(MemoryFeed::new(["word", "lang"])));
  let len = g.each(src, ["word"], length(), ["len"]).unwrap();
  let topology = g.build().unwrap();

  let input = input_fields(&topology, len).unwrap();
  let appended = appended_output_fields(&topology, len).unwrap();
  assert_eq!(input, f(&["word", "lang"]));
  assert_eq!(appended, f(&["len"]));
  assert_eq!(full_output_fields(&topology, len).unwrap(), input.concat(&appended));
  assert_eq!(logic_input_fields(&topology, len).unwrap(), f(&["word"]));
}

#[test]
fn test_stage0_appends_only_the_synthetic_field() {
  let mut g = GraphBuilder::new("g");
  let src = g.new_stream(Arc::new(MemoryFeed::new(["k", "v"])));
  let agg = g.group_by(src, sum_by("k", "v", "total")).unwrap();
  assert_eq!(appended_output_fields(&g, agg).unwrap(), f(&["total"]));
  g.set_stage0(agg).unwrap();
  assert_eq!(appended_output_fields(&g, agg).unwrap(), f(&[STAGE1_FIELD]));
  assert_eq!(full_output_fields(&g, agg).unwrap(), f(&["k", STAGE1_FIELD]));
}

#[test]
fn test_fan_out_inherits_predecessor_lineage() {
  let mut g = GraphBuilder::new("g");
  let src = g.new_stream(Arc::new(MemoryFeed::new(["k", "v"])));
  let total = g.group_by_two_stage(src, sum_by("k", "v", "total")).unwrap();
  let topology = g.build().unwrap();

  let shuffle = topology.predecessors(total)[0];
  let partial = topology.predecessors(shuffle)[0];
  assert_eq!(topology.node(shuffle).unwrap().kind(), NodeKind::FanOut);
  assert!(topology.node(partial).unwrap().is_stage0());
  assert_eq!(
    full_output_fields(&topology, shuffle).unwrap(),
    full_output_fields(&topology, partial).unwrap()
  );
  assert_eq!(appended_output_fields(&topology, shuffle).unwrap(), f(&["k"]));
  assert_eq!(logic_input_fields(&topology, total).unwrap(), f(&[STAGE1_FIELD]));
  assert_eq!(full_output_fields(&topology, total).unwrap(), f(&["k", "total"]));
}

#[test]
fn test_fan_out_after_non_grouping_node_has_no_appended_fields() {
  let mut g = GraphBuilder::new("g");
  let src = g.new_stream(Arc::new(MemoryFeed::new(["a"])));
  let fan = g.fan_out(src).unwrap();
  assert_eq!(full_output_fields(&g, fan).unwrap(), f(&["a"]));
  assert_eq!(
    appended_output_fields(&g, fan).unwrap_err(),
    GraphError::NoGroupingFields { node: fan }
  );
}

#[test]
fn test_projection_and_merge_use_declared_fields() {
  let mut g = GraphBuilder::new("g");
  let left = g.new_stream(Arc::new(MemoryFeed::new(["a", "b"])));
  let right = g.new_stream(Arc::new(MemoryFeed::new(["b", "a"])));
  let pl = g.project(left, ["b"]).unwrap();
  let pr = g.project(right, ["b"]).unwrap();
  let merged = g.merge(&[pl, pr], ["b"]).unwrap();
  let topology = g.build().unwrap();
  assert_eq!(full_output_fields(&topology, pl).unwrap(), f(&["b"]));
  assert_eq!(appended_output_fields(&topology, pl).unwrap(), f(&["b"]));
  assert_eq!(full_output_fields(&topology, merged).unwrap(), f(&["b"]));
  assert_eq!(topology.predecessors(merged), &[pl, pr]);
}

#[test]
fn test_build_rejects_merge_with_mismatched_arity() {
  let mut g = GraphBuilder::new("g");
  let left = g.new_stream(Arc::new(MemoryFeed::new(["a", "b"])));
  let right = g.new_stream(Arc::new(MemoryFeed::new(["a"])));
  let pl = g.project(left, ["a", "b"]).unwrap();
  let pr = g.project(right, ["a"]).unwrap();
  let merged = g.merge(&[pl, pr], ["a"]).unwrap();
  match g.build() {
    Err(GraphError::MergeArity { node, pred, expected, found }) => {
      assert_eq!(node, merged);
      assert_eq!(pred, pl);
      assert_eq!((expected, found), (1, 2));
    }
    other => panic!("expected MergeArity, got {other:?}"),
  }
}

#[test]
fn test_build_rejects_unknown_selector_field() {
  let mut g = GraphBuilder::new("g");
  let src = g.new_stream(Arc::new(MemoryFeed::new(["word"])));
  let len = g.each(src, ["text"], length(), ["len"]).unwrap();
  match g.build() {
    Err(GraphError::UnknownField { node, field, .. }) => {
      assert_eq!(node, len);
      assert_eq!(field, "text");
    }
    other => panic!("expected UnknownField, got {other:?}"),
  }
}

#[test]
fn test_builder_guards() {
  let mut g = GraphBuilder::new("g");
  let src = g.new_stream(Arc::new(MemoryFeed::new(["k"])));
  assert!(matches!(
    g.set_stage0(src),
    Err(GraphError::NotGroupBy { kind: NodeKind::Source, .. })
  ));
  assert_eq!(
    g.set_parallelism(src, 0),
    Err(GraphError::InvalidParallelism { node: src })
  );
  assert_eq!(
    g.fan_out(NodeId::new(42)),
    Err(GraphError::UnknownNode(NodeId::new(42)))
  );
  let p = g.project(src, ["k"]).unwrap();
  g.expose(src, "raw").unwrap();
  assert_eq!(
    g.expose(p, "raw"),
    Err(GraphError::DuplicateStream {
      stream: "raw".to_string()
    })
  );
  assert!(matches!(
    g.merge(&[], ["k"]),
    Err(GraphError::MissingPredecessor { .. })
  ));
}

#[test]
fn test_copy_is_unlinked_and_equivalent() {
  let mut g = GraphBuilder::new("g");
  let src = g.new_stream(Arc::new(MemoryFeed::new(["k"])));
  let agg = g
    .group_by(
      src,
      GroupBySpec::new(
        ["k"],
        ["k"],
        Arc::new(Count),
        Arc::new(InMemoryStateFactory::new()),
        ["n"],
      ),
    )
    .unwrap();
  g.set_name(agg, "counter").unwrap();
  g.set_parallelism(agg, 3).unwrap();

  let original = g.node(agg).unwrap();
  let copy = original.copy();
  assert_eq!(copy.kind(), NodeKind::GroupBy);
  assert_eq!(copy.name(), Some("counter"));
  assert_eq!(copy.parallelism(), 3);
  assert_eq!(copy.grouping_fields(), original.grouping_fields());

  let placed = g.attach(src, copy).unwrap();
  assert_ne!(placed, agg);
  assert!(g.successors(placed).is_empty());
  assert_eq!(g.successors(src), &[agg, placed]);
}

#[test]
fn test_topological_order_lists_predecessors_first() {
  let mut g = GraphBuilder::new("g");
  let src = g.new_stream(Arc::new(MemoryFeed::new(["k", "v"])));
  g.group_by_two_stage(src, sum_by("k", "v", "total")).unwrap();
  let topology = g.build().unwrap();
  let order: Vec<NodeId> = topology.topological_order().collect();
  for (pos, id) in order.iter().enumerate() {
    for p in topology.predecessors(*id) {
      assert!(order[..pos].contains(p));
    }
  }
  assert_eq!(topology.sources(), vec![src]);
}
