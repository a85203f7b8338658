//! Field lineage: which fields a node sees and produces.
//!
//! Lineage is never stored on nodes. Every query walks the graph through a
//! [`GraphView`], so the same rules answer for a builder under construction
//! and for a sealed topology:
//!
//! | kind       | full output                      | appended output              |
//! |------------|----------------------------------|------------------------------|
//! | Source     | feed fields                      | feed fields                  |
//! | Function   | input ++ appended                | declared appended fields     |
//! | Projection | declared output                  | declared output              |
//! | GroupBy    | key ++ appended                  | declared output, or `[stage1_vl]` at stage 0 |
//! | FanOut     | predecessor's full output        | predecessor's grouping key   |
//! | Merge      | declared schema                  | declared schema              |

use crate::fields::Fields;
use crate::graph::{GraphError, GraphView, NodeId, Operator};

/// Synthetic field carrying an opaque stage-0 partial to stage 1.
pub const STAGE1_FIELD: &str = "stage1_vl";

/// The unique predecessor of `id`.
pub fn single_predecessor<G: GraphView + ?Sized>(g: &G, id: NodeId) -> Result<NodeId, GraphError> {
  match g.predecessors(id) {
    [p] => Ok(*p),
    [] => Err(GraphError::MissingPredecessor { node: id }),
    many => Err(GraphError::MultiplePredecessors {
      node: id,
      count: many.len(),
    }),
  }
}

/// Every field of records leaving `id`, in order.
pub fn full_output_fields<G: GraphView + ?Sized>(g: &G, id: NodeId) -> Result<Fields, GraphError> {
  match g.node(id)?.operator() {
    Operator::Source(s) => Ok(s.feed.output_fields()),
    Operator::Function(_) => {
      let input = input_fields(g, id)?;
      Ok(input.concat(&appended_output_fields(g, id)?))
    }
    Operator::Projection(p) => Ok(p.output.clone()),
    Operator::GroupBy(gb) => Ok(gb.key.concat(&appended_output_fields(g, id)?)),
    Operator::FanOut => full_output_fields(g, single_predecessor(g, id)?),
    Operator::Merge { schema } => Ok(schema.clone()),
  }
}

/// Fields `id` adds on top of what it was given.
pub fn appended_output_fields<G: GraphView + ?Sized>(
  g: &G,
  id: NodeId,
) -> Result<Fields, GraphError> {
  match g.node(id)?.operator() {
    Operator::Source(s) => Ok(s.feed.output_fields()),
    Operator::Function(f) => Ok(f.appended.clone()),
    Operator::Projection(p) => Ok(p.output.clone()),
    Operator::GroupBy(gb) if gb.stage0_flag => Ok(Fields::from([STAGE1_FIELD])),
    Operator::GroupBy(gb) => Ok(gb.output.clone()),
    Operator::FanOut => {
      let pred = single_predecessor(g, id)?;
      g.node(pred)?
        .grouping_fields()
        .cloned()
        .ok_or(GraphError::NoGroupingFields { node: id })
    }
    Operator::Merge { schema } => Ok(schema.clone()),
  }
}

/// Fields of records arriving at `id`. Empty for sources.
pub fn input_fields<G: GraphView + ?Sized>(g: &G, id: NodeId) -> Result<Fields, GraphError> {
  match g.node(id)?.operator() {
    Operator::Source(_) => Ok(Fields::empty()),
    Operator::Merge { schema } => Ok(schema.clone()),
    _ => full_output_fields(g, single_predecessor(g, id)?),
  }
}

/// Fields the node's logic reads from each input record.
pub fn logic_input_fields<G: GraphView + ?Sized>(g: &G, id: NodeId) -> Result<Fields, GraphError> {
  match g.node(id)?.operator() {
    Operator::Function(f) => Ok(f.selector.clone()),
    Operator::GroupBy(gb) => Ok(gb.input.clone()),
    Operator::Projection(p) => Ok(p.output.clone()),
    Operator::Source(_) | Operator::FanOut | Operator::Merge { .. } => full_output_fields(g, id),
  }
}

fn require_subset(id: NodeId, wanted: &Fields, available: &Fields) -> Result<(), GraphError> {
  match wanted.iter().find(|f| !available.contains(f)) {
    Some(field) => Err(GraphError::UnknownField {
      node: id,
      field: field.to_string(),
      available: available.clone(),
    }),
    None => Ok(()),
  }
}

/// Checks that `id`'s lineage resolves and that it reads only fields it is given.
pub(crate) fn validate<G: GraphView + ?Sized>(g: &G, id: NodeId) -> Result<(), GraphError> {
  full_output_fields(g, id)?;
  match g.node(id)?.operator() {
    Operator::Function(_) | Operator::Projection(_) => {
      require_subset(id, &logic_input_fields(g, id)?, &input_fields(g, id)?)
    }
    Operator::GroupBy(gb) => {
      let input = input_fields(g, id)?;
      require_subset(id, &gb.key, &input)?;
      require_subset(id, &gb.input, &input)
    }
    Operator::Merge { schema } => {
      for &pred in g.predecessors(id) {
        let found = full_output_fields(g, pred)?.len();
        if found != schema.len() {
          return Err(GraphError::MergeArity {
            node: id,
            pred,
            expected: schema.len(),
            found,
          });
        }
      }
      Ok(())
    }
    Operator::Source(_) | Operator::FanOut => Ok(()),
  }
}
