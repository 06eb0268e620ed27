//! Per-unit build context.

use serde::Serialize;

use super::graph::BuildGraph;
use crate::unit::UnitId;
use crate::workspace::model::WorkspaceModel;

/// Where a unit sits in the current pass.
///
/// `referenced` holds the units of the pass order this unit transitively
/// references that have completed a build; `referencing` the units of the pass
/// order that transitively reference it; `requested` the units the caller
/// originally asked for. All three keep build order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildContext {
  referenced: Vec<UnitId>,
  referencing: Vec<UnitId>,
  requested: Vec<UnitId>,
}

impl BuildContext {
  pub fn new(referenced: Vec<UnitId>, referencing: Vec<UnitId>, requested: Vec<UnitId>) -> Self {
    Self {
      referenced,
      referencing,
      requested,
    }
  }

  pub(crate) fn compute(graph: &BuildGraph, model: &WorkspaceModel, unit: &UnitId) -> Self {
    let referenced = graph
      .referenced(unit)
      .into_iter()
      .filter(|u| model.has_been_built(u))
      .collect();
    Self {
      referenced,
      referencing: graph.referencing(unit),
      requested: graph.requested().to_vec(),
    }
  }

  pub fn referenced(&self) -> &[UnitId] {
    &self.referenced
  }

  pub fn referencing(&self) -> &[UnitId] {
    &self.referencing
  }

  pub fn requested(&self) -> &[UnitId] {
    &self.requested
  }
}
