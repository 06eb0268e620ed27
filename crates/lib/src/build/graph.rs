//! Build graph resolution.
//!
//! Turns a set of requested units plus their declared references into a
//! deterministic build order. Edges run from a dependency to its dependent, so
//! a unit's references are always ordered before it. Reference cycles are
//! tolerated: the members of a strongly connected component build in the order
//! they were discovered.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, warn};

use crate::unit::UnitId;
use crate::workspace::model::WorkspaceModel;

/// The resolved graph and order for one pass.
#[derive(Debug, Clone)]
pub struct BuildGraph {
  /// Nodes are added in discovery order, so node indices double as discovery ranks.
  graph: DiGraph<UnitId, ()>,
  nodes: HashMap<UnitId, NodeIndex>,
  order: Vec<UnitId>,
  requested: Vec<UnitId>,
}

impl BuildGraph {
  /// Resolve `requested` against the current state of `model`.
  ///
  /// With `include_references` the order also contains every unit the
  /// requested units transitively reference; without it only references
  /// between requested units shape the order.
  pub fn resolve(model: &WorkspaceModel, requested: &[UnitId], include_references: bool) -> Self {
    let mut graph = DiGraph::new();
    let mut nodes: HashMap<UnitId, NodeIndex> = HashMap::new();
    let mut kept = Vec::new();

    for unit in requested {
      if nodes.contains_key(unit) {
        continue;
      }
      if !model.is_buildable(unit) {
        warn!(unit = %unit, "dropping requested unit that does not exist or is closed");
        continue;
      }
      nodes.insert(unit.clone(), graph.add_node(unit.clone()));
      kept.push(unit.clone());
    }

    let mut next = 0;
    while next < graph.node_count() {
      let dependent = NodeIndex::new(next);
      next += 1;

      let unit = graph[dependent].clone();
      let Some(project) = model.project(&unit.project) else {
        continue;
      };

      for target in project.references(&unit.config) {
        let Some(resolved) = model.resolve_ref(target) else {
          warn!(unit = %unit, reference = ?target, "dropping reference to missing or closed unit");
          continue;
        };
        if resolved == unit {
          continue;
        }
        let dependency = match nodes.get(&resolved) {
          Some(idx) => *idx,
          None if include_references => {
            let idx = graph.add_node(resolved.clone());
            nodes.insert(resolved, idx);
            idx
          }
          None => continue,
        };
        graph.update_edge(dependency, dependent, ());
      }
    }

    let order = Self::compute_order(&graph);
    debug!(
      requested = requested.len(),
      resolved = order.len(),
      include_references,
      "resolved build order"
    );

    Self {
      graph,
      nodes,
      order,
      requested: kept,
    }
  }

  /// Topological order over the condensation, breaking ties by discovery rank.
  fn compute_order(graph: &DiGraph<UnitId, ()>) -> Vec<UnitId> {
    let mut components = tarjan_scc(graph);
    for members in &mut components {
      members.sort_by_key(|idx| idx.index());
    }

    let mut component_of = vec![0usize; graph.node_count()];
    for (comp, members) in components.iter().enumerate() {
      for idx in members {
        component_of[idx.index()] = comp;
      }
    }

    let mut successors: Vec<HashSet<usize>> = vec![HashSet::new(); components.len()];
    let mut pending = vec![0usize; components.len()];
    for edge in graph.raw_edges() {
      let from = component_of[edge.source().index()];
      let to = component_of[edge.target().index()];
      if from != to && successors[from].insert(to) {
        pending[to] += 1;
      }
    }

    // Components are keyed by their first-discovered member.
    let rank = |comp: usize| components[comp][0].index();
    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = (0..components.len())
      .filter(|comp| pending[*comp] == 0)
      .map(|comp| Reverse((rank(comp), comp)))
      .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, comp))) = ready.pop() {
      order.extend(components[comp].iter().map(|idx| graph[*idx].clone()));
      for next in &successors[comp] {
        pending[*next] -= 1;
        if pending[*next] == 0 {
          ready.push(Reverse((rank(*next), *next)));
        }
      }
    }
    order
  }

  /// Units in build order.
  pub fn order(&self) -> &[UnitId] {
    &self.order
  }

  /// The requested units that survived resolution, deduplicated.
  pub fn requested(&self) -> &[UnitId] {
    &self.requested
  }

  pub fn contains(&self, unit: &UnitId) -> bool {
    self.nodes.contains_key(unit)
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  /// Position of `unit` in the build order.
  pub fn position(&self, unit: &UnitId) -> Option<usize> {
    self.order.iter().position(|u| u == unit)
  }

  /// Units `unit` transitively references, in build order.
  pub fn referenced(&self, unit: &UnitId) -> Vec<UnitId> {
    self.closure(unit, Direction::Incoming)
  }

  /// Units that transitively reference `unit`, in build order.
  pub fn referencing(&self, unit: &UnitId) -> Vec<UnitId> {
    self.closure(unit, Direction::Outgoing)
  }

  fn closure(&self, unit: &UnitId, direction: Direction) -> Vec<UnitId> {
    let Some(&start) = self.nodes.get(unit) else {
      return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut stack = vec![start];
    while let Some(idx) = stack.pop() {
      for next in self.graph.neighbors_directed(idx, direction) {
        if next != start && seen.insert(next) {
          stack.push(next);
        }
      }
    }

    self
      .order
      .iter()
      .filter(|u| self.nodes.get(*u).is_some_and(|idx| seen.contains(idx)))
      .cloned()
      .collect()
  }
}
