//! Change deltas and the per-pass store that hands them out.
//!
//! A [`PassStore`] is created when a pass starts. It captures the journal head
//! and every unit's last-built stamp at that moment, so deltas are stable for
//! the whole pass even while units finish and the journal keeps growing.
//! Deltas and contexts are computed at most once per unit and shared as `Arc`s.
//!
//! Steps that watch other units see those units through their own stamp: the
//! window starts where that step last consumed the unit, not where the unit
//! last built.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::trace;

use super::context::BuildContext;
use super::graph::BuildGraph;
use crate::unit::UnitId;
use crate::workspace::model::{Change, Stamp, WorkspaceModel};

/// Changes to a unit's project within a stamp window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delta {
  unit: UnitId,
  since: Option<Stamp>,
  upto: Stamp,
  changes: Vec<Change>,
}

impl Delta {
  pub fn new(unit: UnitId, since: Option<Stamp>, upto: Stamp, changes: Vec<Change>) -> Self {
    Self {
      unit,
      since,
      upto,
      changes,
    }
  }

  pub fn unit(&self) -> &UnitId {
    &self.unit
  }

  /// Exclusive start of the window, `None` for the start of the journal.
  pub fn since(&self) -> Option<Stamp> {
    self.since
  }

  /// Journal head when the pass started.
  pub fn upto(&self) -> Stamp {
    self.upto
  }

  pub fn changes(&self) -> &[Change] {
    &self.changes
  }

  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }

  pub fn len(&self) -> usize {
    self.changes.len()
  }

  pub fn touches(&self, path: &str) -> bool {
    self.changes.iter().any(|change| change.path == path)
  }
}

/// Pass-scoped cache of deltas and build contexts.
#[derive(Debug)]
pub struct PassStore {
  model: Arc<RwLock<WorkspaceModel>>,
  graph: Arc<BuildGraph>,
  stamp: Stamp,
  baseline: HashMap<UnitId, Stamp>,
  deltas: Mutex<HashMap<UnitId, Option<Arc<Delta>>>>,
  /// Empty deltas handed out for units that vanished from the model.
  vanished: Mutex<HashMap<UnitId, Arc<Delta>>>,
  watched: Mutex<HashMap<(UnitId, Option<Stamp>), Option<Arc<Delta>>>>,
  contexts: Mutex<HashMap<UnitId, Arc<BuildContext>>>,
}

impl PassStore {
  pub fn new(model: Arc<RwLock<WorkspaceModel>>, graph: Arc<BuildGraph>) -> Self {
    let (stamp, baseline) = {
      let model = model.read();
      (model.head(), model.built_stamps())
    };
    Self {
      model,
      graph,
      stamp,
      baseline,
      deltas: Mutex::new(HashMap::new()),
      vanished: Mutex::new(HashMap::new()),
      watched: Mutex::new(HashMap::new()),
      contexts: Mutex::new(HashMap::new()),
    }
  }

  /// Journal head captured when the pass started.
  pub fn stamp(&self) -> Stamp {
    self.stamp
  }

  pub fn graph(&self) -> &BuildGraph {
    &self.graph
  }

  /// Delta of `unit` for this pass, or `None` if the unit is missing or closed.
  pub fn delta(&self, unit: &UnitId) -> Option<Arc<Delta>> {
    let mut deltas = self.deltas.lock();
    if let Some(cached) = deltas.get(unit) {
      return cached.clone();
    }

    let since = self.baseline.get(unit).copied();
    let computed = self.compute(unit, since);
    trace!(unit = %unit, changes = computed.as_ref().map(|d| d.len()), "delta computed");
    deltas.insert(unit.clone(), computed.clone());
    computed
  }

  /// Like [`PassStore::delta`], but a missing or closed unit gets an empty
  /// delta that is itself shared for the rest of the pass.
  pub fn delta_or_empty(&self, unit: &UnitId) -> Arc<Delta> {
    if let Some(delta) = self.delta(unit) {
      return delta;
    }
    self
      .vanished
      .lock()
      .entry(unit.clone())
      .or_insert_with(|| Arc::new(Delta::new(unit.clone(), self.baseline.get(unit).copied(), self.stamp, Vec::new())))
      .clone()
  }

  /// Changes to `unit` after `since`, up to the pass stamp.
  ///
  /// Used for units a step watches; `since` is the stamp at which that step
  /// last saw the unit.
  pub fn delta_since(&self, unit: &UnitId, since: Option<Stamp>) -> Option<Arc<Delta>> {
    let key = (unit.clone(), since);
    let mut watched = self.watched.lock();
    if let Some(cached) = watched.get(&key) {
      return cached.clone();
    }
    let computed = self.compute(unit, since);
    trace!(unit = %unit, since, changes = computed.as_ref().map(|d| d.len()), "watched delta computed");
    watched.insert(key, computed.clone());
    computed
  }

  fn compute(&self, unit: &UnitId, since: Option<Stamp>) -> Option<Arc<Delta>> {
    let model = self.model.read();
    model.is_buildable(unit).then(|| {
      let changes = model.changes(&unit.project, since.unwrap_or(0), self.stamp);
      Arc::new(Delta::new(unit.clone(), since, self.stamp, changes))
    })
  }

  /// Build context of `unit` for this pass.
  pub fn context(&self, unit: &UnitId) -> Arc<BuildContext> {
    let mut contexts = self.contexts.lock();
    contexts
      .entry(unit.clone())
      .or_insert_with(|| {
        let model = self.model.read();
        Arc::new(BuildContext::compute(&self.graph, &model, unit))
      })
      .clone()
  }
}
