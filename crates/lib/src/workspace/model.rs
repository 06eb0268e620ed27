//! In-memory workspace model: projects, configurations, references, build
//! specs and the change journal deltas are computed from.
//!
//! The journal is an append-only list of stamped changes. A unit's delta is
//! the slice of its project's entries between the unit's last completed build
//! and the stamp a pass captured when it started.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::unit::{TriggerMask, UnitId, UnitRef};

/// Monotonic position in the change journal.
pub type Stamp = u64;

/// Path recorded for changes to a project's own description.
pub const DESCRIPTION_PATH: &str = ".project";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
  #[error("project already exists: {0}")]
  DuplicateProject(String),

  #[error("project not found: {0}")]
  UnknownProject(String),

  #[error("configuration {config} not found in project {project}")]
  UnknownConfig { project: String, config: String },

  #[error("project {0} must declare at least one configuration")]
  NoConfigs(String),
}

/// One step bound into a project's build spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBinding {
  /// Registry id of the step implementation.
  pub step_id: String,
  #[serde(default)]
  pub args: BTreeMap<String, String>,
  /// Triggers this binding answers to when `configurable` is set.
  #[serde(default)]
  pub triggers: TriggerMask,
  /// Whether `triggers` overrides the step's own `responds_to`.
  #[serde(default = "default_true")]
  pub configurable: bool,
  /// Call the step for incremental/auto builds even if its delta is empty.
  #[serde(default)]
  pub call_on_empty_delta: bool,
}

fn default_true() -> bool {
  true
}

impl StepBinding {
  pub fn new(step_id: impl Into<String>) -> Self {
    Self {
      step_id: step_id.into(),
      args: BTreeMap::new(),
      triggers: TriggerMask::default(),
      configurable: true,
      call_on_empty_delta: false,
    }
  }

  pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.args.insert(key.into(), value.into());
    self
  }

  pub fn with_triggers(mut self, triggers: TriggerMask) -> Self {
    self.triggers = triggers;
    self
  }

  /// Leave trigger selection to the step's `responds_to`.
  pub fn fixed(mut self) -> Self {
    self.configurable = false;
    self
  }

  pub fn on_empty_delta(mut self) -> Self {
    self.call_on_empty_delta = true;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
  Added,
  Changed,
  Removed,
}

/// A single journal entry as observed through a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
  pub stamp: Stamp,
  pub path: String,
  pub kind: ChangeKind,
}

#[derive(Debug, Clone)]
struct JournalEntry {
  project: String,
  change: Change,
}

/// A declared project.
#[derive(Debug, Clone)]
pub struct Project {
  pub name: String,
  pub configs: Vec<String>,
  pub active: String,
  pub open: bool,
  pub build_spec: Vec<StepBinding>,
  /// Bumped whenever `build_spec` changes, so step instances can be recreated.
  pub spec_version: u64,
  references: HashMap<String, Vec<UnitRef>>,
}

impl Project {
  pub fn unit(&self, config: &str) -> UnitId {
    UnitId::new(&self.name, config)
  }

  pub fn active_unit(&self) -> UnitId {
    self.unit(&self.active)
  }

  pub fn has_config(&self, config: &str) -> bool {
    self.configs.iter().any(|c| c == config)
  }

  /// Declared references of one configuration, in declaration order.
  pub fn references(&self, config: &str) -> &[UnitRef] {
    self.references.get(config).map(Vec::as_slice).unwrap_or(&[])
  }
}

/// Projects, the change journal and per-unit build bookkeeping.
#[derive(Debug, Default)]
pub struct WorkspaceModel {
  projects: HashMap<String, Project>,
  declaration_order: Vec<String>,
  journal: Vec<JournalEntry>,
  head: Stamp,
  built: HashMap<UnitId, Stamp>,
}

impl WorkspaceModel {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn create_project(&mut self, name: &str, configs: &[&str]) -> Result<Stamp, ModelError> {
    if self.projects.contains_key(name) {
      return Err(ModelError::DuplicateProject(name.to_string()));
    }
    let Some(first) = configs.first() else {
      return Err(ModelError::NoConfigs(name.to_string()));
    };

    let project = Project {
      name: name.to_string(),
      configs: configs.iter().map(|c| c.to_string()).collect(),
      active: first.to_string(),
      open: true,
      build_spec: Vec::new(),
      spec_version: 0,
      references: HashMap::new(),
    };
    self.projects.insert(name.to_string(), project);
    self.declaration_order.push(name.to_string());
    debug!(project = %name, configs = configs.len(), "project created");
    Ok(self.record_change(name, DESCRIPTION_PATH, ChangeKind::Added))
  }

  pub fn delete_project(&mut self, name: &str) -> Result<(), ModelError> {
    if self.projects.remove(name).is_none() {
      return Err(ModelError::UnknownProject(name.to_string()));
    }
    self.declaration_order.retain(|p| p != name);
    self.journal.retain(|entry| entry.project != name);
    self.built.retain(|unit, _| unit.project != name);
    debug!(project = %name, "project deleted");
    Ok(())
  }

  pub fn set_open(&mut self, name: &str, open: bool) -> Result<Stamp, ModelError> {
    self.project_mut(name)?.open = open;
    if !open {
      self.built.retain(|unit, _| unit.project != name);
    }
    Ok(self.record_change(name, DESCRIPTION_PATH, ChangeKind::Changed))
  }

  pub fn set_active_config(&mut self, name: &str, config: &str) -> Result<Stamp, ModelError> {
    let project = self.project_mut(name)?;
    if !project.has_config(config) {
      return Err(ModelError::UnknownConfig {
        project: name.to_string(),
        config: config.to_string(),
      });
    }
    project.active = config.to_string();
    Ok(self.record_change(name, DESCRIPTION_PATH, ChangeKind::Changed))
  }

  pub fn set_references(&mut self, unit: &UnitId, refs: Vec<UnitRef>) -> Result<Stamp, ModelError> {
    let project = self.project_mut(&unit.project)?;
    if !project.has_config(&unit.config) {
      return Err(ModelError::UnknownConfig {
        project: unit.project.clone(),
        config: unit.config.clone(),
      });
    }
    project.references.insert(unit.config.clone(), refs);
    Ok(self.record_change(&unit.project, DESCRIPTION_PATH, ChangeKind::Changed))
  }

  pub fn set_build_spec(&mut self, name: &str, spec: Vec<StepBinding>) -> Result<Stamp, ModelError> {
    let project = self.project_mut(name)?;
    project.build_spec = spec;
    project.spec_version += 1;
    Ok(self.record_change(name, DESCRIPTION_PATH, ChangeKind::Changed))
  }

  /// Append a change to the journal and return its stamp.
  pub fn record_change(&mut self, project: &str, path: &str, kind: ChangeKind) -> Stamp {
    self.head += 1;
    let stamp = self.head;
    self.journal.push(JournalEntry {
      project: project.to_string(),
      change: Change {
        stamp,
        path: path.to_string(),
        kind,
      },
    });
    trace!(project = %project, path = %path, stamp, "change recorded");
    stamp
  }

  pub fn head(&self) -> Stamp {
    self.head
  }

  /// Changes to `project` with `after < stamp <= upto`, oldest first.
  pub fn changes(&self, project: &str, after: Stamp, upto: Stamp) -> Vec<Change> {
    self
      .journal
      .iter()
      .filter(|entry| entry.project == project && entry.change.stamp > after && entry.change.stamp <= upto)
      .map(|entry| entry.change.clone())
      .collect()
  }

  pub fn project(&self, name: &str) -> Option<&Project> {
    self.projects.get(name)
  }

  fn project_mut(&mut self, name: &str) -> Result<&mut Project, ModelError> {
    self
      .projects
      .get_mut(name)
      .ok_or_else(|| ModelError::UnknownProject(name.to_string()))
  }

  /// Projects in declaration order.
  pub fn projects(&self) -> impl Iterator<Item = &Project> {
    self.declaration_order.iter().filter_map(|name| self.projects.get(name))
  }

  /// Active units of every open project, in declaration order.
  pub fn active_units(&self) -> Vec<UnitId> {
    self.projects().filter(|p| p.open).map(Project::active_unit).collect()
  }

  /// Whether `unit` names an existing configuration of an open project.
  pub fn is_buildable(&self, unit: &UnitId) -> bool {
    self
      .projects
      .get(&unit.project)
      .is_some_and(|p| p.open && p.has_config(&unit.config))
  }

  /// Resolve a reference against the current active configurations.
  pub fn resolve_ref(&self, target: &UnitRef) -> Option<UnitId> {
    let unit = match target {
      UnitRef::Concrete(unit) => unit.clone(),
      UnitRef::Active(project) => self.projects.get(project)?.active_unit(),
    };
    self.is_buildable(&unit).then_some(unit)
  }

  pub fn last_built(&self, unit: &UnitId) -> Option<Stamp> {
    self.built.get(unit).copied()
  }

  pub fn has_been_built(&self, unit: &UnitId) -> bool {
    self.built.contains_key(unit)
  }

  /// Snapshot of every unit's last completed build.
  pub fn built_stamps(&self) -> HashMap<UnitId, Stamp> {
    self.built.clone()
  }

  pub fn mark_built(&mut self, unit: &UnitId, stamp: Stamp) {
    let entry = self.built.entry(unit.clone()).or_insert(stamp);
    *entry = (*entry).max(stamp);
  }

  /// Forget that `unit` was ever built; its next build is a full one.
  pub fn mark_cleaned(&mut self, unit: &UnitId) {
    self.built.remove(unit);
  }

  /// Drop journal entries nobody can still ask for.
  ///
  /// An entry stays while a built unit of its project has not consumed it, or
  /// while some step watching the project saw it last before the entry's
  /// stamp. `watched` maps projects to the oldest such step stamp. Units that
  /// never built are not consulted: their next build is a full one.
  pub fn compact(&mut self, watched: &HashMap<String, Stamp>) {
    let before = self.journal.len();
    let projects = &self.projects;
    let built = &self.built;
    self.journal.retain(|entry| {
      let Some(project) = projects.get(&entry.project) else {
        return false;
      };
      let stamp = entry.change.stamp;
      let unconsumed = project.configs.iter().any(|config| {
        built
          .get(&project.unit(config))
          .is_some_and(|built| *built < stamp)
      });
      unconsumed || watched.get(&entry.project).is_some_and(|seen| *seen < stamp)
    });
    let dropped = before - self.journal.len();
    if dropped > 0 {
      debug!(dropped, remaining = self.journal.len(), "journal compacted");
    }
  }

  pub fn journal_len(&self) -> usize {
    self.journal.len()
  }
}
