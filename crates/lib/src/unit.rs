//! Identity types for buildable units and build triggers.
//!
//! A unit is a `(project, configuration)` pair. References between units are
//! declared either against a concrete configuration or against whatever
//! configuration of a project is active when the build order is resolved.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Identifies a buildable unit: a project and one of its configurations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
  pub project: String,
  pub config: String,
}

impl UnitId {
  pub fn new(project: impl Into<String>, config: impl Into<String>) -> Self {
    Self {
      project: project.into(),
      config: config.into(),
    }
  }
}

impl fmt::Display for UnitId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.project, self.config)
  }
}

/// A declared reference target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRef {
  /// A specific configuration of a project.
  Concrete(UnitId),
  /// The active configuration of a project, looked up at resolution time.
  Active(String),
}

impl UnitRef {
  pub fn active(project: impl Into<String>) -> Self {
    UnitRef::Active(project.into())
  }

  pub fn concrete(project: impl Into<String>, config: impl Into<String>) -> Self {
    UnitRef::Concrete(UnitId::new(project, config))
  }

  /// The project this reference points into.
  pub fn project(&self) -> &str {
    match self {
      UnitRef::Concrete(id) => &id.project,
      UnitRef::Active(project) => project,
    }
  }
}

impl From<UnitId> for UnitRef {
  fn from(id: UnitId) -> Self {
    UnitRef::Concrete(id)
  }
}

/// The reason a build runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
  Full,
  Incremental,
  Auto,
  Clean,
}

impl TriggerKind {
  /// Whether steps of this trigger run regardless of the delta.
  pub fn ignores_delta(self) -> bool {
    matches!(self, TriggerKind::Full | TriggerKind::Clean)
  }

  pub fn mask(self) -> TriggerMask {
    match self {
      TriggerKind::Full => TriggerMask::FULL,
      TriggerKind::Incremental => TriggerMask::INCREMENTAL,
      TriggerKind::Auto => TriggerMask::AUTO,
      TriggerKind::Clean => TriggerMask::CLEAN,
    }
  }
}

impl fmt::Display for TriggerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TriggerKind::Full => "full",
      TriggerKind::Incremental => "incremental",
      TriggerKind::Auto => "auto",
      TriggerKind::Clean => "clean",
    };
    f.write_str(name)
  }
}

impl std::str::FromStr for TriggerKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "full" => Ok(TriggerKind::Full),
      "incremental" => Ok(TriggerKind::Incremental),
      "auto" => Ok(TriggerKind::Auto),
      "clean" => Ok(TriggerKind::Clean),
      other => Err(format!("unknown trigger kind: {other}")),
    }
  }
}

bitflags! {
  /// Set of triggers a step binding is interested in.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct TriggerMask: u8 {
    const FULL = 1;
    const INCREMENTAL = 1 << 1;
    const AUTO = 1 << 2;
    const CLEAN = 1 << 3;
  }
}

impl TriggerMask {
  pub fn responds_to(self, trigger: TriggerKind) -> bool {
    self.contains(trigger.mask())
  }
}

impl Default for TriggerMask {
  fn default() -> Self {
    TriggerMask::all()
  }
}

impl Serialize for TriggerMask {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let kinds: Vec<TriggerKind> = [
      TriggerKind::Full,
      TriggerKind::Incremental,
      TriggerKind::Auto,
      TriggerKind::Clean,
    ]
    .into_iter()
    .filter(|kind| self.responds_to(*kind))
    .collect();
    kinds.serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for TriggerMask {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let kinds = Vec::<TriggerKind>::deserialize(deserializer)?;
    Ok(kinds.into_iter().fold(TriggerMask::empty(), |mask, kind| mask | kind.mask()))
  }
}
