//! Types for build passes.
//!
//! This module defines the error type, per-pass reports and the manager
//! configuration shared by the build modules.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::consts::DEFAULT_MAX_ITERATIONS;
use crate::jobs::LockError;
use crate::unit::{TriggerKind, UnitId};
use crate::workspace::model::ModelError;

/// Errors that abort a build pass.
///
/// Individual step failures never surface here; they are recorded in
/// [`UnitReport::failures`] and the pass continues.
#[derive(Debug, Error)]
pub enum BuildError {
  /// The job coordinator is suspended, so no build may start.
  #[error("job coordinator is suspended")]
  Suspended,

  /// The scheduling lock refused the pass's rule.
  #[error("scheduling lock: {0}")]
  Lock(#[from] LockError),

  /// A binding names a step id nobody registered.
  #[error("unknown build step '{step_id}' bound in project {project}")]
  UnknownStep { project: String, step_id: String },

  /// A step factory rejected the binding's arguments.
  #[error("cannot create step '{step_id}' for {unit}: {message}")]
  StepCreation {
    unit: UnitId,
    step_id: String,
    message: String,
  },

  #[error(transparent)]
  Model(#[from] ModelError),

  /// The blocking task running the pass died.
  #[error("build task failed: {0}")]
  Task(String),
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
  /// No rebuild requests were left pending.
  Completed,
  /// Requests were still pending when `max_iterations` was reached.
  IterationCapReached,
  /// The pass's cancellation token fired at a unit boundary.
  Cancelled,
}

impl std::fmt::Display for PassOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      PassOutcome::Completed => "completed",
      PassOutcome::IterationCapReached => "iteration cap reached",
      PassOutcome::Cancelled => "cancelled",
    };
    f.write_str(name)
  }
}

/// One call into a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepInvocation {
  pub step_index: usize,
  pub step_id: String,
  /// The trigger the step actually received.
  pub trigger: TriggerKind,
  /// Zero for the initial sweep, then one per honoured round of requests.
  pub sweep: usize,
}

/// A step that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
  pub step_index: usize,
  pub step_id: String,
  pub message: String,
}

/// Everything that happened to one unit during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
  pub unit: UnitId,
  pub invocations: Vec<StepInvocation>,
  pub failures: Vec<StepFailure>,
  /// Step indices skipped because their delta was empty.
  pub skipped: Vec<usize>,
}

impl UnitReport {
  pub fn new(unit: UnitId) -> Self {
    Self {
      unit,
      invocations: Vec::new(),
      failures: Vec::new(),
      skipped: Vec::new(),
    }
  }

  /// Number of times step `index` was invoked.
  pub fn invocation_count(&self, index: usize) -> usize {
    self.invocations.iter().filter(|inv| inv.step_index == index).count()
  }

  /// Triggers received by step `index`, in invocation order.
  pub fn triggers_of(&self, index: usize) -> Vec<TriggerKind> {
    self
      .invocations
      .iter()
      .filter(|inv| inv.step_index == index)
      .map(|inv| inv.trigger)
      .collect()
  }
}

/// Result of one build pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
  /// The trigger the caller requested.
  pub trigger: TriggerKind,
  /// The resolved order.
  pub order: Vec<UnitId>,
  /// One report per unit of the order, in order.
  pub units: Vec<UnitReport>,
  pub outcome: PassOutcome,
  /// Rounds of rebuild requests that were evaluated.
  pub iterations: usize,
  #[serde(with = "duration_ms")]
  pub duration: Duration,
}

impl PassReport {
  pub fn empty(trigger: TriggerKind) -> Self {
    Self {
      trigger,
      order: Vec::new(),
      units: Vec::new(),
      outcome: PassOutcome::Completed,
      iterations: 0,
      duration: Duration::ZERO,
    }
  }

  /// Returns true if the pass completed and no step failed.
  pub fn is_success(&self) -> bool {
    self.outcome != PassOutcome::Cancelled && self.units.iter().all(|u| u.failures.is_empty())
  }

  pub fn unit(&self, unit: &UnitId) -> Option<&UnitReport> {
    self.units.iter().find(|report| &report.unit == unit)
  }

  /// Total step invocations across every unit.
  pub fn invocation_total(&self) -> usize {
    self.units.iter().map(|u| u.invocations.len()).sum()
  }

  pub fn failures(&self) -> impl Iterator<Item = (&UnitId, &StepFailure)> {
    self
      .units
      .iter()
      .flat_map(|report| report.failures.iter().map(move |failure| (&report.unit, failure)))
  }
}

mod duration_ms {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_millis())
  }
}

/// Configuration for the build manager.
#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Upper bound on rounds of rebuild requests per pass, and on the honoured
  /// self-requests of any single step.
  pub max_iterations: usize,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      max_iterations: DEFAULT_MAX_ITERATIONS,
    }
  }
}
