//! The build step contract and the registry steps are created from.
//!
//! A project's build spec binds registered step ids. For every unit the
//! manager keeps one instance per binding, created through the
//! [`StepRegistry`], and calls it with a [`StepContext`] describing the
//! current pass. Steps talk back only through the context: rebuild requests
//! and the units they want deltas of next time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::context::BuildContext;
use super::delta::{Delta, PassStore};
use super::types::BuildError;
use crate::jobs::{ResourceRule, RuleHandoff, RuleLock, SchedulingRule};
use crate::unit::{TriggerKind, UnitId};
use crate::workspace::model::{Stamp, StepBinding};

/// A build step bound into a project.
pub trait BuildStep: Send {
  /// Triggers this step answers to when its binding is not configurable.
  fn responds_to(&self, _trigger: TriggerKind) -> bool {
    true
  }

  /// Run the step.
  fn build(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<StepOutput>;

  /// Discard whatever the step produced. Called for CLEAN passes.
  fn clean(&mut self, _ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
    Ok(())
  }

  /// Rule the manager must hold while this step runs on `unit`.
  ///
  /// Defaults to the whole workspace. `None` means the step needs no rule.
  /// Worker threads that mutate the workspace on the step's behalf adopt the
  /// rule through [`StepContext::rule_handoff`].
  fn scheduling_rule(
    &self,
    _unit: &UnitId,
    _trigger: TriggerKind,
    _args: &BTreeMap<String, String>,
  ) -> Option<Arc<dyn SchedulingRule>> {
    Some(Arc::new(ResourceRule::Root))
  }
}

/// What a step returns from [`BuildStep::build`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
  /// Units whose deltas the step wants on its next invocation.
  pub interesting_units: Vec<UnitId>,
}

impl StepOutput {
  pub fn interested_in(units: impl IntoIterator<Item = UnitId>) -> Self {
    Self {
      interesting_units: units.into_iter().collect(),
    }
  }
}

/// How many more times a request asks to be honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Iterations {
  Times(u32),
  Unbounded,
}

impl Iterations {
  pub fn once() -> Self {
    Iterations::Times(1)
  }

  pub fn is_exhausted(self) -> bool {
    self == Iterations::Times(0)
  }

  /// One fewer, saturating at zero. `Unbounded` stays unbounded.
  pub fn decrement(self) -> Self {
    match self {
      Iterations::Times(n) => Iterations::Times(n.saturating_sub(1)),
      Iterations::Unbounded => Iterations::Unbounded,
    }
  }
}

impl fmt::Display for Iterations {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Iterations::Times(n) => write!(f, "{n}"),
      Iterations::Unbounded => f.write_str("unbounded"),
    }
  }
}

/// Flags for [`StepContext::request_rebuild`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildOptions {
  /// Requeue the whole order rather than just the target.
  pub propagate: bool,
  /// Rerun every step of the requester's unit, not only the requester.
  pub process_other_steps: bool,
}

/// A rebuild request emitted by a running step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildRequest {
  pub requester: UnitId,
  pub step_index: usize,
  pub target: UnitId,
  pub iterations: Iterations,
  pub propagate: bool,
  pub process_other_steps: bool,
}

impl RebuildRequest {
  pub fn targets_requester(&self) -> bool {
    self.target == self.requester
  }
}

/// Everything a step may see and do during one invocation.
pub struct StepContext<'a> {
  unit: &'a UnitId,
  step_index: usize,
  trigger: TriggerKind,
  args: &'a BTreeMap<String, String>,
  store: &'a PassStore,
  lock: &'a Arc<RuleLock>,
  interesting: &'a [UnitId],
  seen: &'a HashMap<UnitId, Stamp>,
  cancel: CancellationToken,
  requests: Vec<RebuildRequest>,
}

impl<'a> StepContext<'a> {
  pub(crate) fn new(
    unit: &'a UnitId,
    step_index: usize,
    trigger: TriggerKind,
    args: &'a BTreeMap<String, String>,
    store: &'a PassStore,
    lock: &'a Arc<RuleLock>,
    interesting: &'a [UnitId],
    seen: &'a HashMap<UnitId, Stamp>,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      unit,
      step_index,
      trigger,
      args,
      store,
      lock,
      interesting,
      seen,
      cancel,
      requests: Vec::new(),
    }
  }

  pub fn unit(&self) -> &UnitId {
    self.unit
  }

  pub fn step_index(&self) -> usize {
    self.step_index
  }

  /// The effective trigger for this invocation.
  pub fn trigger(&self) -> TriggerKind {
    self.trigger
  }

  pub fn args(&self) -> &BTreeMap<String, String> {
    self.args
  }

  pub fn arg(&self, key: &str) -> Option<&str> {
    self.args.get(key).map(String::as_str)
  }

  /// This unit's delta for the current pass.
  pub fn delta(&self) -> Arc<Delta> {
    self.store.delta_or_empty(self.unit)
  }

  /// Delta of another unit, covering what changed since this step last
  /// completed with the unit named as interesting.
  ///
  /// Only units this step named as interesting in its previous output are
  /// answered; anything else, and units that are missing or closed, yield
  /// `None`.
  pub fn delta_for(&self, unit: &UnitId) -> Option<Arc<Delta>> {
    if unit == self.unit {
      return Some(self.delta());
    }
    if !self.interesting.contains(unit) {
      return None;
    }
    self.store.delta_since(unit, self.seen.get(unit).copied())
  }

  pub fn context(&self) -> Arc<BuildContext> {
    self.store.context(self.unit)
  }

  /// Token for this invocation. Cancelling it does not cancel the pass.
  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Token a worker thread adopts to mutate the workspace under this step's
  /// rule. `None` when the step runs without a rule, in which case workers
  /// acquire rules as usual.
  pub fn rule_handoff(&self) -> Option<RuleHandoff> {
    self.lock.handoff()
  }

  /// Ask for this step's unit to be rebuilt.
  pub fn request_rebuild(&mut self, iterations: Iterations, options: RebuildOptions) {
    self.push_request(self.unit.clone(), iterations, options);
  }

  /// Ask for another unit to be rebuilt. Every step of the target runs.
  pub fn request_unit_rebuild(&mut self, target: UnitId, iterations: Iterations, propagate: bool) {
    self.push_request(
      target,
      iterations,
      RebuildOptions {
        propagate,
        process_other_steps: true,
      },
    );
  }

  fn push_request(&mut self, target: UnitId, iterations: Iterations, options: RebuildOptions) {
    self.requests.push(RebuildRequest {
      requester: self.unit.clone(),
      step_index: self.step_index,
      target,
      iterations,
      propagate: options.propagate,
      process_other_steps: options.process_other_steps,
    });
  }

  pub(crate) fn take_requests(&mut self) -> Vec<RebuildRequest> {
    std::mem::take(&mut self.requests)
  }
}

type StepFactory = Arc<dyn Fn(&StepBinding) -> anyhow::Result<Box<dyn BuildStep>> + Send + Sync>;

/// Maps step ids to factories.
#[derive(Clone, Default)]
pub struct StepRegistry {
  factories: HashMap<String, StepFactory>,
}

impl fmt::Debug for StepRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut ids: Vec<_> = self.factories.keys().collect();
    ids.sort();
    f.debug_struct("StepRegistry").field("ids", &ids).finish()
  }
}

impl StepRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `factory` under `id`, replacing any previous registration.
  pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
  where
    F: Fn(&StepBinding) -> anyhow::Result<Box<dyn BuildStep>> + Send + Sync + 'static,
  {
    self.factories.insert(id.into(), Arc::new(factory));
  }

  pub fn contains(&self, id: &str) -> bool {
    self.factories.contains_key(id)
  }

  /// Create a step instance for `binding` on `unit`.
  pub fn create(&self, unit: &UnitId, binding: &StepBinding) -> Result<Box<dyn BuildStep>, BuildError> {
    let factory = self.factories.get(&binding.step_id).ok_or_else(|| BuildError::UnknownStep {
      project: unit.project.clone(),
      step_id: binding.step_id.clone(),
    })?;
    factory(binding).map_err(|err| BuildError::StepCreation {
      unit: unit.clone(),
      step_id: binding.step_id.clone(),
      message: format!("{err:#}"),
    })
  }
}
