//! Runs the steps of one unit for one sweep.
//!
//! The runner never interprets rebuild requests; it hands them back to the
//! manager together with what it invoked, skipped and saw fail.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::delta::PassStore;
use super::step::{BuildStep, RebuildRequest, StepContext};
use super::types::{StepFailure, StepInvocation};
use crate::jobs::RuleLock;
use crate::unit::{TriggerKind, UnitId};
use crate::workspace::model::{Stamp, StepBinding};

/// Which steps of a unit to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSelection {
  All,
  Steps(BTreeSet<usize>),
}

impl StepSelection {
  pub fn only(index: usize) -> Self {
    StepSelection::Steps(BTreeSet::from([index]))
  }

  pub fn includes(&self, index: usize) -> bool {
    match self {
      StepSelection::All => true,
      StepSelection::Steps(set) => set.contains(&index),
    }
  }

  /// Widen `self` to also cover `other`.
  pub fn merge(&mut self, other: StepSelection) {
    match (&mut *self, other) {
      (StepSelection::All, _) => {}
      (_, StepSelection::All) => *self = StepSelection::All,
      (StepSelection::Steps(mine), StepSelection::Steps(theirs)) => mine.extend(theirs),
    }
  }
}

pub(crate) struct StepState {
  pub step: Box<dyn BuildStep>,
  /// Units named in the step's last output.
  pub interesting: Vec<UnitId>,
  /// Pass stamp at which the step last completed watching each unit.
  pub seen: HashMap<UnitId, Stamp>,
}

/// A step instance bound to one unit, kept across passes.
pub(crate) struct StepSlot {
  pub binding: StepBinding,
  pub state: Mutex<StepState>,
}

impl StepSlot {
  pub fn new(binding: StepBinding, step: Box<dyn BuildStep>) -> Self {
    Self {
      binding,
      state: Mutex::new(StepState {
        step,
        interesting: Vec::new(),
        seen: HashMap::new(),
      }),
    }
  }

  pub fn responds_to(&self, step: &dyn BuildStep, trigger: TriggerKind) -> bool {
    if self.binding.configurable {
      self.binding.triggers.responds_to(trigger)
    } else {
      step.responds_to(trigger)
    }
  }

  /// Whether the step takes part in a run with `params`.
  ///
  /// Bindings are matched against the requested trigger. When an unbuilt unit
  /// turns an incremental request into a full build, steps answering FULL run
  /// too. Auto-builds never pull in FULL-only steps.
  pub fn accepts(&self, step: &dyn BuildStep, params: RunParams) -> bool {
    if self.responds_to(step, params.requested) {
      return true;
    }
    params.effective == TriggerKind::Full
      && params.requested == TriggerKind::Incremental
      && self.responds_to(step, TriggerKind::Full)
  }
}

/// Triggers for one run of a unit.
#[derive(Debug, Clone, Copy)]
pub struct RunParams {
  /// What the caller asked for; bindings are matched against this.
  pub requested: TriggerKind,
  /// What the steps receive.
  pub effective: TriggerKind,
  pub sweep: usize,
}

/// Outcome of running one unit.
#[derive(Debug, Default)]
pub struct UnitRun {
  pub requests: Vec<RebuildRequest>,
  pub invocations: Vec<StepInvocation>,
  pub failures: Vec<StepFailure>,
  pub skipped: Vec<usize>,
}

impl UnitRun {
  pub fn failed(&self) -> bool {
    !self.failures.is_empty()
  }
}

pub(crate) struct StepRunner<'a> {
  store: &'a PassStore,
  lock: &'a Arc<RuleLock>,
  cancel: &'a CancellationToken,
}

impl<'a> StepRunner<'a> {
  pub fn new(store: &'a PassStore, lock: &'a Arc<RuleLock>, cancel: &'a CancellationToken) -> Self {
    Self { store, lock, cancel }
  }

  pub fn run(&self, unit: &UnitId, steps: &[Arc<StepSlot>], selection: &StepSelection, params: RunParams) -> UnitRun {
    let mut run = UnitRun::default();

    for (index, slot) in steps.iter().enumerate() {
      if !selection.includes(index) {
        continue;
      }
      let mut guard = slot.state.lock();
      let StepState { step, interesting, seen } = &mut *guard;

      if !slot.accepts(&**step, params) {
        trace!(unit = %unit, step = %slot.binding.step_id, trigger = %params.requested, "step not interested in trigger");
        continue;
      }

      if params.effective != TriggerKind::Clean
        && params.sweep == 0
        && !params.effective.ignores_delta()
        && !slot.binding.call_on_empty_delta
        && !self.has_changes(unit, interesting, seen)
      {
        debug!(unit = %unit, step = %slot.binding.step_id, "skipping step with empty delta");
        run.skipped.push(index);
        continue;
      }

      let mut ctx = StepContext::new(
        unit,
        index,
        params.effective,
        &slot.binding.args,
        self.store,
        self.lock,
        interesting.as_slice(),
        seen,
        self.cancel.child_token(),
      );

      debug!(unit = %unit, step = %slot.binding.step_id, trigger = %params.effective, sweep = params.sweep, "invoking step");
      let outcome = if params.effective == TriggerKind::Clean {
        panic::catch_unwind(AssertUnwindSafe(|| step.clean(&mut ctx).map(|()| None)))
      } else {
        panic::catch_unwind(AssertUnwindSafe(|| step.build(&mut ctx).map(Some)))
      };
      let requests = ctx.take_requests();
      drop(ctx);

      run.invocations.push(StepInvocation {
        step_index: index,
        step_id: slot.binding.step_id.clone(),
        trigger: params.effective,
        sweep: params.sweep,
      });

      let message = match outcome {
        Ok(Ok(output)) => {
          if let Some(output) = output {
            *interesting = output.interesting_units;
            seen.retain(|watched, _| interesting.contains(watched));
            for watched in interesting.iter() {
              seen.insert(watched.clone(), self.store.stamp());
            }
          }
          run.requests.extend(requests);
          continue;
        }
        Ok(Err(err)) => format!("{err:#}"),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
      };
      error!(unit = %unit, step = %slot.binding.step_id, error = %message, "build step failed");
      run.failures.push(StepFailure {
        step_index: index,
        step_id: slot.binding.step_id.clone(),
        message,
      });
    }

    run
  }

  /// Whether the unit changed this pass, or any unit the step watches changed
  /// since the step last saw it.
  fn has_changes(&self, unit: &UnitId, interesting: &[UnitId], seen: &HashMap<UnitId, Stamp>) -> bool {
    if self.store.delta(unit).is_some_and(|delta| !delta.is_empty()) {
      return true;
    }
    interesting.iter().any(|watched| {
      self
        .store
        .delta_since(watched, seen.get(watched).copied())
        .is_some_and(|delta| !delta.is_empty())
    })
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
