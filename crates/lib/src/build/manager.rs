//! The build control loop.
//!
//! A pass resolves the build order, runs every unit once, then keeps
//! evaluating the rebuild requests its steps emitted until nothing is pending,
//! the iteration cap is reached, or the pass is cancelled. Each unit runs
//! under the combined scheduling rule of its steps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delta::PassStore;
use super::graph::BuildGraph;
use super::runner::{RunParams, StepRunner, StepSelection, StepSlot, UnitRun};
use super::step::{Iterations, RebuildRequest, StepRegistry};
use super::types::{BuildConfig, BuildError, PassOutcome, PassReport, StepFailure, UnitReport};
use crate::jobs::{MultiRule, RuleLock, SchedulingRule};
use crate::unit::{TriggerKind, UnitId};
use crate::workspace::model::{Stamp, WorkspaceModel};

/// Step instances of one unit, tagged with the build spec version they were
/// created from.
struct UnitSteps {
  spec_version: u64,
  steps: Vec<Arc<StepSlot>>,
}

/// Key of the pending request table: requester unit, requester step, target.
type PendingKey = (UnitId, usize, UnitId);

#[derive(Debug, Clone, Copy)]
struct Pending {
  remaining: Iterations,
  propagate: bool,
  process_other_steps: bool,
}

/// Drives build passes over the workspace model.
pub struct BuildManager {
  model: Arc<RwLock<WorkspaceModel>>,
  lock: Arc<RuleLock>,
  registry: StepRegistry,
  config: BuildConfig,
  instances: Mutex<HashMap<UnitId, UnitSteps>>,
}

impl std::fmt::Debug for BuildManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildManager")
      .field("registry", &self.registry)
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl BuildManager {
  pub fn new(
    model: Arc<RwLock<WorkspaceModel>>,
    lock: Arc<RuleLock>,
    registry: StepRegistry,
    mut config: BuildConfig,
  ) -> Self {
    if config.max_iterations == 0 {
      warn!("max_iterations of 0 would never build anything; using 1");
      config.max_iterations = 1;
    }
    Self {
      model,
      lock,
      registry,
      config,
      instances: Mutex::new(HashMap::new()),
    }
  }

  pub fn config(&self) -> &BuildConfig {
    &self.config
  }

  /// Resolve the order a pass over `units` would use, without running it.
  pub fn resolve(&self, units: &[UnitId], include_references: bool) -> BuildGraph {
    BuildGraph::resolve(&self.model.read(), units, include_references)
  }

  /// Drop step instances of `project`; they are recreated on the next pass.
  pub fn forget_project(&self, project: &str) {
    self.instances.lock().retain(|unit, _| unit.project != project);
  }

  /// Run one pass.
  pub fn build(
    &self,
    units: &[UnitId],
    trigger: TriggerKind,
    include_references: bool,
    cancel: &CancellationToken,
  ) -> Result<PassReport, BuildError> {
    let started = Instant::now();
    let graph = Arc::new(self.resolve(units, include_references));
    let order = graph.order().to_vec();
    if order.is_empty() {
      debug!(trigger = %trigger, "nothing to build");
      return Ok(PassReport::empty(trigger));
    }

    info!(trigger = %trigger, units = order.len(), "starting build pass");
    let store = PassStore::new(self.model.clone(), graph);
    let runner = StepRunner::new(&store, &self.lock, cancel);
    let max = self.config.max_iterations;

    let mut reports: Vec<UnitReport> = order.iter().cloned().map(UnitReport::new).collect();
    let mut pending: BTreeMap<PendingKey, Pending> = BTreeMap::new();
    let mut honoured: HashMap<(UnitId, usize), usize> = HashMap::new();
    let mut requeue: Vec<(UnitId, StepSelection)> = order.iter().map(|u| (u.clone(), StepSelection::All)).collect();
    let mut outer = 0;
    let mut outcome = None;

    while !requeue.is_empty() && outer < max {
      for (unit, selection) in &requeue {
        if cancel.is_cancelled() {
          info!(unit = %unit, "build pass cancelled");
          outcome = Some(PassOutcome::Cancelled);
          break;
        }

        let run = self.run_unit(&runner, unit, selection, trigger, outer, store.stamp())?;
        if trigger != TriggerKind::Clean {
          for request in &run.requests {
            Self::merge_request(&mut pending, request);
          }
        }

        let report = match reports.iter_mut().position(|r| &r.unit == unit) {
          Some(pos) => &mut reports[pos],
          None => {
            reports.push(UnitReport::new(unit.clone()));
            let last = reports.len() - 1;
            &mut reports[last]
          }
        };
        report.invocations.extend(run.invocations);
        report.failures.extend(run.failures);
        report.skipped.extend(run.skipped);
      }

      if outcome.is_some() {
        break;
      }
      if trigger == TriggerKind::Clean || pending.is_empty() {
        outcome = Some(PassOutcome::Completed);
        break;
      }

      outer += 1;
      requeue = self.evaluate_requests(&order, &mut pending, &mut honoured);
      debug!(iteration = outer, requeued = requeue.len(), "evaluated rebuild requests");
    }

    // Every pending request may have been dropped during evaluation.
    let outcome = match outcome {
      Some(outcome) => outcome,
      None if requeue.is_empty() => PassOutcome::Completed,
      None => {
        warn!(max_iterations = max, "iteration cap reached with rebuild requests pending");
        PassOutcome::IterationCapReached
      }
    };

    match self.watched_floors() {
      Some(watched) => self.model.write().compact(&watched),
      None => debug!("steps busy in another pass; journal compaction deferred"),
    }

    let report = PassReport {
      trigger,
      order,
      units: reports,
      outcome,
      iterations: outer,
      duration: started.elapsed(),
    };
    info!(
      trigger = %trigger,
      outcome = %report.outcome,
      invocations = report.invocation_total(),
      iterations = report.iterations,
      elapsed = ?report.duration,
      "build pass finished"
    );
    Ok(report)
  }

  fn run_unit(
    &self,
    runner: &StepRunner<'_>,
    unit: &UnitId,
    selection: &StepSelection,
    trigger: TriggerKind,
    sweep: usize,
    stamp: Stamp,
  ) -> Result<UnitRun, BuildError> {
    let steps = match self.steps_for(unit) {
      Ok(steps) => steps,
      Err(err) => {
        warn!(unit = %unit, error = %err, "cannot instantiate build steps");
        let mut run = UnitRun::default();
        run.failures.push(StepFailure {
          step_index: 0,
          step_id: String::new(),
          message: err.to_string(),
        });
        return Ok(run);
      }
    };

    let built = self.model.read().has_been_built(unit);
    let effective = effective_trigger(trigger, sweep, built);
    let params = RunParams {
      requested: trigger,
      effective,
      sweep,
    };

    let rule = self.unit_rule(unit, &steps, selection, params);
    let guard = rule.map(|rule| self.lock.acquire(rule)).transpose()?;
    let run = runner.run(unit, &steps, selection, params);
    drop(guard);

    let mut model = self.model.write();
    if trigger == TriggerKind::Clean {
      model.mark_cleaned(unit);
    } else if !run.failed() && (built || !run.invocations.is_empty()) {
      model.mark_built(unit, stamp);
    }
    Ok(run)
  }

  /// Combined rule of the steps that will respond in this run.
  fn unit_rule(
    &self,
    unit: &UnitId,
    steps: &[Arc<StepSlot>],
    selection: &StepSelection,
    params: RunParams,
  ) -> Option<Arc<dyn SchedulingRule>> {
    let rules = steps
      .iter()
      .enumerate()
      .filter(|(index, _)| selection.includes(*index))
      .filter_map(|(_, slot)| {
        let state = slot.state.lock();
        if !slot.accepts(&*state.step, params) {
          return None;
        }
        state.step.scheduling_rule(unit, params.effective, &slot.binding.args)
      })
      .collect();
    MultiRule::combine(rules)
  }

  /// Oldest stamp from which any step still watches each project, or `None`
  /// while a step is running in another pass.
  fn watched_floors(&self) -> Option<HashMap<String, Stamp>> {
    let mut floors: HashMap<String, Stamp> = HashMap::new();
    for unit_steps in self.instances.lock().values() {
      for slot in &unit_steps.steps {
        let state = slot.state.try_lock()?;
        for (watched, stamp) in &state.seen {
          floors
            .entry(watched.project.clone())
            .and_modify(|floor| *floor = (*floor).min(*stamp))
            .or_insert(*stamp);
        }
      }
    }
    Some(floors)
  }

  fn steps_for(&self, unit: &UnitId) -> Result<Vec<Arc<StepSlot>>, BuildError> {
    let (version, spec) = {
      let model = self.model.read();
      match model.project(&unit.project) {
        Some(project) => (project.spec_version, project.build_spec.clone()),
        None => return Ok(Vec::new()),
      }
    };

    let mut instances = self.instances.lock();
    if let Some(existing) = instances.get(unit)
      && existing.spec_version == version
    {
      return Ok(existing.steps.clone());
    }

    let steps = spec
      .into_iter()
      .map(|binding| {
        let step = self.registry.create(unit, &binding)?;
        Ok(Arc::new(StepSlot::new(binding, step)))
      })
      .collect::<Result<Vec<_>, BuildError>>()?;
    debug!(unit = %unit, steps = steps.len(), version, "instantiated build steps");
    instances.insert(
      unit.clone(),
      UnitSteps {
        spec_version: version,
        steps: steps.clone(),
      },
    );
    Ok(steps)
  }

  fn merge_request(pending: &mut BTreeMap<PendingKey, Pending>, request: &RebuildRequest) {
    if request.iterations.is_exhausted() {
      return;
    }
    let key = (request.requester.clone(), request.step_index, request.target.clone());
    let entry = pending.entry(key).or_insert(Pending {
      remaining: request.iterations,
      propagate: request.propagate,
      process_other_steps: request.process_other_steps,
    });
    entry.remaining = entry.remaining.max(request.iterations);
    entry.propagate |= request.propagate;
    entry.process_other_steps |= request.process_other_steps;
  }

  /// Honour pending requests and build the next requeue.
  fn evaluate_requests(
    &self,
    order: &[UnitId],
    pending: &mut BTreeMap<PendingKey, Pending>,
    honoured: &mut HashMap<(UnitId, usize), usize>,
  ) -> Vec<(UnitId, StepSelection)> {
    let max = self.config.max_iterations;
    let mut propagate = false;
    let mut targets: Vec<(UnitId, StepSelection)> = Vec::new();

    pending.retain(|(requester, step_index, target), request| {
      let count = honoured.entry((requester.clone(), *step_index)).or_default();
      if *count >= max {
        debug!(unit = %requester, step = step_index, "step exhausted its rebuild allowance");
        return false;
      }
      if !self.model.read().is_buildable(target) {
        warn!(unit = %requester, target = %target, "ignoring rebuild request for missing or closed unit");
        return false;
      }
      *count += 1;
      propagate |= request.propagate;

      let selection = if request.process_other_steps || target != requester {
        StepSelection::All
      } else {
        StepSelection::only(*step_index)
      };
      match targets.iter_mut().find(|(unit, _)| unit == target) {
        Some((_, existing)) => existing.merge(selection),
        None => targets.push((target.clone(), selection)),
      }

      request.remaining = request.remaining.decrement();
      !request.remaining.is_exhausted()
    });

    if propagate {
      return order.iter().map(|u| (u.clone(), StepSelection::All)).collect();
    }

    // Targets in order first, then units outside the order as they were requested.
    targets.sort_by_key(|(unit, _)| order.iter().position(|u| u == unit).unwrap_or(order.len()));
    targets
  }
}

/// Trigger the steps of a unit actually receive.
///
/// Later sweeps are incremental; a unit that has not been built since it was
/// created, cleaned or the process started always gets a full build.
pub fn effective_trigger(requested: TriggerKind, sweep: usize, built: bool) -> TriggerKind {
  if requested == TriggerKind::Clean {
    return TriggerKind::Clean;
  }
  if !built {
    return TriggerKind::Full;
  }
  if sweep == 0 { requested } else { TriggerKind::Incremental }
}
