//! Shared helpers for library integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use buildsched_lib::build::StepContext;
use buildsched_lib::{
  BuildContext, BuildStep, Delta, StepBinding, StepOutput, StepRegistry, TriggerKind, TriggerMask, UnitId, Workspace,
  WorkspaceConfig,
};
use parking_lot::Mutex;

/// Custom behaviour for a recording step: receives the context and the
/// zero-based call number of this step instance.
pub type Behaviour = Arc<dyn Fn(&mut StepContext<'_>, usize) -> anyhow::Result<StepOutput> + Send + Sync>;

pub fn behaviour<F>(f: F) -> Behaviour
where
  F: Fn(&mut StepContext<'_>, usize) -> anyhow::Result<StepOutput> + Send + Sync + 'static,
{
  Arc::new(f)
}

/// One observed step call.
#[derive(Clone)]
pub struct Call {
  pub unit: UnitId,
  pub step: String,
  pub trigger: TriggerKind,
  pub delta: Arc<Delta>,
  pub context: Arc<BuildContext>,
  pub thread: ThreadId,
}

#[derive(Default)]
pub struct CallLog {
  calls: Mutex<Vec<Call>>,
}

impl CallLog {
  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().clone()
  }

  pub fn calls_of(&self, unit: &UnitId, step: &str) -> Vec<Call> {
    self
      .calls
      .lock()
      .iter()
      .filter(|c| &c.unit == unit && c.step == step)
      .cloned()
      .collect()
  }

  pub fn count(&self, unit: &UnitId, step: &str) -> usize {
    self.calls_of(unit, step).len()
  }

  pub fn triggers(&self, unit: &UnitId, step: &str) -> Vec<TriggerKind> {
    self.calls_of(unit, step).iter().map(|c| c.trigger).collect()
  }

  /// `project:step` for every call, in call order.
  pub fn sequence(&self) -> Vec<String> {
    self
      .calls
      .lock()
      .iter()
      .map(|c| format!("{}:{}", c.unit.project, c.step))
      .collect()
  }

  pub fn clear(&self) {
    self.calls.lock().clear();
  }
}

struct RecordingStep {
  name: String,
  log: Arc<CallLog>,
  behaviour: Option<Behaviour>,
  responds: TriggerMask,
  calls: usize,
}

impl RecordingStep {
  fn record(&self, ctx: &StepContext<'_>) {
    self.log.calls.lock().push(Call {
      unit: ctx.unit().clone(),
      step: self.name.clone(),
      trigger: ctx.trigger(),
      delta: ctx.delta(),
      context: ctx.context(),
      thread: thread::current().id(),
    });
  }
}

impl BuildStep for RecordingStep {
  fn responds_to(&self, trigger: TriggerKind) -> bool {
    self.responds.responds_to(trigger)
  }

  fn build(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<StepOutput> {
    self.record(ctx);
    let call = self.calls;
    self.calls += 1;
    match &self.behaviour {
      Some(behaviour) => behaviour(ctx, call),
      None => Ok(StepOutput::default()),
    }
  }

  fn clean(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
    self.record(ctx);
    Ok(())
  }
}

fn parse_mask(list: &str) -> TriggerMask {
  list
    .split(',')
    .filter_map(|kind| kind.trim().parse::<TriggerKind>().ok())
    .fold(TriggerMask::empty(), |mask, kind| mask | kind.mask())
}

/// A workspace whose registry holds recording steps.
///
/// Every registered id records its calls into `log`. Bindings may set a
/// `responds` argument (comma separated trigger kinds) used when the binding
/// is not configurable.
pub struct Harness {
  pub ws: Arc<Workspace>,
  pub log: Arc<CallLog>,
}

impl Harness {
  pub fn new(steps: &[&str]) -> Self {
    Self::with_behaviours(WorkspaceConfig::default(), steps, HashMap::new())
  }

  pub fn with_behaviours(config: WorkspaceConfig, steps: &[&str], behaviours: HashMap<&str, Behaviour>) -> Self {
    let log = Arc::new(CallLog::default());
    let mut registry = StepRegistry::new();
    for id in steps {
      let name = id.to_string();
      let log = log.clone();
      let behaviour = behaviours.get(id).cloned();
      registry.register(*id, move |binding: &StepBinding| {
        let responds = binding
          .args
          .get("responds")
          .map(|list| parse_mask(list))
          .unwrap_or_default();
        Ok(Box::new(RecordingStep {
          name: name.clone(),
          log: log.clone(),
          behaviour: behaviour.clone(),
          responds,
          calls: 0,
        }) as Box<dyn BuildStep>)
      });
    }
    Self {
      ws: Workspace::new(config, registry),
      log,
    }
  }

  /// Create a single-configuration project bound to `steps`.
  pub fn project(&self, name: &str, steps: &[&str]) -> UnitId {
    self.ws.create_project(name, &["default"]).unwrap();
    self.bind(name, steps.iter().map(|id| StepBinding::new(*id)).collect());
    unit(name)
  }

  pub fn bind(&self, project: &str, bindings: Vec<StepBinding>) {
    self.ws.set_build_spec(project, bindings).unwrap();
  }

  pub fn references(&self, from: &str, to: &[&str]) {
    let refs = to.iter().map(|p| buildsched_lib::UnitRef::active(*p)).collect();
    self.ws.set_references(&unit(from), refs).unwrap();
  }
}

pub fn unit(project: &str) -> UnitId {
  UnitId::new(project, "default")
}

pub fn config_with_iterations(max_iterations: usize) -> WorkspaceConfig {
  WorkspaceConfig {
    max_iterations,
    ..Default::default()
  }
}
