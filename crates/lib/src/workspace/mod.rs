//! The workspace: projects, builds and the auto-build scheduler behind one handle.
//!
//! A [`Workspace`] is shared as an `Arc`. Mutations take the affected
//! project's scheduling rule, record a journal entry and wake the auto-build
//! scheduler. Builds run synchronously on the calling thread; the auto-build
//! scheduler runs them on the tokio blocking pool once
//! [`Workspace::start_auto_build`] was called.
//!
//! # Submodules
//!
//! - [`model`] - In-memory projects, references and change journal
//! - [`manifest`] - JSON manifests declaring projects

pub mod manifest;
pub mod model;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::autobuild::{AutoBuildEvent, AutoBuildRunner, AutoBuildScheduler, AutoBuildState};
use crate::build::{BuildError, BuildManager, PassReport, StepRegistry};
use crate::config::WorkspaceConfig;
use crate::consts::EVENT_BUS_CAPACITY;
use crate::jobs::{CoordinatorError, JobCoordinator, JobFamily, LockError, ResourceRule, RuleLock, SchedulingRule};
use crate::unit::{TriggerKind, UnitId, UnitRef};

use self::manifest::{ManifestError, WorkspaceManifest};
use self::model::{ChangeKind, ModelError, Stamp, StepBinding, WorkspaceModel};

#[derive(Debug, Error)]
pub enum WorkspaceError {
  #[error(transparent)]
  Model(#[from] ModelError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error("auto-build requires a tokio runtime: {0}")]
  NoRuntime(String),
}

/// Keeps one member of a job family registered while alive.
struct FamilyMember<'a> {
  coordinator: &'a JobCoordinator,
  family: JobFamily,
}

impl<'a> FamilyMember<'a> {
  fn join(coordinator: &'a JobCoordinator, family: JobFamily) -> Self {
    coordinator.begin(family);
    Self { coordinator, family }
  }
}

impl Drop for FamilyMember<'_> {
  fn drop(&mut self) {
    self.coordinator.end(self.family);
  }
}

pub struct Workspace {
  model: Arc<RwLock<WorkspaceModel>>,
  lock: Arc<RuleLock>,
  coordinator: Arc<JobCoordinator>,
  manager: BuildManager,
  config: WorkspaceConfig,
  events: broadcast::Sender<AutoBuildEvent>,
  auto_build: AtomicBool,
  scheduler: Mutex<Option<AutoBuildScheduler>>,
}

impl std::fmt::Debug for Workspace {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Workspace")
      .field("config", &self.config)
      .field("manager", &self.manager)
      .finish_non_exhaustive()
  }
}

impl Workspace {
  pub fn new(config: WorkspaceConfig, registry: StepRegistry) -> Arc<Self> {
    let model = Arc::new(RwLock::new(WorkspaceModel::new()));
    let lock = Arc::new(RuleLock::new());
    let manager = BuildManager::new(model.clone(), lock.clone(), registry, config.build_config());
    let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    Arc::new(Self {
      model,
      lock,
      coordinator: Arc::new(JobCoordinator::new()),
      manager,
      auto_build: AtomicBool::new(config.auto_build),
      config,
      events,
      scheduler: Mutex::new(None),
    })
  }

  pub fn config(&self) -> &WorkspaceConfig {
    &self.config
  }

  pub fn coordinator(&self) -> &JobCoordinator {
    &self.coordinator
  }

  pub fn rule_lock(&self) -> &RuleLock {
    &self.lock
  }

  /// Subscribe to auto-build events. Drop the receiver to unsubscribe.
  pub fn subscribe(&self) -> broadcast::Receiver<AutoBuildEvent> {
    self.events.subscribe()
  }

  // --- model access ---

  /// Run `f` against a read view of the model.
  pub fn with_model<R>(&self, f: impl FnOnce(&WorkspaceModel) -> R) -> R {
    f(&self.model.read())
  }

  pub fn active_units(&self) -> Vec<UnitId> {
    self.model.read().active_units()
  }

  pub fn has_been_built(&self, unit: &UnitId) -> bool {
    self.model.read().has_been_built(unit)
  }

  /// The order a build of `units` would use right now.
  pub fn resolve_order(&self, units: &[UnitId], include_references: bool) -> Vec<UnitId> {
    self.manager.resolve(units, include_references).order().to_vec()
  }

  // --- mutations ---

  fn mutate<R>(
    &self,
    rule: ResourceRule,
    f: impl FnOnce(&mut WorkspaceModel) -> Result<R, ModelError>,
  ) -> Result<R, WorkspaceError> {
    let rule: Arc<dyn SchedulingRule> = Arc::new(rule);
    let _guard = self.lock.acquire(rule)?;
    let result = {
      let mut model = self.model.write();
      f(&mut model)?
    };
    self.request_auto_build();
    Ok(result)
  }

  pub fn apply_manifest(&self, manifest: &WorkspaceManifest) -> Result<(), WorkspaceError> {
    self.mutate(ResourceRule::Root, |model| manifest.apply_to(model))
  }

  pub fn create_project(&self, name: &str, configs: &[&str]) -> Result<(), WorkspaceError> {
    self.mutate(ResourceRule::project(name), |model| model.create_project(name, configs))?;
    info!(project = %name, "project created");
    Ok(())
  }

  pub fn delete_project(&self, name: &str) -> Result<(), WorkspaceError> {
    self.mutate(ResourceRule::project(name), |model| model.delete_project(name))?;
    self.manager.forget_project(name);
    info!(project = %name, "project deleted");
    Ok(())
  }

  pub fn close_project(&self, name: &str) -> Result<(), WorkspaceError> {
    self.mutate(ResourceRule::project(name), |model| model.set_open(name, false))?;
    self.manager.forget_project(name);
    Ok(())
  }

  pub fn open_project(&self, name: &str) -> Result<(), WorkspaceError> {
    self.mutate(ResourceRule::project(name), |model| model.set_open(name, true))?;
    Ok(())
  }

  pub fn set_active_config(&self, project: &str, config: &str) -> Result<(), WorkspaceError> {
    self.mutate(ResourceRule::project(project), |model| {
      model.set_active_config(project, config)
    })?;
    debug!(project = %project, config = %config, "active configuration changed");
    Ok(())
  }

  pub fn set_references(&self, unit: &UnitId, refs: Vec<UnitRef>) -> Result<(), WorkspaceError> {
    self.mutate(ResourceRule::project(unit.project.clone()), |model| {
      model.set_references(unit, refs)
    })?;
    Ok(())
  }

  pub fn set_build_spec(&self, project: &str, spec: Vec<StepBinding>) -> Result<(), WorkspaceError> {
    self.mutate(ResourceRule::project(project), |model| model.set_build_spec(project, spec))?;
    Ok(())
  }

  /// Record a change to `path` in `project`.
  pub fn record_change(&self, project: &str, path: &str, kind: ChangeKind) -> Result<Stamp, WorkspaceError> {
    self.mutate(ResourceRule::project(project), |model| {
      if model.project(project).is_none() {
        return Err(ModelError::UnknownProject(project.to_string()));
      }
      Ok(model.record_change(project, path, kind))
    })
  }

  pub fn touch(&self, project: &str, path: &str) -> Result<Stamp, WorkspaceError> {
    self.record_change(project, path, ChangeKind::Changed)
  }

  /// Run `f` while holding `rule`.
  pub fn run_with_rule<R>(&self, rule: Arc<dyn SchedulingRule>, f: impl FnOnce() -> R) -> Result<R, LockError> {
    let _guard = self.lock.acquire(rule)?;
    Ok(f())
  }

  // --- builds ---

  pub fn build(
    &self,
    units: &[UnitId],
    trigger: TriggerKind,
    include_references: bool,
  ) -> Result<PassReport, BuildError> {
    self.build_with_cancel(units, trigger, include_references, &CancellationToken::new())
  }

  pub fn build_with_cancel(
    &self,
    units: &[UnitId],
    trigger: TriggerKind,
    include_references: bool,
    cancel: &CancellationToken,
  ) -> Result<PassReport, BuildError> {
    if self.coordinator.is_suspended() {
      return Err(BuildError::Suspended);
    }
    let _member = FamilyMember::join(&self.coordinator, JobFamily::ManualBuild);
    self.manager.build(units, trigger, include_references, cancel)
  }

  /// Build the active configuration of every open project.
  pub fn build_all(&self, trigger: TriggerKind) -> Result<PassReport, BuildError> {
    let units = self.active_units();
    self.build(&units, trigger, true)
  }

  // --- auto-build ---

  pub fn is_auto_build_enabled(&self) -> bool {
    self.auto_build.load(Ordering::SeqCst)
  }

  /// Turn auto-build on or off. Enabling requests a build; disabling cancels
  /// the pending or running one.
  pub fn set_auto_build_enabled(&self, enabled: bool) {
    let was = self.auto_build.swap(enabled, Ordering::SeqCst);
    if was == enabled {
      return;
    }
    info!(enabled, "auto-build toggled");
    if enabled {
      self.request_auto_build();
    } else if let Some(scheduler) = self.scheduler.lock().as_ref() {
      scheduler.cancel();
    }
  }

  /// Ask for an auto-build as if the workspace had changed.
  pub fn request_auto_build(&self) {
    if !self.is_auto_build_enabled() {
      return;
    }
    if let Some(scheduler) = self.scheduler.lock().as_ref() {
      scheduler.notify();
    }
  }

  /// Cancel the running auto-build and schedule another.
  pub fn interrupt_auto_build(&self) {
    if let Some(scheduler) = self.scheduler.lock().as_ref() {
      scheduler.interrupt();
    }
  }

  /// Cancel the pending or running auto-build without rescheduling.
  pub fn cancel_auto_build(&self) {
    if let Some(scheduler) = self.scheduler.lock().as_ref() {
      scheduler.cancel();
    }
  }

  pub fn auto_build_state(&self) -> Option<AutoBuildState> {
    self.scheduler.lock().as_ref().map(AutoBuildScheduler::state)
  }

  /// Wait until no auto-build is pending or running.
  ///
  /// Fails with [`CoordinatorError::Suspended`] right away while the
  /// coordinator is suspended and an auto-build is outstanding.
  pub async fn wait_for_auto_build(&self, timeout: Duration) -> Result<(), CoordinatorError> {
    self.coordinator.join(JobFamily::AutoBuild, Some(timeout)).await
  }

  /// Start the auto-build scheduler on the current tokio runtime.
  pub fn start_auto_build(self: &Arc<Self>) -> Result<(), WorkspaceError> {
    let handle = Handle::try_current().map_err(|err| WorkspaceError::NoRuntime(err.to_string()))?;
    let mut slot = self.scheduler.lock();
    if slot.is_some() {
      return Ok(());
    }
    let runner: Weak<dyn AutoBuildRunner> = Arc::downgrade(self) as Weak<dyn AutoBuildRunner>;
    *slot = Some(AutoBuildScheduler::start(
      &handle,
      runner,
      self.coordinator.clone(),
      self.events.clone(),
      self.config.auto_build_delay(),
      self.config.auto_build_max_delay(),
    ));
    info!(enabled = self.is_auto_build_enabled(), "auto-build scheduler running");
    Ok(())
  }

  /// Stop the auto-build scheduler and wait for it to exit.
  pub async fn shutdown(&self) {
    let scheduler = self.scheduler.lock().take();
    if let Some(scheduler) = scheduler {
      scheduler.shutdown().await;
    }
  }
}

impl AutoBuildRunner for Workspace {
  fn run_auto_build(&self, cancel: &CancellationToken) -> Result<PassReport, BuildError> {
    if self.coordinator.is_suspended() {
      return Err(BuildError::Suspended);
    }
    let units = self.active_units();
    self.manager.build(&units, TriggerKind::Auto, true, cancel)
  }
}

impl Drop for Workspace {
  fn drop(&mut self) {
    if let Some(scheduler) = self.scheduler.get_mut().take() {
      scheduler.stop();
    }
  }
}
