//! Background auto-build scheduling.
//!
//! Workspace changes call [`AutoBuildScheduler::notify`]. The scheduler
//! debounces bursts of notifications into a single run, never starts while the
//! job coordinator is suspended, and runs again after a pass when something
//! outside that pass dirtied the workspace meanwhile.
//!
//! The scheduler task lives on the tokio runtime; each run executes on a
//! blocking thread through an [`AutoBuildRunner`]. Notifications coming from
//! the thread executing the current run are treated as already satisfied.

mod types;

use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub use types::{AutoBuildEvent, AutoBuildOutcome};

use crate::build::{BuildError, PassReport};
use crate::jobs::{JobCoordinator, JobFamily};

/// Executes one auto-build pass. Called on a blocking thread.
pub trait AutoBuildRunner: Send + Sync + 'static {
  fn run_auto_build(&self, cancel: &CancellationToken) -> Result<PassReport, BuildError>;
}

/// Coarse scheduler state, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoBuildState {
  Idle,
  Pending,
  Running,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
  Idle,
  Pending { first: Instant, deadline: Instant },
  Running { rerun: bool },
}

#[derive(Debug)]
struct SchedulerState {
  phase: Phase,
  running_on: Option<ThreadId>,
  current: Option<CancellationToken>,
}

#[derive(Debug)]
struct Shared {
  state: Mutex<SchedulerState>,
  wake: Notify,
  events: broadcast::Sender<AutoBuildEvent>,
  coordinator: Arc<JobCoordinator>,
  delay: Duration,
  max_delay: Duration,
  shutdown: CancellationToken,
}

impl Shared {
  fn publish(&self, event: AutoBuildEvent) {
    // No subscribers is fine.
    let _ = self.events.send(event);
  }

  fn schedule(&self, state: &mut SchedulerState) {
    let now = Instant::now();
    state.phase = Phase::Pending {
      first: now,
      deadline: now + self.delay,
    };
    self.publish(AutoBuildEvent::Scheduled);
  }

  fn pending_deadline(&self) -> Option<Instant> {
    match self.state.lock().phase {
      Phase::Pending { deadline, .. } => Some(deadline),
      _ => None,
    }
  }

  fn begin_run(&self) -> Option<CancellationToken> {
    let mut state = self.state.lock();
    if !matches!(state.phase, Phase::Pending { .. }) {
      return None;
    }
    let token = self.shutdown.child_token();
    state.phase = Phase::Running { rerun: false };
    state.current = Some(token.clone());
    self.publish(AutoBuildEvent::Running);
    info!("auto-build started");
    Some(token)
  }

  fn end_run(&self, outcome: AutoBuildOutcome) {
    let mut state = self.state.lock();
    let rerun = matches!(state.phase, Phase::Running { rerun: true });
    state.current = None;
    state.running_on = None;

    match &outcome {
      AutoBuildOutcome::Finished(report) => info!(outcome = %report.outcome, rerun, "auto-build finished"),
      AutoBuildOutcome::Failed(message) => info!(error = %message, rerun, "auto-build failed"),
    }
    self.publish(AutoBuildEvent::Done(outcome));

    if rerun && !self.shutdown.is_cancelled() {
      self.schedule(&mut state);
    } else {
      state.phase = Phase::Idle;
      self.coordinator.end(JobFamily::AutoBuild);
    }
  }

  fn stop(&self) {
    let mut state = self.state.lock();
    if let Some(token) = state.current.take() {
      token.cancel();
    }
    if !matches!(state.phase, Phase::Idle) {
      state.phase = Phase::Idle;
      self.coordinator.end(JobFamily::AutoBuild);
    }
  }
}

/// Handle to the background auto-build task. Clones share the same task.
#[derive(Debug, Clone)]
pub struct AutoBuildScheduler {
  shared: Arc<Shared>,
  task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AutoBuildScheduler {
  /// Spawn the scheduler task on `handle`.
  pub fn start(
    handle: &Handle,
    runner: Weak<dyn AutoBuildRunner>,
    coordinator: Arc<JobCoordinator>,
    events: broadcast::Sender<AutoBuildEvent>,
    delay: Duration,
    max_delay: Duration,
  ) -> Self {
    let shared = Arc::new(Shared {
      state: Mutex::new(SchedulerState {
        phase: Phase::Idle,
        running_on: None,
        current: None,
      }),
      wake: Notify::new(),
      events,
      coordinator,
      delay,
      max_delay: max_delay.max(delay),
      shutdown: CancellationToken::new(),
    });
    let task = handle.spawn(run_loop(shared.clone(), runner));
    debug!(delay = ?delay, max_delay = ?max_delay, "auto-build scheduler started");
    Self {
      shared,
      task: Arc::new(Mutex::new(Some(task))),
    }
  }

  /// Record that the workspace changed.
  pub fn notify(&self) {
    if self.shared.shutdown.is_cancelled() {
      return;
    }
    let mut guard = self.shared.state.lock();
    let state = &mut *guard;
    match &mut state.phase {
      Phase::Idle => {
        self.shared.coordinator.begin(JobFamily::AutoBuild);
        self.shared.schedule(state);
        debug!("auto-build scheduled");
      }
      Phase::Pending { first, deadline } => {
        let cap = *first + self.shared.max_delay;
        *deadline = (Instant::now() + self.shared.delay).min(cap);
        trace!("auto-build deadline refreshed");
      }
      Phase::Running { rerun } => {
        if state.running_on == Some(thread::current().id()) {
          trace!("change from the running auto-build ignored");
          return;
        }
        *rerun = true;
        debug!("change during auto-build; will run again");
      }
    }
    drop(guard);
    self.shared.wake.notify_one();
  }

  /// Cancel the current run and schedule another one.
  pub fn interrupt(&self) {
    let mut guard = self.shared.state.lock();
    let state = &mut *guard;
    if let Phase::Running { rerun } = &mut state.phase {
      *rerun = true;
      if let Some(token) = &state.current {
        info!("interrupting auto-build");
        token.cancel();
      }
    }
  }

  /// Cancel the current run or the pending one, without rescheduling.
  pub fn cancel(&self) {
    let mut guard = self.shared.state.lock();
    let state = &mut *guard;
    match &mut state.phase {
      Phase::Running { rerun } => {
        *rerun = false;
        if let Some(token) = &state.current {
          info!("cancelling auto-build");
          token.cancel();
        }
      }
      Phase::Pending { .. } => {
        state.phase = Phase::Idle;
        self.shared.coordinator.end(JobFamily::AutoBuild);
        debug!("pending auto-build discarded");
      }
      Phase::Idle => {}
    }
  }

  pub fn state(&self) -> AutoBuildState {
    match self.shared.state.lock().phase {
      Phase::Idle => AutoBuildState::Idle,
      Phase::Pending { .. } => AutoBuildState::Pending,
      Phase::Running { .. } => AutoBuildState::Running,
    }
  }

  /// Signal the task to stop without waiting for it.
  pub fn stop(&self) {
    self.shared.shutdown.cancel();
  }

  /// Stop the task and wait for it to exit.
  pub async fn shutdown(&self) {
    self.stop();
    let task = self.task.lock().take();
    if let Some(task) = task {
      let _ = task.await;
    }
    debug!("auto-build scheduler stopped");
  }
}

async fn run_loop(shared: Arc<Shared>, runner: Weak<dyn AutoBuildRunner>) {
  loop {
    let Some(deadline) = shared.pending_deadline() else {
      tokio::select! {
        _ = shared.shutdown.cancelled() => break,
        _ = shared.wake.notified() => {}
      }
      continue;
    };

    if Instant::now() < deadline {
      tokio::select! {
        _ = shared.shutdown.cancelled() => break,
        _ = tokio::time::sleep_until(deadline) => {}
        _ = shared.wake.notified() => {}
      }
      continue;
    }

    if shared.coordinator.is_suspended() {
      debug!("auto-build waiting for the coordinator to resume");
      tokio::select! {
        _ = shared.shutdown.cancelled() => break,
        _ = shared.coordinator.wait_until_resumed() => {}
      }
      continue;
    }

    let Some(runner) = runner.upgrade() else {
      break;
    };
    let Some(token) = shared.begin_run() else {
      continue;
    };

    let blocking = shared.clone();
    let result = tokio::task::spawn_blocking(move || {
      blocking.state.lock().running_on = Some(thread::current().id());
      let result = runner.run_auto_build(&token);
      blocking.state.lock().running_on = None;
      result
    })
    .await;

    let outcome = match result {
      Ok(result) => AutoBuildOutcome::from_result(result),
      Err(err) => AutoBuildOutcome::Failed(format!("auto-build task failed: {err}")),
    };
    shared.end_run(outcome);
  }

  shared.stop();
}
