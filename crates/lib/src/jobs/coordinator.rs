//! Workspace-wide job coordination: families, suspension and joins.
//!
//! Background jobs register themselves under a [`JobFamily`] while they are
//! pending or running. Callers can ask whether a family has live members or
//! wait for it to drain without knowing the concrete job type. Suspending the
//! coordinator keeps pending jobs from starting, and joins fail fast while it
//! is suspended instead of waiting for work that cannot run.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// Well-known job families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobFamily {
  /// The background auto-build task.
  AutoBuild,
  /// Explicitly requested builds.
  ManualBuild,
}

impl fmt::Display for JobFamily {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      JobFamily::AutoBuild => f.write_str("auto-build"),
      JobFamily::ManualBuild => f.write_str("manual-build"),
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
  #[error("job coordinator is suspended; {family} jobs cannot complete")]
  Suspended { family: JobFamily },

  #[error("timed out after {timeout:?} waiting for {family} jobs")]
  Timeout { family: JobFamily, timeout: Duration },
}

#[derive(Debug, Clone, Default)]
struct CoordinatorState {
  suspended: bool,
  active: HashMap<JobFamily, usize>,
}

impl CoordinatorState {
  fn active(&self, family: JobFamily) -> usize {
    self.active.get(&family).copied().unwrap_or(0)
  }
}

/// Tracks family membership and the suspended flag.
#[derive(Debug)]
pub struct JobCoordinator {
  state: watch::Sender<CoordinatorState>,
}

impl Default for JobCoordinator {
  fn default() -> Self {
    Self::new()
  }
}

impl JobCoordinator {
  pub fn new() -> Self {
    let (state, _) = watch::channel(CoordinatorState::default());
    Self { state }
  }

  /// Stop pending jobs from starting until [`resume`](Self::resume).
  pub fn suspend(&self) {
    info!("job coordinator suspended");
    self.state.send_modify(|state| state.suspended = true);
  }

  pub fn resume(&self) {
    info!("job coordinator resumed");
    self.state.send_modify(|state| state.suspended = false);
  }

  pub fn is_suspended(&self) -> bool {
    self.state.borrow().suspended
  }

  /// Whether any job of `family` is pending or running.
  pub fn is_active(&self, family: JobFamily) -> bool {
    self.state.borrow().active(family) > 0
  }

  /// Register one pending or running member of `family`.
  pub fn begin(&self, family: JobFamily) {
    self.state.send_modify(|state| *state.active.entry(family).or_default() += 1);
    debug!(family = %family, "job family member registered");
  }

  /// Unregister a member previously registered with [`begin`](Self::begin).
  pub fn end(&self, family: JobFamily) {
    self.state.send_modify(|state| {
      if let Some(count) = state.active.get_mut(&family) {
        *count = count.saturating_sub(1);
      }
    });
    debug!(family = %family, "job family member finished");
  }

  /// Wait until the coordinator is not suspended.
  pub async fn wait_until_resumed(&self) {
    let mut rx = self.state.subscribe();
    // The sender lives as long as `self`, so this cannot fail while we are borrowed.
    let _ = rx.wait_for(|state| !state.suspended).await;
  }

  /// Wait for every member of `family` to finish.
  ///
  /// Returns immediately when the family is idle. Fails with
  /// [`CoordinatorError::Suspended`] as soon as the coordinator is suspended
  /// while members remain, and with [`CoordinatorError::Timeout`] when
  /// `timeout` elapses first.
  pub async fn join(&self, family: JobFamily, timeout: Option<Duration>) -> Result<(), CoordinatorError> {
    let mut rx = self.state.subscribe();
    let wait = async {
      loop {
        {
          let state = rx.borrow_and_update();
          if state.active(family) == 0 {
            return Ok(());
          }
          if state.suspended {
            return Err(CoordinatorError::Suspended { family });
          }
        }
        if rx.changed().await.is_err() {
          return Ok(());
        }
      }
    };

    match timeout {
      Some(limit) => tokio::time::timeout(limit, wait)
        .await
        .unwrap_or(Err(CoordinatorError::Timeout { family, timeout: limit })),
      None => wait.await,
    }
  }
}
