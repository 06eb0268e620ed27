//! Scheduling rules as steps and their worker threads experience them.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use buildsched_lib::jobs::LockError;
use buildsched_lib::{StepOutput, TriggerKind, Workspace, WorkspaceConfig, WorkspaceError};

use crate::common::{Behaviour, Harness, behaviour};

const WORKER_WAIT: Duration = Duration::from_secs(5);

/// A step whose first call has a worker thread record `generated.rs` in its
/// project under the step's rule, and waits for it.
fn delegating_step(slot: Arc<OnceLock<Weak<Workspace>>>) -> Behaviour {
  behaviour(move |ctx, call| {
    if call > 0 {
      return Ok(StepOutput::default());
    }
    let ws = slot.get().and_then(Weak::upgrade).context("workspace gone")?;
    let handoff = ctx.rule_handoff();
    let project = ctx.unit().project.clone();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
      let result = (|| -> Result<(), WorkspaceError> {
        let _adopted = handoff.as_ref().map(|h| h.adopt()).transpose()?;
        ws.touch(&project, "generated.rs")?;
        Ok(())
      })();
      let _ = tx.send(result);
    });

    match rx.recv_timeout(WORKER_WAIT) {
      Ok(result) => {
        result?;
        Ok(StepOutput::default())
      }
      Err(_) => Err(anyhow!("worker blocked on the step's rule")),
    }
  })
}

fn harness() -> Harness {
  let slot = Arc::new(OnceLock::new());
  let mut behaviours = HashMap::new();
  behaviours.insert("gen", delegating_step(slot.clone()));
  let h = Harness::with_behaviours(WorkspaceConfig::default(), &["gen"], behaviours);
  slot.set(Arc::downgrade(&h.ws)).unwrap();
  h
}

#[test]
fn worker_mutates_under_the_step_rule() {
  let h = harness();
  let p = h.project("p", &["gen"]);

  let report = h.ws.build(std::slice::from_ref(&p), TriggerKind::Full, true).unwrap();

  assert!(report.is_success(), "{:?}", report.failures().collect::<Vec<_>>());
  assert_eq!(h.ws.rule_lock().held_count(), 0);

  // The worker's change lands after the pass stamp, so the next pass sees it.
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Incremental, true).unwrap();
  let calls = h.log.calls_of(&p, "gen");
  assert_eq!(calls.len(), 2);
  assert!(calls[1].delta.touches("generated.rs"));
}

#[test]
fn handoff_is_stale_once_the_step_returns() {
  let handoffs = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let kept = handoffs.clone();
  let mut behaviours = HashMap::new();
  behaviours.insert(
    "keep",
    behaviour(move |ctx, _| {
      kept.lock().extend(ctx.rule_handoff());
      Ok(StepOutput::default())
    }),
  );
  let h = Harness::with_behaviours(WorkspaceConfig::default(), &["keep"], behaviours);
  h.project("p", &["keep"]);

  h.ws.build_all(TriggerKind::Full).unwrap();

  let handoff = handoffs.lock().pop().expect("step runs under the root rule");
  assert!(matches!(handoff.adopt(), Err(LockError::Released { .. })));
}
