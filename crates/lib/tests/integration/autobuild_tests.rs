//! Auto-build through a workspace: debouncing, reruns and suspension.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use buildsched_lib::jobs::CoordinatorError;
use buildsched_lib::{
  AutoBuildEvent, AutoBuildState, PassOutcome, StepOutput, TriggerKind, Workspace, WorkspaceConfig, WorkspaceError,
};
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

use crate::common::{Behaviour, Harness, behaviour};

const WAIT: Duration = Duration::from_secs(10);

fn auto_config() -> WorkspaceConfig {
  WorkspaceConfig {
    auto_build: true,
    auto_build_delay_ms: 30,
    auto_build_max_delay_ms: 300,
    ..Default::default()
  }
}

fn done_events(events: &mut broadcast::Receiver<AutoBuildEvent>) -> usize {
  let mut done = 0;
  while let Ok(event) = events.try_recv() {
    if matches!(event, AutoBuildEvent::Done(_)) {
      done += 1;
    }
  }
  done
}

/// Slot a step uses to reach the workspace it runs in.
fn workspace_slot() -> Arc<OnceLock<Weak<Workspace>>> {
  Arc::new(OnceLock::new())
}

async fn wait_for(flag: &AtomicBool) {
  let started = Instant::now();
  while !flag.load(Ordering::SeqCst) {
    assert!(started.elapsed() < WAIT, "timed out waiting for step");
    sleep(Duration::from_millis(5)).await;
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_trigger_auto_builds() {
  let h = Harness::with_behaviours(auto_config(), &["rec"], HashMap::new());
  let p = h.project("p", &["rec"]);
  let mut events = h.ws.subscribe();
  h.ws.start_auto_build().unwrap();

  h.ws.touch("p", "a.txt").unwrap();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();

  let first: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
  assert!(matches!(first[0], AutoBuildEvent::Scheduled));
  assert!(matches!(first[1], AutoBuildEvent::Running));
  match &first[2] {
    AutoBuildEvent::Done(outcome) => assert!(outcome.report().unwrap().is_success()),
    other => panic!("unexpected event {other:?}"),
  }

  h.ws.touch("p", "b.txt").unwrap();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();

  assert_eq!(h.log.triggers(&p, "rec"), vec![TriggerKind::Full, TriggerKind::Auto]);
  assert!(h.log.calls_of(&p, "rec")[1].delta.touches("b.txt"));
  assert_eq!(h.ws.auto_build_state(), Some(AutoBuildState::Idle));
  h.ws.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bursts_of_changes_coalesce() {
  let h = Harness::with_behaviours(auto_config(), &["rec"], HashMap::new());
  let p = h.project("p", &["rec"]);
  h.ws.start_auto_build().unwrap();

  for i in 0..10 {
    h.ws.touch("p", &format!("file{i}")).unwrap();
  }
  h.ws.wait_for_auto_build(WAIT).await.unwrap();

  let calls = h.log.calls_of(&p, "rec");
  assert_eq!(calls.len(), 1);
  // Ten touches plus the project's creation and build spec.
  assert_eq!(calls[0].delta.len(), 12);
}

#[tokio::test(flavor = "multi_thread")]
async fn notification_from_another_thread_during_a_run_reschedules() {
  let slot = workspace_slot();
  let ws_slot = slot.clone();
  let mut behaviours: HashMap<&str, Behaviour> = HashMap::new();
  behaviours.insert(
    "rec",
    behaviour(move |_, call| {
      if call == 0
        && let Some(ws) = ws_slot.get().and_then(Weak::upgrade)
      {
        std::thread::spawn(move || ws.request_auto_build()).join().unwrap();
      }
      Ok(StepOutput::default())
    }),
  );
  let h = Harness::with_behaviours(auto_config(), &["rec"], behaviours);
  slot.set(Arc::downgrade(&h.ws)).unwrap();
  h.project("p", &["rec"]);
  let mut events = h.ws.subscribe();
  h.ws.start_auto_build().unwrap();

  h.ws.request_auto_build();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();

  assert_eq!(done_events(&mut events), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn change_from_a_worker_thread_during_a_run_reschedules() {
  let slot = workspace_slot();
  let ws_slot = slot.clone();
  let mut behaviours: HashMap<&str, Behaviour> = HashMap::new();
  behaviours.insert(
    "rec",
    behaviour(move |ctx, call| {
      if call == 0
        && let Some(ws) = ws_slot.get().and_then(Weak::upgrade)
      {
        let handoff = ctx.rule_handoff();
        std::thread::spawn(move || -> Result<(), WorkspaceError> {
          let _adopted = handoff.as_ref().map(|h| h.adopt()).transpose()?;
          ws.touch("p", "from-worker.rs")?;
          Ok(())
        })
        .join()
        .map_err(|_| anyhow::anyhow!("worker panicked"))??;
      }
      Ok(StepOutput::default())
    }),
  );
  let h = Harness::with_behaviours(auto_config(), &["rec"], behaviours);
  slot.set(Arc::downgrade(&h.ws)).unwrap();
  let p = h.project("p", &["rec"]);
  let mut events = h.ws.subscribe();
  h.ws.start_auto_build().unwrap();

  h.ws.request_auto_build();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();

  assert_eq!(done_events(&mut events), 2);
  let calls = h.log.calls_of(&p, "rec");
  assert_eq!(calls.len(), 2);
  assert!(calls[1].delta.touches("from-worker.rs"));
}

#[tokio::test(flavor = "multi_thread")]
async fn request_after_cancelling_own_token_is_ignored() {
  let slot = workspace_slot();
  let ws_slot = slot.clone();
  let mut behaviours: HashMap<&str, Behaviour> = HashMap::new();
  behaviours.insert(
    "rec",
    behaviour(move |ctx, _| {
      ctx.cancellation().cancel();
      if let Some(ws) = ws_slot.get().and_then(Weak::upgrade) {
        ws.request_auto_build();
      }
      Ok(StepOutput::default())
    }),
  );
  let h = Harness::with_behaviours(auto_config(), &["rec"], behaviours);
  slot.set(Arc::downgrade(&h.ws)).unwrap();
  let p = h.project("p", &["rec"]);
  let mut events = h.ws.subscribe();
  h.ws.start_auto_build().unwrap();

  h.ws.request_auto_build();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();
  sleep(Duration::from_millis(100)).await;

  let mut reports = Vec::new();
  while let Ok(event) = events.try_recv() {
    if let AutoBuildEvent::Done(outcome) = event {
      reports.push(outcome);
    }
  }
  assert_eq!(reports.len(), 1);
  let report = reports[0].report().unwrap();
  assert_eq!(report.outcome, PassOutcome::Completed);
  assert_eq!(h.log.count(&p, "rec"), 1);
  assert_eq!(h.ws.auto_build_state(), Some(AutoBuildState::Idle));
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_made_by_the_running_build_do_not_reschedule() {
  let slot = workspace_slot();
  let ws_slot = slot.clone();
  let mut behaviours: HashMap<&str, Behaviour> = HashMap::new();
  behaviours.insert(
    "rec",
    behaviour(move |_, _| {
      if let Some(ws) = ws_slot.get().and_then(Weak::upgrade) {
        ws.touch("p", "generated.rs")?;
      }
      Ok(StepOutput::default())
    }),
  );
  let h = Harness::with_behaviours(auto_config(), &["rec"], behaviours);
  slot.set(Arc::downgrade(&h.ws)).unwrap();
  let p = h.project("p", &["rec"]);
  let mut events = h.ws.subscribe();
  h.ws.start_auto_build().unwrap();

  h.ws.request_auto_build();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();
  sleep(Duration::from_millis(100)).await;

  assert_eq!(done_events(&mut events), 1);
  assert_eq!(h.log.count(&p, "rec"), 1);
  assert_eq!(h.ws.auto_build_state(), Some(AutoBuildState::Idle));
}

#[tokio::test(flavor = "multi_thread")]
async fn suspended_coordinator_fails_waiters_fast() {
  let h = Harness::with_behaviours(auto_config(), &["rec"], HashMap::new());
  let p = h.project("p", &["rec"]);
  h.ws.start_auto_build().unwrap();

  h.ws.coordinator().suspend();
  h.ws.touch("p", "a").unwrap();

  let started = Instant::now();
  let err = h.ws.wait_for_auto_build(WAIT).await.unwrap_err();
  assert!(matches!(err, CoordinatorError::Suspended { .. }));
  assert!(started.elapsed() < Duration::from_secs(2));

  sleep(Duration::from_millis(100)).await;
  assert_eq!(h.log.count(&p, "rec"), 0);

  h.ws.coordinator().resume();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();
  assert_eq!(h.log.count(&p, "rec"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn enabling_auto_build_requests_a_build() {
  let config = WorkspaceConfig {
    auto_build: false,
    ..auto_config()
  };
  let h = Harness::with_behaviours(config, &["rec"], HashMap::new());
  let p = h.project("p", &["rec"]);
  h.ws.start_auto_build().unwrap();

  h.ws.touch("p", "a").unwrap();
  sleep(Duration::from_millis(100)).await;
  assert_eq!(h.log.count(&p, "rec"), 0);
  assert_eq!(h.ws.auto_build_state(), Some(AutoBuildState::Idle));

  h.ws.set_auto_build_enabled(true);
  h.ws.wait_for_auto_build(WAIT).await.unwrap();
  assert_eq!(h.log.count(&p, "rec"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn switching_active_configuration_builds_the_new_unit() {
  let h = Harness::with_behaviours(auto_config(), &["rec"], HashMap::new());
  h.ws.create_project("app", &["debug", "release"]).unwrap();
  h.bind("app", vec![buildsched_lib::StepBinding::new("rec")]);
  h.ws.start_auto_build().unwrap();

  h.ws.request_auto_build();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();
  h.ws.set_active_config("app", "release").unwrap();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();

  let units: Vec<_> = h.log.calls().iter().map(|c| (c.unit.to_string(), c.trigger)).collect();
  assert_eq!(
    units,
    vec![
      ("app/debug".to_string(), TriggerKind::Full),
      ("app/release".to_string(), TriggerKind::Full)
    ]
  );
}

/// A step that blocks on its first call until its token is cancelled.
fn blocking_step(started: Arc<AtomicBool>) -> Behaviour {
  behaviour(move |ctx, call| {
    if call > 0 {
      return Ok(StepOutput::default());
    }
    started.store(true, Ordering::SeqCst);
    let deadline = std::time::Instant::now() + WAIT;
    while !ctx.is_cancelled() {
      if std::time::Instant::now() > deadline {
        anyhow::bail!("never cancelled");
      }
      std::thread::sleep(Duration::from_millis(5));
    }
    anyhow::bail!("interrupted")
  })
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupt_cancels_and_reruns() {
  let started = Arc::new(AtomicBool::new(false));
  let mut behaviours = HashMap::new();
  behaviours.insert("slow", blocking_step(started.clone()));
  let h = Harness::with_behaviours(auto_config(), &["slow"], behaviours);
  let p = h.project("p", &["slow"]);
  let mut events = h.ws.subscribe();
  h.ws.start_auto_build().unwrap();

  h.ws.request_auto_build();
  wait_for(&started).await;
  h.ws.interrupt_auto_build();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();

  // The interrupted call failed, so the rerun is a full build again.
  assert_eq!(h.log.triggers(&p, "slow"), vec![TriggerKind::Full, TriggerKind::Full]);
  assert_eq!(done_events(&mut events), 2);
  assert!(h.ws.has_been_built(&p));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_stops_without_rerun() {
  let started = Arc::new(AtomicBool::new(false));
  let mut behaviours = HashMap::new();
  behaviours.insert("slow", blocking_step(started.clone()));
  let h = Harness::with_behaviours(auto_config(), &["slow"], behaviours);
  let p = h.project("p", &["slow"]);
  let mut events = h.ws.subscribe();
  h.ws.start_auto_build().unwrap();

  h.ws.request_auto_build();
  wait_for(&started).await;
  h.ws.cancel_auto_build();
  h.ws.wait_for_auto_build(WAIT).await.unwrap();

  assert_eq!(h.log.count(&p, "slow"), 1);
  assert_eq!(done_events(&mut events), 1);
  assert!(!h.ws.has_been_built(&p));
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_builds_run_alongside_the_scheduler() {
  let h = Harness::with_behaviours(auto_config(), &["rec"], HashMap::new());
  let p = h.project("p", &["rec"]);
  h.ws.start_auto_build().unwrap();

  let ws = h.ws.clone();
  let unit = p.clone();
  let report = tokio::task::spawn_blocking(move || ws.build(&[unit], TriggerKind::Full, true))
    .await
    .unwrap()
    .unwrap();
  assert!(report.is_success());

  // The manual build recorded no change, so nothing is pending.
  assert_eq!(h.ws.auto_build_state(), Some(AutoBuildState::Idle));
  h.ws.wait_for_auto_build(WAIT).await.unwrap();
  assert_eq!(h.log.count(&p, "rec"), 1);
}
