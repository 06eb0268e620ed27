//! Trigger kinds, trigger masks, clean passes and cancellation.

use std::collections::HashMap;

use buildsched_lib::{PassOutcome, StepBinding, StepOutput, TriggerKind, TriggerMask, WorkspaceConfig};
use tokio_util::sync::CancellationToken;

use crate::common::{Harness, behaviour, unit};

#[test]
fn clean_resets_built_state() {
  let h = Harness::new(&["rec"]);
  let p = h.project("p", &["rec"]);
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Full, true).unwrap();
  assert!(h.ws.has_been_built(&p));

  let report = h.ws.build(std::slice::from_ref(&p), TriggerKind::Clean, true).unwrap();
  assert_eq!(report.outcome, PassOutcome::Completed);
  assert!(!h.ws.has_been_built(&p));

  h.ws.build(std::slice::from_ref(&p), TriggerKind::Incremental, true).unwrap();
  assert_eq!(
    h.log.triggers(&p, "rec"),
    vec![TriggerKind::Full, TriggerKind::Clean, TriggerKind::Full]
  );
}

#[test]
fn first_build_is_full_whatever_was_asked() {
  let h = Harness::new(&["rec"]);
  let p = h.project("p", &["rec"]);

  h.ws.build(std::slice::from_ref(&p), TriggerKind::Auto, true).unwrap();
  h.ws.touch("p", "a").unwrap();
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Auto, true).unwrap();

  assert_eq!(h.log.triggers(&p, "rec"), vec![TriggerKind::Full, TriggerKind::Auto]);
}

#[test]
fn mask_is_checked_against_the_requested_trigger() {
  let h = Harness::new(&["rec"]);
  let p = h.project("p", &[]);
  h.bind("p", vec![StepBinding::new("rec").with_triggers(TriggerMask::INCREMENTAL)]);

  h.ws.build(std::slice::from_ref(&p), TriggerKind::Full, true).unwrap();
  assert_eq!(h.log.count(&p, "rec"), 0);
  assert!(!h.ws.has_been_built(&p));

  // Answers INCREMENTAL, and receives FULL because the unit was never built.
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Incremental, true).unwrap();
  assert_eq!(h.log.triggers(&p, "rec"), vec![TriggerKind::Full]);
  assert!(h.ws.has_been_built(&p));

  h.ws.touch("p", "a").unwrap();
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Auto, true).unwrap();
  assert_eq!(h.log.count(&p, "rec"), 1);
}

#[test]
fn full_only_step_runs_on_first_incremental_after_clean() {
  let h = Harness::new(&["rec"]);
  let p = h.project("p", &[]);
  h.bind("p", vec![StepBinding::new("rec").with_triggers(TriggerMask::FULL)]);

  h.ws.build(std::slice::from_ref(&p), TriggerKind::Full, true).unwrap();
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Clean, true).unwrap();
  assert!(!h.ws.has_been_built(&p));

  // Auto-builds leave FULL-only steps alone, even for an unbuilt unit.
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Auto, true).unwrap();
  assert_eq!(h.log.triggers(&p, "rec"), vec![TriggerKind::Full]);

  h.ws.build(std::slice::from_ref(&p), TriggerKind::Incremental, true).unwrap();
  assert_eq!(h.log.triggers(&p, "rec"), vec![TriggerKind::Full, TriggerKind::Full]);
  assert!(h.ws.has_been_built(&p));

  // Built again, so the next incremental request does not reach it.
  h.ws.touch("p", "a").unwrap();
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Incremental, true).unwrap();
  assert_eq!(h.log.count(&p, "rec"), 2);
}

#[test]
fn full_only_step_runs_on_first_incremental_of_a_new_unit() {
  let h = Harness::new(&["rec"]);
  let p = h.project("p", &[]);
  h.bind("p", vec![StepBinding::new("rec").fixed().with_arg("responds", "full")]);

  h.ws.build(std::slice::from_ref(&p), TriggerKind::Incremental, true).unwrap();

  assert_eq!(h.log.triggers(&p, "rec"), vec![TriggerKind::Full]);
  assert!(h.ws.has_been_built(&p));
}

#[test]
fn auto_builds_skip_full_only_steps() {
  let h = Harness::new(&["heavy", "light"]);
  let p = h.project("p", &[]);
  h.bind(
    "p",
    vec![
      StepBinding::new("heavy").with_triggers(TriggerMask::FULL | TriggerMask::CLEAN),
      StepBinding::new("light"),
    ],
  );
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Full, true).unwrap();

  h.ws.touch("p", "a").unwrap();
  let report = h.ws.build(std::slice::from_ref(&p), TriggerKind::Auto, true).unwrap();

  assert_eq!(report.unit(&p).unwrap().invocation_count(0), 0);
  assert_eq!(report.unit(&p).unwrap().triggers_of(1), vec![TriggerKind::Auto]);
  assert_eq!(h.log.count(&p, "heavy"), 1);
}

#[test]
fn fixed_bindings_ask_the_step() {
  let h = Harness::new(&["rec"]);
  let p = h.project("p", &[]);
  h.bind("p", vec![StepBinding::new("rec").fixed().with_arg("responds", "full")]);

  h.ws.build(std::slice::from_ref(&p), TriggerKind::Auto, true).unwrap();
  assert_eq!(h.log.count(&p, "rec"), 0);

  h.ws.build(std::slice::from_ref(&p), TriggerKind::Full, true).unwrap();
  assert_eq!(h.log.triggers(&p, "rec"), vec![TriggerKind::Full]);
}

#[test]
fn changing_the_build_spec_recreates_steps() {
  let h = Harness::new(&["a", "b"]);
  let p = h.project("p", &["a"]);
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Full, true).unwrap();

  h.bind("p", vec![StepBinding::new("b")]);
  h.ws.build(std::slice::from_ref(&p), TriggerKind::Incremental, true).unwrap();

  assert_eq!(h.log.sequence(), vec!["p:a", "p:b"]);
}

#[test]
fn unknown_step_fails_the_unit_only() {
  let h = Harness::new(&["rec"]);
  let p = h.project("p", &[]);
  h.bind("p", vec![StepBinding::new("nope")]);
  let q = h.project("q", &["rec"]);

  let report = h.ws.build(&[p.clone(), q.clone()], TriggerKind::Full, true).unwrap();

  assert!(report.unit(&p).unwrap().failures[0].message.contains("nope"));
  assert!(!h.ws.has_been_built(&p));
  assert!(h.ws.has_been_built(&q));
}

#[test]
fn cancelled_token_stops_before_any_unit() {
  let h = Harness::new(&["rec"]);
  let p = h.project("p", &["rec"]);
  let cancel = CancellationToken::new();
  cancel.cancel();

  let report = h
    .ws
    .build_with_cancel(std::slice::from_ref(&p), TriggerKind::Full, true, &cancel)
    .unwrap();

  assert_eq!(report.outcome, PassOutcome::Cancelled);
  assert_eq!(report.invocation_total(), 0);
  assert!(!h.ws.has_been_built(&p));
}

#[test]
fn cancellation_between_units_ends_the_pass() {
  let cancel = CancellationToken::new();
  let token = cancel.clone();
  let mut behaviours = HashMap::new();
  behaviours.insert(
    "stop",
    behaviour(move |ctx, _| {
      token.cancel();
      assert!(ctx.is_cancelled());
      Ok(StepOutput::default())
    }),
  );
  let h = Harness::with_behaviours(WorkspaceConfig::default(), &["stop", "rec"], behaviours);
  let first = h.project("first", &["stop", "rec"]);
  let second = h.project("second", &["rec"]);

  let report = h
    .ws
    .build_with_cancel(&[first.clone(), second.clone()], TriggerKind::Full, true, &cancel)
    .unwrap();

  assert_eq!(report.outcome, PassOutcome::Cancelled);
  // The running unit finishes its steps; the next one never starts.
  assert_eq!(h.log.count(&first, "rec"), 1);
  assert_eq!(h.log.count(&second, "rec"), 0);
}

#[test]
fn cancelling_a_step_token_leaves_the_pass_running() {
  let mut behaviours = HashMap::new();
  behaviours.insert(
    "quit",
    behaviour(|ctx, _| {
      ctx.cancellation().cancel();
      Ok(StepOutput::default())
    }),
  );
  let h = Harness::with_behaviours(WorkspaceConfig::default(), &["quit", "rec"], behaviours);
  h.project("a", &["quit"]);
  h.project("b", &["rec"]);

  let report = h.ws.build_all(TriggerKind::Full).unwrap();

  assert_eq!(report.outcome, PassOutcome::Completed);
  assert_eq!(h.log.count(&unit("b"), "rec"), 1);
}
