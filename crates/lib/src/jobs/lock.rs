//! In-process rule lock for mutual exclusion between builds and mutations.
//!
//! A thread acquires a [`SchedulingRule`] before touching the units the rule
//! covers. Acquisition waits while another thread holds a conflicting rule.
//! A thread that already holds a rule may nest any rule the held one contains;
//! asking for anything else while holding a rule is refused with
//! [`LockError::IllegalNesting`] because waiting there could deadlock.
//!
//! A held rule can be handed to a worker thread through [`RuleHandoff`]. The
//! adopting thread is treated as a co-owner until its [`AdoptedRule`] drops,
//! so it nests under the rule instead of waiting for it.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

use super::rule::{SchedulingRule, rules_conflict};

#[derive(Debug, Error)]
pub enum LockError {
  #[error("cannot acquire {requested} while holding {held}: the held rule does not contain it")]
  IllegalNesting { held: String, requested: String },

  #[error("rule {requested} conflicts with {holder}, held by another thread")]
  Contention { requested: String, holder: String },

  #[error("timed out after {waited:?} waiting for rule {requested}")]
  Timeout { requested: String, waited: Duration },

  #[error("handed-off rule {rule} was released before it was adopted")]
  Released { rule: String },
}

#[derive(Debug)]
struct HeldRule {
  id: u64,
  owner: ThreadId,
  adopters: Vec<ThreadId>,
  rule: Arc<dyn SchedulingRule>,
  depth: usize,
}

impl HeldRule {
  fn owned_by(&self, thread: ThreadId) -> bool {
    self.owner == thread || self.adopters.contains(&thread)
  }
}

#[derive(Debug, Default)]
struct LockState {
  held: Vec<HeldRule>,
  next_id: u64,
}

enum Attempt {
  Granted(u64),
  Blocked(String),
}

/// Conflict-aware lock over scheduling rules.
#[derive(Debug, Default)]
pub struct RuleLock {
  state: Mutex<LockState>,
  released: Condvar,
}

impl RuleLock {
  pub fn new() -> Self {
    Self::default()
  }

  /// Acquire `rule`, blocking until no other thread holds a conflicting rule.
  pub fn acquire(&self, rule: Arc<dyn SchedulingRule>) -> Result<RuleGuard<'_>, LockError> {
    self.acquire_inner(rule, None)
  }

  /// Acquire `rule`, giving up after `timeout`.
  pub fn acquire_timeout(&self, rule: Arc<dyn SchedulingRule>, timeout: Duration) -> Result<RuleGuard<'_>, LockError> {
    self.acquire_inner(rule, Some(Instant::now() + timeout))
  }

  /// Acquire `rule` only if that is possible without waiting.
  pub fn try_acquire(&self, rule: Arc<dyn SchedulingRule>) -> Result<RuleGuard<'_>, LockError> {
    let mut state = self.state.lock();
    match Self::attempt(&mut state, &rule)? {
      Attempt::Granted(id) => Ok(RuleGuard { lock: self, id }),
      Attempt::Blocked(holder) => Err(LockError::Contention {
        requested: format!("{rule:?}"),
        holder,
      }),
    }
  }

  /// Whether the calling thread currently holds any rule.
  pub fn held_by_current_thread(&self) -> bool {
    let me = thread::current().id();
    self.state.lock().held.iter().any(|held| held.owned_by(me))
  }

  /// Hand-off token for the outermost rule held by the calling thread.
  pub fn handoff(self: &Arc<Self>) -> Option<RuleHandoff> {
    let me = thread::current().id();
    let state = self.state.lock();
    let held = state.held.iter().find(|held| held.owner == me)?;
    Some(RuleHandoff {
      lock: self.clone(),
      id: held.id,
      rule: format!("{:?}", held.rule),
    })
  }

  /// Number of distinct rules currently held, across all threads.
  pub fn held_count(&self) -> usize {
    self.state.lock().held.len()
  }

  fn acquire_inner(
    &self,
    rule: Arc<dyn SchedulingRule>,
    deadline: Option<Instant>,
  ) -> Result<RuleGuard<'_>, LockError> {
    let started = Instant::now();
    let mut state = self.state.lock();
    loop {
      match Self::attempt(&mut state, &rule)? {
        Attempt::Granted(id) => return Ok(RuleGuard { lock: self, id }),
        Attempt::Blocked(holder) => {
          debug!(requested = ?rule, holder = %holder, "waiting for conflicting rule");
          match deadline {
            Some(deadline) => {
              if self.released.wait_until(&mut state, deadline).timed_out() {
                return Err(LockError::Timeout {
                  requested: format!("{rule:?}"),
                  waited: started.elapsed(),
                });
              }
            }
            None => self.released.wait(&mut state),
          }
        }
      }
    }
  }

  fn attempt(state: &mut LockState, rule: &Arc<dyn SchedulingRule>) -> Result<Attempt, LockError> {
    let me = thread::current().id();

    let mut owned = state.held.iter_mut().filter(|held| held.owned_by(me)).peekable();
    if owned.peek().is_some() {
      let mut first_held = None;
      for held in owned {
        if held.rule.contains(rule.as_ref()) {
          held.depth += 1;
          trace!(rule = ?rule, depth = held.depth, "nested rule acquisition");
          return Ok(Attempt::Granted(held.id));
        }
        first_held.get_or_insert_with(|| format!("{:?}", held.rule));
      }
      return Err(LockError::IllegalNesting {
        held: first_held.unwrap_or_default(),
        requested: format!("{rule:?}"),
      });
    }

    if let Some(blocker) = state
      .held
      .iter()
      .find(|held| rules_conflict(held.rule.as_ref(), rule.as_ref()))
    {
      return Ok(Attempt::Blocked(format!("{:?}", blocker.rule)));
    }

    state.next_id += 1;
    let id = state.next_id;
    state.held.push(HeldRule {
      id,
      owner: me,
      adopters: Vec::new(),
      rule: rule.clone(),
      depth: 1,
    });
    trace!(rule = ?rule, id, "rule acquired");
    Ok(Attempt::Granted(id))
  }

  fn release(&self, id: u64) {
    let mut state = self.state.lock();
    if let Some(pos) = state.held.iter().position(|held| held.id == id) {
      let held = &mut state.held[pos];
      held.depth -= 1;
      if held.depth == 0 {
        let held = state.held.remove(pos);
        trace!(rule = ?held.rule, id, "rule released");
        self.released.notify_all();
      }
    }
  }

  fn adopt(&self, id: u64, rule: &str) -> Result<u64, LockError> {
    let me = thread::current().id();
    let mut state = self.state.lock();
    let held = state
      .held
      .iter_mut()
      .find(|held| held.id == id)
      .ok_or_else(|| LockError::Released { rule: rule.to_string() })?;
    held.adopters.push(me);
    held.depth += 1;
    trace!(rule = ?held.rule, id, "rule adopted");
    Ok(id)
  }

  fn abandon(&self, id: u64, thread: ThreadId) {
    {
      let mut state = self.state.lock();
      if let Some(held) = state.held.iter_mut().find(|held| held.id == id)
        && let Some(pos) = held.adopters.iter().position(|t| *t == thread)
      {
        held.adopters.swap_remove(pos);
      }
    }
    self.release(id);
  }
}

/// Lets another thread work under a rule held by the thread that created it.
#[derive(Debug, Clone)]
pub struct RuleHandoff {
  lock: Arc<RuleLock>,
  id: u64,
  rule: String,
}

impl RuleHandoff {
  /// Become a co-owner of the rule on the calling thread.
  ///
  /// The rule stays held until the returned guard drops, even if the original
  /// holder releases it first.
  pub fn adopt(&self) -> Result<AdoptedRule, LockError> {
    let id = self.lock.adopt(self.id, &self.rule)?;
    Ok(AdoptedRule {
      lock: self.lock.clone(),
      id,
      thread: thread::current().id(),
    })
  }
}

/// Co-ownership of a handed-off rule; given back on drop.
#[derive(Debug)]
pub struct AdoptedRule {
  lock: Arc<RuleLock>,
  id: u64,
  thread: ThreadId,
}

impl Drop for AdoptedRule {
  fn drop(&mut self) {
    self.lock.abandon(self.id, self.thread);
  }
}

/// Holds an acquired rule; releases it on drop.
#[derive(Debug)]
pub struct RuleGuard<'a> {
  lock: &'a RuleLock,
  id: u64,
}

impl Drop for RuleGuard<'_> {
  fn drop(&mut self) {
    self.lock.release(self.id);
  }
}
