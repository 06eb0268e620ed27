//! Scheduling rules: the conflict predicates the rule lock is built on.
//!
//! Conflicts are decided by the rules themselves, never by identity. Two
//! distinct rule values may conflict, and a rule may decline to conflict with
//! anything it does not recognise.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A conflict-aware scheduling rule.
///
/// Implementations must keep `is_conflicting` symmetric for rules they
/// recognise and reflexive (`rule.is_conflicting(rule)`), and `contains` must
/// be reflexive as well.
pub trait SchedulingRule: fmt::Debug + Send + Sync {
  /// Whether a thread holding `self` may also acquire `other` without waiting.
  fn contains(&self, other: &dyn SchedulingRule) -> bool;

  /// Whether `self` and `other` may not be held by two threads at once.
  fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool;

  fn as_any(&self) -> &dyn Any;
}

/// Rules over the workspace resource tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceRule {
  /// The whole workspace. Contains and conflicts with every resource rule.
  Root,
  /// A single project.
  Project(String),
}

impl ResourceRule {
  pub fn project(name: impl Into<String>) -> Self {
    ResourceRule::Project(name.into())
  }

  fn covers(&self, other: &ResourceRule) -> bool {
    match (self, other) {
      (ResourceRule::Root, _) => true,
      (ResourceRule::Project(a), ResourceRule::Project(b)) => a == b,
      (ResourceRule::Project(_), ResourceRule::Root) => false,
    }
  }
}

impl SchedulingRule for ResourceRule {
  fn contains(&self, other: &dyn SchedulingRule) -> bool {
    if let Some(other) = other.as_any().downcast_ref::<ResourceRule>() {
      return self.covers(other);
    }
    if let Some(multi) = other.as_any().downcast_ref::<MultiRule>() {
      return multi.children().iter().all(|child| self.contains(child.as_ref()));
    }
    false
  }

  fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
    if let Some(other) = other.as_any().downcast_ref::<ResourceRule>() {
      return self.covers(other) || other.covers(self);
    }
    if let Some(multi) = other.as_any().downcast_ref::<MultiRule>() {
      return multi.is_conflicting(self);
    }
    false
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

/// A combination of rules; conflicts when any child conflicts.
#[derive(Debug, Clone)]
pub struct MultiRule {
  children: Vec<Arc<dyn SchedulingRule>>,
}

impl MultiRule {
  pub fn new(children: Vec<Arc<dyn SchedulingRule>>) -> Self {
    Self { children }
  }

  pub fn children(&self) -> &[Arc<dyn SchedulingRule>] {
    &self.children
  }

  /// Combine rules, collapsing the trivial cases.
  ///
  /// Returns `None` when there is nothing to combine and the single rule
  /// itself when only one is given.
  pub fn combine(rules: Vec<Arc<dyn SchedulingRule>>) -> Option<Arc<dyn SchedulingRule>> {
    match rules.len() {
      0 => None,
      1 => rules.into_iter().next(),
      _ => Some(Arc::new(MultiRule::new(rules))),
    }
  }
}

impl SchedulingRule for MultiRule {
  fn contains(&self, other: &dyn SchedulingRule) -> bool {
    if let Some(multi) = other.as_any().downcast_ref::<MultiRule>() {
      return multi.children.iter().all(|child| self.contains(child.as_ref()));
    }
    self.children.iter().any(|child| child.contains(other))
  }

  fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
    self
      .children
      .iter()
      .any(|child| child.is_conflicting(other) || other.is_conflicting(child.as_ref()))
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

/// Whether two rules may not be held concurrently by different threads.
pub fn rules_conflict(a: &dyn SchedulingRule, b: &dyn SchedulingRule) -> bool {
  a.is_conflicting(b) || b.is_conflicting(a)
}
