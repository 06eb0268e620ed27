//! Job coordination primitives shared by builds and workspace mutations.

pub mod coordinator;
pub mod lock;
pub mod rule;

pub use coordinator::{CoordinatorError, JobCoordinator, JobFamily};
pub use lock::{AdoptedRule, LockError, RuleGuard, RuleHandoff, RuleLock};
pub use rule::{MultiRule, ResourceRule, SchedulingRule, rules_conflict};
