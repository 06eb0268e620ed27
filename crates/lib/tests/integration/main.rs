//! Library integration tests: whole build passes through a `Workspace`.

mod common;

mod autobuild_tests;
mod rule_tests;
mod trigger_tests;
