//! Shared defaults and environment variable names.

/// Default bound on rounds of rebuild requests per pass.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Default debounce between a workspace change and the auto-build it triggers.
pub const DEFAULT_AUTO_BUILD_DELAY_MS: u64 = 100;

/// Default upper bound on how long a burst of changes may keep postponing an
/// auto-build.
pub const DEFAULT_AUTO_BUILD_MAX_DELAY_MS: u64 = 2_000;

/// Overrides `max_iterations` from the config file.
pub const ENV_MAX_ITERATIONS: &str = "BSCHED_MAX_ITERATIONS";

/// Overrides `auto_build` from the config file (`1`/`0`, `true`/`false`, `on`/`off`).
pub const ENV_AUTO_BUILD: &str = "BSCHED_AUTO_BUILD";

/// Capacity of the auto-build event bus.
pub const EVENT_BUS_CAPACITY: usize = 64;
