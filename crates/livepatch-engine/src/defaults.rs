//! Default constants for engine configuration.

/// Selector invoked on every live instance of a patched type after a load.
pub const DEFAULT_LIFECYCLE_HOOK: &str = "injected";

/// Types at which the legacy object walker stops climbing the superclass chain.
pub const DEFAULT_FRAMEWORK_ROOTS: &[&str] = &["Object"];

/// Symbol whose presence switches the key-path hook on when the toggle is unset.
pub const DEFAULT_KEY_PATH_MARKER: &str = "RoutingKit.Parameters";

/// Selectors treated as basic lifecycle methods when patching generic
/// specializations. The configured lifecycle hook is always added.
pub const LIFECYCLE_SELECTORS: &[&str] = &["init", "deinit", "dealloc"];

/// Metatype selector run on injected test-case classes.
pub const DEFAULT_TEST_ENTRY: &str = "runTests";

/// Name of the dedicated injection thread in background mode.
pub const INJECTION_THREAD_NAME: &str = "livepatch-injection";

/// Slot reserved for the deallocating destructor; never rewritten.
pub const DESTRUCTOR_SLOT: usize = 0;

/// Environment variable overriding the tracing filter.
pub const ENV_LOG: &str = "LIVEPATCH_LOG";

// Environment toggles read by `PatchConfig::apply_env`.

/// Overrides `enable_generic_patching`.
pub const ENV_GENERICS: &str = "LIVEPATCH_GENERICS";
/// Overrides `enable_key_path_hook`.
pub const ENV_KEY_PATHS: &str = "LIVEPATCH_KEYPATHS";
/// Overrides `verbose_logging`.
pub const ENV_VERBOSE: &str = "LIVEPATCH_VERBOSE";
/// Overrides `benchmark_timing`.
pub const ENV_BENCHMARK: &str = "LIVEPATCH_BENCHMARK";
/// Overrides `sweep_exclusion_pattern`; an empty value clears it.
pub const ENV_EXCLUDE: &str = "LIVEPATCH_EXCLUDE";
/// Overrides `preserve_static_state`.
pub const ENV_PRESERVE_STATICS: &str = "LIVEPATCH_PRESERVE_STATICS";
/// Overrides `queue` (`main` or `background`).
pub const ENV_QUEUE: &str = "LIVEPATCH_QUEUE";
/// Overrides `run_test_cases`.
pub const ENV_TESTS: &str = "LIVEPATCH_TESTS";
