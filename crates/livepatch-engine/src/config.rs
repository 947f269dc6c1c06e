//! Engine configuration
//!
//! [`PatchConfig`] is read from TOML and then overlaid with `LIVEPATCH_*`
//! environment variables. Every field has a default, so an empty document is
//! a valid configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::defaults;

/// Errors raised while reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File that was attempted
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The TOML document is malformed
    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// An environment variable holds a value that cannot be parsed
    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

/// Where patch work is serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// The host pumps the queue from its own run loop
    Main,
    /// A dedicated background thread owns the engine
    #[default]
    Background,
}

/// Recognized engine toggles
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Track generic specializations and patch them on reload
    pub enable_generic_patching: bool,
    /// Notify listeners that need the key-path hook. `None` means "on if the
    /// image exports [`PatchConfig::key_path_marker`]".
    pub enable_key_path_hook: Option<bool>,
    /// Log every slot write and rebinding at info level
    pub verbose_logging: bool,
    /// Log the time spent in each patch phase
    pub benchmark_timing: bool,
    /// Regex over fully-qualified type names; matching objects are skipped by
    /// the sweep
    pub sweep_exclusion_pattern: Option<String>,
    /// Never redirect accessors of static or global mutable storage
    pub preserve_static_state: bool,
    /// Selector invoked on live instances of patched types
    pub lifecycle_hook: String,
    /// Types at which the legacy object walker stops
    pub framework_roots: Vec<String>,
    /// Symbol looked up when `enable_key_path_hook` is unset
    pub key_path_marker: String,
    /// Re-run injected test-case classes once their module is patched in
    pub run_test_cases: bool,
    /// Metatype selector called on each injected test-case class
    pub test_entry: String,
    /// Where patch work runs
    pub queue: QueueMode,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            enable_generic_patching: true,
            enable_key_path_hook: None,
            verbose_logging: false,
            benchmark_timing: false,
            sweep_exclusion_pattern: None,
            preserve_static_state: false,
            lifecycle_hook: defaults::DEFAULT_LIFECYCLE_HOOK.to_string(),
            framework_roots: defaults::DEFAULT_FRAMEWORK_ROOTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            key_path_marker: defaults::DEFAULT_KEY_PATH_MARKER.to_string(),
            run_test_cases: true,
            test_entry: defaults::DEFAULT_TEST_ENTRY.to_string(),
            queue: QueueMode::default(),
        }
    }
}

impl PatchConfig {
    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Read a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Overlay `LIVEPATCH_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Overlay `LIVEPATCH_*` variables from an arbitrary lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(defaults::ENV_GENERICS) {
            self.enable_generic_patching = parse_flag(defaults::ENV_GENERICS, &value)?;
        }
        if let Some(value) = lookup(defaults::ENV_KEY_PATHS) {
            self.enable_key_path_hook = Some(parse_flag(defaults::ENV_KEY_PATHS, &value)?);
        }
        if let Some(value) = lookup(defaults::ENV_VERBOSE) {
            self.verbose_logging = parse_flag(defaults::ENV_VERBOSE, &value)?;
        }
        if let Some(value) = lookup(defaults::ENV_BENCHMARK) {
            self.benchmark_timing = parse_flag(defaults::ENV_BENCHMARK, &value)?;
        }
        if let Some(value) = lookup(defaults::ENV_EXCLUDE) {
            self.sweep_exclusion_pattern = (!value.is_empty()).then_some(value);
        }
        if let Some(value) = lookup(defaults::ENV_PRESERVE_STATICS) {
            self.preserve_static_state = parse_flag(defaults::ENV_PRESERVE_STATICS, &value)?;
        }
        if let Some(value) = lookup(defaults::ENV_TESTS) {
            self.run_test_cases = parse_flag(defaults::ENV_TESTS, &value)?;
        }
        if let Some(value) = lookup(defaults::ENV_QUEUE) {
            self.queue = match value.to_ascii_lowercase().as_str() {
                "main" => QueueMode::Main,
                "background" => QueueMode::Background,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: defaults::ENV_QUEUE,
                        value,
                    })
                }
            };
        }
        Ok(())
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}
