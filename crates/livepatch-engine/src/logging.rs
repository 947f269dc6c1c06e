//! Tracing setup for hosts that do not install their own subscriber
//!
//! The engine only emits `tracing` events. Hosts with a subscriber of their
//! own never need this module.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::defaults::ENV_LOG;

/// Filter used when `LIVEPATCH_LOG` is unset
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "livepatch_engine=debug,info"
    } else {
        "livepatch_engine=info,warn"
    }
}

/// Install a stderr `fmt` subscriber filtered by `LIVEPATCH_LOG`.
///
/// Returns false if a global subscriber was already set.
pub fn init(verbose: bool) -> bool {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .try_init()
        .is_ok()
}
