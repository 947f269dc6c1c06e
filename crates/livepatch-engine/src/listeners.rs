//! Auxiliary load listeners
//!
//! Caches layered on top of the same load event (such as key-path identity
//! caches) register a [`LoadListener`]. A listener that finds its state no
//! longer matches the reloaded code reports [`ListenerVerdict::Diverged`];
//! nothing in a running process can repair that, so the engine only warns
//! and recommends a restart.
//!
//! [`TestCaseRunner`] is the one built-in listener: it re-runs test-case
//! classes as soon as a module carrying them has been patched in.

use tracing::{info, warn};

use crate::image::{ModuleId, PatchableImage};

/// Result of notifying a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerVerdict {
    /// The listener is consistent with the new code
    Ok,
    /// The listener's state no longer matches the new code
    Diverged(String),
}

/// Notified after every module load, once patching has finished
pub trait LoadListener: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Only notify while the key-path hook is enabled
    fn requires_key_path_hook(&self) -> bool {
        false
    }

    /// React to `module` having been patched in
    fn module_loaded(&self, image: &dyn PatchableImage, module: ModuleId) -> ListenerVerdict;
}

/// A listener reported divergence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// Listener name
    pub listener: String,
    /// What diverged
    pub reason: String,
}

/// Runs the test entry of every test-case class in a loaded module
#[derive(Debug, Clone)]
pub struct TestCaseRunner {
    entry: String,
}

impl TestCaseRunner {
    /// Call the metatype selector `entry` on injected test cases
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
        }
    }

    /// Selector called on each test-case class
    pub fn entry(&self) -> &str {
        &self.entry
    }
}

impl LoadListener for TestCaseRunner {
    fn name(&self) -> &str {
        "test-case-runner"
    }

    fn module_loaded(&self, image: &dyn PatchableImage, module: ModuleId) -> ListenerVerdict {
        for class in image.classes_in(module) {
            let info = match image.class_info(class) {
                Some(info) if info.is_test_case => info,
                _ => continue,
            };
            match image.invoke_class_method(class, &self.entry) {
                Ok(()) => info!(class = %info.name, entry = %self.entry, "Ran injected test case"),
                Err(err) => warn!(
                    class = %info.name,
                    entry = %self.entry,
                    error = %err,
                    "Injected test case could not be run"
                ),
            }
        }
        ListenerVerdict::Ok
    }
}
