//! Seed roots for the live object sweep
//!
//! The host registers the top-level references it owns (root controllers,
//! windows, observers). The set is shared: the host may keep adding roots
//! while the engine runs, and every sweep works on a snapshot.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::sweep::Reflect;

/// One registered root
pub type Root = Arc<dyn Reflect + Send + Sync>;

/// Shared, growable root set
#[derive(Clone, Default)]
pub struct SeedRoots {
    roots: Arc<RwLock<Vec<Root>>>,
}

impl SeedRoots {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root
    pub fn add(&self, root: Root) {
        self.roots.write().push(root);
    }

    /// Register a value as a root
    pub fn add_value<T: Reflect + Send + Sync>(&self, value: T) {
        self.add(Arc::new(value));
    }

    /// Drop every root
    pub fn clear(&self) {
        self.roots.write().clear();
    }

    /// Current roots
    pub fn snapshot(&self) -> Vec<Root> {
        self.roots.read().clone()
    }

    /// Number of roots
    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SeedRoots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedRoots").field("len", &self.len()).finish()
    }
}
