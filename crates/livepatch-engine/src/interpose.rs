//! Process-wide symbol interposition
//!
//! The registry maps every patchable symbol name to the newest implementation
//! any load has provided. Entries are only ever replaced by loads with a
//! higher sequence number; a load that does not export a name leaves its
//! entry untouched.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::PatchError;
use crate::image::{Address, ModuleId, PatchableImage, Rebinding};
use crate::symbols::is_patchable;

/// The newest known implementation of one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterposedSymbol {
    /// Implementation address
    pub address: Address,
    /// Module that provided it
    pub module: ModuleId,
    /// Load sequence of that module
    pub sequence: u64,
}

/// Name to newest-implementation table
#[derive(Debug, Default)]
pub struct InterpositionRegistry {
    entries: FxHashMap<String, InterposedSymbol>,
    preserve_static_state: bool,
}

impl InterpositionRegistry {
    /// Create an empty registry
    pub fn new(preserve_static_state: bool) -> Self {
        Self {
            entries: FxHashMap::default(),
            preserve_static_state,
        }
    }

    /// Newest address recorded for `name`
    pub fn lookup(&self, name: &str) -> Option<Address> {
        self.entries.get(name).map(|entry| entry.address)
    }

    /// Full entry for `name`
    pub fn entry(&self, name: &str) -> Option<&InterposedSymbol> {
        self.entries.get(name)
    }

    /// Number of interposed names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been interposed yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `entry` for `name` unless a later load already provided one.
    /// Returns whether the recorded address changed.
    pub fn record(&mut self, name: &str, entry: InterposedSymbol) -> bool {
        match self.entries.get_mut(name) {
            Some(existing) if existing.sequence > entry.sequence => false,
            Some(existing) => {
                let changed = existing.address != entry.address;
                *existing = entry;
                changed
            }
            None => {
                self.entries.insert(name.to_string(), entry);
                true
            }
        }
    }

    /// Take in a freshly loaded module.
    ///
    /// Records its patchable exports, points the call sites of every other
    /// module at them, then replays the whole table into the new module so
    /// it stops calling the stale code it was linked against. Returns the
    /// names whose call sites actually changed, sorted.
    pub fn absorb(
        &mut self,
        image: &dyn PatchableImage,
        module: ModuleId,
    ) -> Result<Vec<String>, PatchError> {
        let sequence = image
            .module_sequence(module)
            .ok_or(PatchError::UnknownModule(module))?;

        let mut batch = Vec::new();
        for symbol in image.exported_symbols(module) {
            if !is_patchable(symbol.kind, self.preserve_static_state) {
                continue;
            }
            self.record(
                &symbol.name,
                InterposedSymbol {
                    address: symbol.address,
                    module,
                    sequence,
                },
            );
            if let Some(address) = self.lookup(&symbol.name) {
                batch.push(Rebinding {
                    name: symbol.name,
                    address,
                });
            }
        }

        let mut rebound = BTreeSet::new();
        if !batch.is_empty() {
            for other in image.modules() {
                if other == module {
                    continue;
                }
                for name in image.rewrite_call_sites(other, &batch) {
                    debug!(symbol = %name, module = %other, "Rebound call site");
                    rebound.insert(name);
                }
            }
        }

        let history: Vec<Rebinding> = self
            .entries
            .iter()
            .map(|(name, entry)| Rebinding {
                name: name.clone(),
                address: entry.address,
            })
            .collect();
        for name in image.rewrite_call_sites(module, &history) {
            debug!(symbol = %name, module = %module, "Replayed interposition");
            rebound.insert(name);
        }

        Ok(rebound.into_iter().collect())
    }
}
