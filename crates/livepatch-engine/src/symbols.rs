//! Address to symbol resolution
//!
//! Patching a class touches every slot of every redefined type, and each slot
//! needs its owning symbol. [`SymbolResolver`] memoizes those lookups per
//! address. It is owned by the engine and only used from the injection
//! queue, so it needs no locking.

use rustc_hash::FxHashMap;

use crate::image::{Address, ModuleId, PatchableImage, Symbol, SymbolKind};

/// Whether code of this kind may be redirected to a newer implementation.
///
/// Accessors of static or global mutable storage are excluded when
/// `preserve_static_state` is set, so reloaded code keeps reading the old
/// storage.
pub fn is_patchable(kind: SymbolKind, preserve_static_state: bool) -> bool {
    match kind {
        SymbolKind::Function
        | SymbolKind::Method
        | SymbolKind::Getter
        | SymbolKind::Setter
        | SymbolKind::StaticMember => true,
        SymbolKind::MutableAddressor => !preserve_static_state,
        SymbolKind::OpaqueGetter
        | SymbolKind::Destructor
        | SymbolKind::Thunk
        | SymbolKind::RuntimeInternal
        | SymbolKind::Metadata => false,
    }
}

/// Cache counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolverStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that scanned the image
    pub misses: u64,
}

/// Memoizing address resolver
#[derive(Debug, Default)]
pub struct SymbolResolver {
    cache: FxHashMap<Address, Option<Symbol>>,
    stats: ResolverStats,
}

impl SymbolResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the symbol located at `address`.
    ///
    /// `scope` is searched first, then every module from the most recently
    /// loaded backwards. Absence is not an error: it means the slot holding
    /// this address is left alone.
    pub fn resolve(
        &mut self,
        image: &dyn PatchableImage,
        address: Address,
        scope: Option<ModuleId>,
    ) -> Option<Symbol> {
        if address.is_null() {
            return None;
        }
        if let Some(cached) = self.cache.get(&address) {
            self.stats.hits += 1;
            return cached.clone();
        }
        self.stats.misses += 1;

        let found = scope
            .and_then(|module| image.resolve_in(module, address))
            .or_else(|| {
                image
                    .modules()
                    .into_iter()
                    .rev()
                    .filter(|module| Some(*module) != scope)
                    .find_map(|module| image.resolve_in(module, address))
            });
        self.cache.insert(address, found.clone());
        found
    }

    /// Forget negative results; a new module may define those addresses.
    pub fn module_loaded(&mut self) {
        self.cache.retain(|_, symbol| symbol.is_some());
    }

    /// Cache counters since creation
    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    /// Number of cached addresses
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
