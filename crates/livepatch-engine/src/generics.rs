//! Generic specialization tracking
//!
//! Reloading a generic type only produces a new *base* definition; the
//! specializations already in use (`Box<Int>`, `Box<String>`) are never
//! redefined. The registry observes every specialization the runtime
//! allocates, keyed by base name, so a reload of the base can patch each
//! of them in place.
//!
//! The observer runs on whichever thread allocates, so the table has its own
//! lock, held only for the duration of an append or a copy.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::defaults::LIFECYCLE_SELECTORS;
use crate::error::PatchError;
use crate::image::{AllocationObserver, ClassId, ModuleId, PatchableImage};
use crate::swizzle::{swizzle_methods, SwizzleOutcome};
use crate::vtable::{SlotPatchOutcome, VTablePatcher};

/// Type name up to the first type-argument delimiter
pub fn base_name(name: &str) -> &str {
    match name.find('<') {
        Some(index) => name[..index].trim(),
        None => name.trim(),
    }
}

/// Base name to specializations, filled by the allocation observer
#[derive(Debug, Default)]
pub struct SpecializationTable {
    by_base: Mutex<FxHashMap<String, Vec<ClassId>>>,
}

impl SpecializationTable {
    /// Specializations recorded under `base`, in allocation order
    pub fn specializations(&self, base: &str) -> Vec<ClassId> {
        self.by_base.lock().get(base).cloned().unwrap_or_default()
    }

    /// Number of distinct base names
    pub fn base_count(&self) -> usize {
        self.by_base.lock().len()
    }
}

impl AllocationObserver for SpecializationTable {
    fn specialization_allocated(&self, class: ClassId, name: &str) {
        let base = base_name(name);
        let mut table = self.by_base.lock();
        let entries = table.entry(base.to_string()).or_default();
        if !entries.contains(&class) {
            entries.push(class);
        }
    }
}

/// State of the allocation hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    /// Generic patching is switched off or not yet installed
    Disabled,
    /// Specializations are being recorded
    Installed,
    /// The runtime offers no hook; generic patching is off for good
    Unavailable,
}

/// What patching one generic base did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenericPatchOutcome {
    /// Specializations visited
    pub specializations: usize,
    /// Combined slot outcome
    pub slots: SlotPatchOutcome,
    /// Combined lifecycle swizzle outcome
    pub swizzle: SwizzleOutcome,
}

/// Tracks specializations and patches them when their base is reloaded
#[derive(Debug)]
pub struct GenericRegistry {
    table: Arc<SpecializationTable>,
    state: HookState,
}

impl Default for GenericRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericRegistry {
    /// Create a registry with no hook installed
    pub fn new() -> Self {
        Self {
            table: Arc::new(SpecializationTable::default()),
            state: HookState::Disabled,
        }
    }

    /// Install the allocation hook.
    ///
    /// Happens at most once: after the first attempt the outcome is sticky,
    /// and an unavailable hook is only reported the first time.
    pub fn install(&mut self, image: &dyn PatchableImage, enabled: bool) -> HookState {
        if !enabled || self.state != HookState::Disabled {
            return self.state;
        }
        let observer: Arc<dyn AllocationObserver> = self.table.clone();
        self.state = match image.install_allocation_observer(observer) {
            Ok(()) => {
                debug!("Generic allocation hook installed");
                HookState::Installed
            }
            Err(PatchError::HookUnavailable) => {
                warn!("Generic metadata allocation hook not found; generic patching disabled");
                HookState::Unavailable
            }
            Err(error) => {
                warn!(%error, "Generic allocation hook failed; generic patching disabled");
                HookState::Unavailable
            }
        };
        self.state
    }

    /// Current hook state
    pub fn state(&self) -> HookState {
        self.state
    }

    /// Whether specializations are being tracked
    pub fn is_enabled(&self) -> bool {
        self.state == HookState::Installed
    }

    /// Specializations recorded under `base`
    pub fn specializations(&self, base: &str) -> Vec<ClassId> {
        self.table.specializations(base)
    }

    /// The shared table the hook writes into
    pub fn table(&self) -> &Arc<SpecializationTable> {
        &self.table
    }

    /// Patch every specialization of the generic `definition`, a base
    /// registered by `module`.
    ///
    /// Slots are redirected to `module`'s symbols; lifecycle selectors and
    /// `lifecycle_hook` are swizzled from the new base definition.
    pub fn patch_specializations(
        &self,
        image: &dyn PatchableImage,
        patcher: &mut VTablePatcher<'_>,
        definition: ClassId,
        module: ModuleId,
        lifecycle_hook: &str,
    ) -> Result<GenericPatchOutcome, PatchError> {
        let mut outcome = GenericPatchOutcome::default();
        if !self.is_enabled() {
            return Ok(outcome);
        }
        let info = image
            .class_info(definition)
            .ok_or(PatchError::UnknownClass(definition))?;
        let base = base_name(&info.name);
        let lifecycle = |selector: &str| {
            selector == lifecycle_hook || LIFECYCLE_SELECTORS.contains(&selector)
        };

        for specialization in self.specializations(base) {
            match patcher.patch_in_place(specialization, module) {
                Ok(slots) => outcome.slots.merge(slots),
                Err(error) => {
                    warn!(class = %specialization, %error, "Cannot patch specialization");
                    continue;
                }
            }
            outcome
                .swizzle
                .merge(swizzle_methods(image, specialization, definition, Some(&lifecycle)));
            outcome.specializations += 1;
        }
        debug!(
            base,
            specializations = outcome.specializations,
            slots = outcome.slots.written,
            "Patched generic specializations"
        );
        Ok(outcome)
    }
}
