//! Virtual dispatch table patching
//!
//! Old descriptors keep their identity (live instances point at them) but
//! have their slots rewritten to the implementations of the newest version.
//! Writes only happen when a slot actually differs, so patching the same
//! pair twice is a no-op.

use tracing::{debug, info, warn};

use crate::classes::layout_compatible;
use crate::defaults::DESTRUCTOR_SLOT;
use crate::error::PatchError;
use crate::image::{Address, ClassId, ModuleId, PatchableImage};
use crate::interpose::InterpositionRegistry;
use crate::symbols::{is_patchable, SymbolResolver};

/// What one patch call did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotPatchOutcome {
    /// Slots rewritten
    pub written: usize,
    /// Slots that already held the right implementation
    pub unchanged: usize,
    /// Slots left alone: unresolved or not patchable
    pub skipped: usize,
    /// Slot writes rejected by the image
    pub failed: usize,
    /// The pair was refused because the layout changed
    pub layout_mismatch: bool,
}

impl SlotPatchOutcome {
    /// Add the counts of `other` to `self`
    pub fn merge(&mut self, other: SlotPatchOutcome) {
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.layout_mismatch |= other.layout_mismatch;
    }
}

/// Rewrites slot tables for one module load
pub struct VTablePatcher<'a> {
    image: &'a dyn PatchableImage,
    resolver: &'a mut SymbolResolver,
    registry: &'a InterpositionRegistry,
    preserve_static_state: bool,
    verbose: bool,
}

impl<'a> VTablePatcher<'a> {
    /// Create a patcher borrowing the engine's resolver and registry
    pub fn new(
        image: &'a dyn PatchableImage,
        resolver: &'a mut SymbolResolver,
        registry: &'a InterpositionRegistry,
        preserve_static_state: bool,
        verbose: bool,
    ) -> Self {
        Self {
            image,
            resolver,
            registry,
            preserve_static_state,
            verbose,
        }
    }

    /// Point the slots of `old` at the implementations held by `new`, which
    /// was registered by `module`.
    pub fn patch(
        &mut self,
        old: ClassId,
        new: ClassId,
        module: ModuleId,
    ) -> Result<SlotPatchOutcome, PatchError> {
        let old_info = self
            .image
            .class_info(old)
            .ok_or(PatchError::UnknownClass(old))?;
        let new_info = self
            .image
            .class_info(new)
            .ok_or(PatchError::UnknownClass(new))?;

        let mut outcome = SlotPatchOutcome::default();
        if let Err(mismatch) = layout_compatible(&old_info, &new_info) {
            warn!(
                class = %new_info.name,
                %mismatch,
                "Layout changed; adding or removing stored properties is not supported, skipping class"
            );
            outcome.layout_mismatch = true;
            return Ok(outcome);
        }

        let old_slots = self.image.read_slot_table(old)?;
        let new_slots = self.image.read_slot_table(new)?;
        if old_slots.len() != new_slots.len() {
            warn!(
                class = %new_info.name,
                old = old_slots.len(),
                new = new_slots.len(),
                "Slot count changed; adding or removing methods is not supported, skipping class"
            );
            outcome.layout_mismatch = true;
            return Ok(outcome);
        }

        for index in DESTRUCTOR_SLOT + 1..old_slots.len() {
            let Some(target) = self.slot_target(new_slots[index], module) else {
                outcome.skipped += 1;
                continue;
            };
            self.apply(&new_info.name, old, index, old_slots[index], target, &mut outcome);
        }
        Ok(outcome)
    }

    /// Patch a descriptor that has no separate new version, such as a generic
    /// specialization. Each slot is redirected to the same-named symbol of
    /// `module`, or failing that to the newest interposed implementation.
    pub fn patch_in_place(
        &mut self,
        class: ClassId,
        module: ModuleId,
    ) -> Result<SlotPatchOutcome, PatchError> {
        let info = self
            .image
            .class_info(class)
            .ok_or(PatchError::UnknownClass(class))?;
        let slots = self.image.read_slot_table(class)?;

        let mut outcome = SlotPatchOutcome::default();
        for (index, &current) in slots.iter().enumerate().skip(DESTRUCTOR_SLOT + 1) {
            let Some(symbol) = self.resolver.resolve(self.image, current, None) else {
                outcome.skipped += 1;
                continue;
            };
            if !is_patchable(symbol.kind, self.preserve_static_state) {
                outcome.skipped += 1;
                continue;
            }
            let Some(target) = self
                .image
                .lookup_symbol(module, &symbol.name)
                .or_else(|| self.registry.lookup(&symbol.name))
            else {
                outcome.skipped += 1;
                continue;
            };
            self.apply(&info.name, class, index, current, target, &mut outcome);
        }
        Ok(outcome)
    }

    /// Implementation a slot of the new version should resolve to, or `None`
    /// if the slot must be left alone.
    fn slot_target(&mut self, address: Address, module: ModuleId) -> Option<Address> {
        let symbol = self.resolver.resolve(self.image, address, Some(module))?;
        if !is_patchable(symbol.kind, self.preserve_static_state) {
            debug!(symbol = %symbol.name, kind = symbol.kind.name(), "Slot not patchable");
            return None;
        }
        // Inherited slots still bind to the first module that defined the
        // symbol; an override from a later load takes precedence.
        if symbol.module != module {
            if let Some(latest) = self.registry.lookup(&symbol.name) {
                if latest != address {
                    return Some(latest);
                }
            }
        }
        Some(address)
    }

    fn apply(
        &self,
        class_name: &str,
        class: ClassId,
        index: usize,
        current: Address,
        target: Address,
        outcome: &mut SlotPatchOutcome,
    ) {
        if current == target {
            outcome.unchanged += 1;
            return;
        }
        match self.image.write_slot(class, index, target) {
            Ok(()) => {
                if self.verbose {
                    info!(class = class_name, slot = index, from = %current, to = %target, "Patched slot");
                } else {
                    debug!(class = class_name, slot = index, from = %current, to = %target, "Patched slot");
                }
                outcome.written += 1;
            }
            Err(error) => {
                warn!(class = class_name, slot = index, %error, "Slot write failed");
                outcome.failed += 1;
            }
        }
    }
}
