//! Class version sets
//!
//! A reload registers a second descriptor under a type name that is already
//! live. The descriptor from the newest module is the *new* version; every
//! descriptor from an earlier module is an *old* version that may still own
//! the only instances of the type. Old versions are patched towards the new
//! one only while their memory layout is unchanged.

use std::fmt;

use crate::image::{ClassId, ClassInfo, PatchableImage};

/// All descriptors sharing one type name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassVersionSet {
    /// Type name
    pub name: String,
    /// Descriptor from the most recent module
    pub new: ClassId,
    /// Descriptors from earlier loads, oldest first
    pub old: Vec<ClassId>,
}

impl ClassVersionSet {
    /// Build the version set whose new member is `new`.
    ///
    /// Returns `None` if `new` is unknown to the image.
    pub fn collect(image: &dyn PatchableImage, new: ClassId) -> Option<Self> {
        let info = image.class_info(new)?;
        let sequence = image.module_sequence(info.module)?;
        let old = image
            .classes_named(&info.name)
            .into_iter()
            .filter(|&candidate| candidate != new)
            .filter(|&candidate| {
                image
                    .class_info(candidate)
                    .and_then(|old| image.module_sequence(old.module))
                    .is_some_and(|old_sequence| old_sequence < sequence)
            })
            .collect();
        Some(Self {
            name: info.name,
            new,
            old,
        })
    }

    /// Whether the type existed before this load
    pub fn is_redefinition(&self) -> bool {
        !self.old.is_empty()
    }
}

/// Old and new descriptors disagree on layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutMismatch {
    /// Instance size of the old version
    pub old_size: usize,
    /// Instance size of the new version
    pub new_size: usize,
    /// Address point of the old version
    pub old_address_point: usize,
    /// Address point of the new version
    pub new_address_point: usize,
}

impl fmt::Display for LayoutMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size {} -> {}, address point {} -> {}",
            self.old_size, self.new_size, self.old_address_point, self.new_address_point
        )
    }
}

/// Slots may only be copied between descriptors of identical size and
/// address point.
pub fn layout_compatible(old: &ClassInfo, new: &ClassInfo) -> Result<(), LayoutMismatch> {
    if old.size == new.size && old.address_point == new.address_point {
        Ok(())
    } else {
        Err(LayoutMismatch {
            old_size: old.size,
            new_size: new.size,
            old_address_point: old.address_point,
            new_address_point: new.address_point,
        })
    }
}
