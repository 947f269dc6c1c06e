//! Selector table swizzling
//!
//! Types dispatched by selector get their new implementations copied into
//! the old descriptor's instance and metatype tables, one selector at a
//! time. Selectors the old version never had are not added, and a failed
//! swap does not stop the others.

use tracing::{debug, warn};

use crate::image::{ClassId, MethodTableKind, PatchableImage};

/// What one swizzle pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SwizzleOutcome {
    /// Selectors whose implementation was replaced
    pub replaced: usize,
    /// Selectors of the new version absent from the old one
    pub missing: usize,
    /// Swaps the image rejected
    pub failed: usize,
}

impl SwizzleOutcome {
    /// Add the counts of `other` to `self`
    pub fn merge(&mut self, other: SwizzleOutcome) {
        self.replaced += other.replaced;
        self.missing += other.missing;
        self.failed += other.failed;
    }
}

/// Copy implementations from `new` into `old` by selector name.
///
/// When `filter` is given, only selectors it accepts are considered.
pub fn swizzle_methods(
    image: &dyn PatchableImage,
    old: ClassId,
    new: ClassId,
    filter: Option<&dyn Fn(&str) -> bool>,
) -> SwizzleOutcome {
    let mut outcome = SwizzleOutcome::default();
    for kind in [MethodTableKind::Instance, MethodTableKind::Meta] {
        let (old_table, new_table) =
            match (image.method_table(old, kind), image.method_table(new, kind)) {
                (Ok(old_table), Ok(new_table)) => (old_table, new_table),
                (Err(error), _) | (_, Err(error)) => {
                    warn!(%old, %new, ?kind, %error, "Cannot read method table");
                    continue;
                }
            };

        for (selector, imp) in new_table {
            if filter.is_some_and(|accept| !accept(selector.as_str())) {
                continue;
            }
            let Some((_, current)) = old_table.iter().find(|(name, _)| *name == selector) else {
                outcome.missing += 1;
                continue;
            };
            if *current == imp {
                continue;
            }
            match image.replace_method(old, kind, &selector, imp) {
                Ok(()) => {
                    debug!(class = %old, ?kind, selector = %selector, to = %imp, "Swizzled");
                    outcome.replaced += 1;
                }
                Err(error) => {
                    warn!(class = %old, ?kind, selector = %selector, %error, "Swizzle failed");
                    outcome.failed += 1;
                }
            }
        }
    }
    outcome
}
