//! Walker for objects without structural introspection
//!
//! Reads the object-reference slots each class in the superclass chain
//! declares, most derived first, and stops at the first framework root so
//! the walk never descends into framework-owned state.

use super::{LiveObject, Reflect};

pub(super) fn walk_reference_slots(
    object: &dyn LiveObject,
    framework_roots: &[String],
    visit: &mut dyn FnMut(&dyn Reflect),
) {
    for class in object.class_chain() {
        if framework_roots.contains(&class) {
            break;
        }
        object.visit_reference_slots(&class, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ClassBuilder, MemoryImage, ModuleBuilder, Value};

    #[test]
    fn test_stops_at_framework_root() {
        let image = MemoryImage::new();
        image
            .load(
                ModuleBuilder::new("legacy")
                    .class(ClassBuilder::new("Object").field("framework"))
                    .class(
                        ClassBuilder::new("View")
                            .superclass("Object")
                            .legacy_layout()
                            .field("child"),
                    )
                    .class(ClassBuilder::new("Leaf")),
            )
            .unwrap();
        let view = image.instantiate_named("View").unwrap();
        view.set_field("child", image.instantiate_named("Leaf").unwrap());
        view.set_field("framework", image.instantiate_named("Leaf").unwrap());
        view.set_field("count", Value::Int(3));

        let mut found = Vec::new();
        walk_reference_slots(&view, &["Object".to_string()], &mut |value| {
            found.push(value.type_name().into_owned());
        });
        assert_eq!(found, vec!["Leaf".to_string()]);

        let mut all = 0;
        walk_reference_slots(&view, &[], &mut |_| all += 1);
        assert_eq!(all, 2);
    }
}
