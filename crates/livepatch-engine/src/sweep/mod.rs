//! Live object sweep
//!
//! After a patch, every live instance of a redefined type gets the lifecycle
//! hook invoked on it exactly once. Instances are found by walking the value
//! graph from the host's roots:
//! - containers are entered through their [`Shape`]: sequences and sets by
//!   element, mappings by value only, optionals by payload, records by field
//! - objects ([`LiveObject`]) are marked by identity so cycles terminate,
//!   filtered by the exclusion pattern, then entered through their fields,
//!   or through their raw reference slots when they offer no introspection
//! - opaque values are handed to registered [`FallbackVisitor`]s

mod legacy;
mod reflect;

use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::error::PatchError;
use crate::generics::base_name;

/// Structural category of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Plain value with nothing to visit
    Scalar,
    /// Ordered elements
    Sequence,
    /// Unordered elements
    Set,
    /// Keys and values
    Mapping,
    /// Zero or one payload
    Optional,
    /// Named fields (structs, tuples)
    Record,
    /// A class instance with identity
    Object,
    /// Foreign container only a fallback visitor understands
    Opaque,
}

/// How a child relates to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role<'a> {
    /// Sequence or set element
    Element,
    /// Mapping key
    Key,
    /// Mapping value
    Value,
    /// Optional payload
    Payload,
    /// Named record field
    Field(&'a str),
}

/// Structural view of a value reachable from the roots
pub trait Reflect: Any {
    /// Structural category
    fn shape(&self) -> Shape;

    /// Fully-qualified type name
    fn type_name(&self) -> Cow<'_, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    /// Visit direct children with their role
    fn visit_children(&self, _visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {}

    /// The object behind this value, for [`Shape::Object`]
    fn as_object(&self) -> Option<&dyn LiveObject> {
        None
    }
}

/// A class instance the sweep can notify
pub trait LiveObject {
    /// Stable identity for the lifetime of the object
    fn identity(&self) -> usize;

    /// Fully-qualified runtime type name
    fn class_name(&self) -> String;

    /// Whether [`LiveObject::visit_fields`] sees every stored field
    fn supports_introspection(&self) -> bool {
        true
    }

    /// Visit stored fields by name
    fn visit_fields(&self, visit: &mut dyn FnMut(&str, &dyn Reflect));

    /// Runtime type followed by its superclasses, most derived first
    fn class_chain(&self) -> Vec<String> {
        Vec::new()
    }

    /// Visit object references stored in the slots declared by
    /// `declaring_class`
    fn visit_reference_slots(&self, _declaring_class: &str, _visit: &mut dyn FnMut(&dyn Reflect)) {
    }

    /// Invoke `hook`. Returns false if the object does not respond to it.
    fn notify(&self, hook: &str) -> bool;
}

/// Extension point for opaque foreign containers
pub trait FallbackVisitor: Send + Sync {
    /// Visit the children of `value` if this visitor understands it.
    /// Returns whether it did.
    fn visit(&self, value: &dyn Reflect, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) -> bool;
}

/// Sweep statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Distinct objects reached
    pub objects_visited: usize,
    /// Objects the lifecycle hook was invoked on
    pub notified: usize,
    /// Objects skipped by the exclusion pattern
    pub excluded: usize,
}

/// Finds and notifies live instances of patched types
pub struct Sweeper {
    exclusion: Option<Regex>,
    framework_roots: Vec<String>,
    fallbacks: RwLock<Vec<Arc<dyn FallbackVisitor>>>,
}

impl Sweeper {
    /// Create a sweeper.
    ///
    /// An invalid `exclusion_pattern` is reported and ignored; the sweep then
    /// runs unfiltered.
    pub fn new(exclusion_pattern: Option<&str>, framework_roots: Vec<String>) -> Self {
        let exclusion = exclusion_pattern.and_then(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(error) => {
                warn!(pattern, %error, "Invalid sweep exclusion pattern; sweeping unfiltered");
                None
            }
        });
        Self {
            exclusion,
            framework_roots,
            fallbacks: RwLock::new(Vec::new()),
        }
    }

    /// Whether an exclusion pattern is in effect
    pub fn is_filtered(&self) -> bool {
        self.exclusion.is_some()
    }

    /// Register a visitor for [`Shape::Opaque`] values
    pub fn register_fallback(&self, visitor: Arc<dyn FallbackVisitor>) {
        self.fallbacks.write().push(visitor);
    }

    /// Walk `roots` and invoke `hook` once on every reachable object whose
    /// type, or generic base, is in `modified`.
    pub fn sweep(
        &self,
        roots: &[&dyn Reflect],
        modified: &FxHashSet<String>,
        hook: &str,
    ) -> Result<SweepReport, PatchError> {
        if roots.is_empty() {
            return Err(PatchError::EmptyRootSet);
        }
        let fallbacks = self.fallbacks.read().clone();
        let mut walk = Walk {
            sweeper: self,
            fallbacks: &fallbacks,
            modified,
            hook,
            seen: FxHashSet::default(),
            report: SweepReport::default(),
        };
        for root in roots {
            walk.value(*root);
        }
        debug!(
            visited = walk.report.objects_visited,
            notified = walk.report.notified,
            excluded = walk.report.excluded,
            "Sweep complete"
        );
        Ok(walk.report)
    }
}

/// State of one sweep
struct Walk<'s> {
    sweeper: &'s Sweeper,
    fallbacks: &'s [Arc<dyn FallbackVisitor>],
    modified: &'s FxHashSet<String>,
    hook: &'s str,
    seen: FxHashSet<usize>,
    report: SweepReport,
}

impl Walk<'_> {
    fn value(&mut self, value: &dyn Reflect) {
        match value.shape() {
            Shape::Scalar => {}
            Shape::Sequence | Shape::Set | Shape::Optional => {
                value.visit_children(&mut |_, child| self.value(child));
            }
            Shape::Mapping => {
                value.visit_children(&mut |role, child| {
                    if role == Role::Value {
                        self.value(child);
                    }
                });
            }
            Shape::Record => {
                value.visit_children(&mut |role, child| match role {
                    Role::Field(label) if is_metatype_field(label, child) => {}
                    _ => self.value(child),
                });
            }
            Shape::Object => {
                if let Some(object) = value.as_object() {
                    self.object(object);
                }
            }
            Shape::Opaque => {
                let fallbacks = self.fallbacks;
                let handled = fallbacks
                    .iter()
                    .any(|fallback| fallback.visit(value, &mut |_, child| self.value(child)));
                if !handled {
                    debug!(type_name = %value.type_name(), "No visitor for opaque value");
                }
            }
        }
    }

    fn object(&mut self, object: &dyn LiveObject) {
        if !self.seen.insert(object.identity()) {
            return;
        }
        let sweeper = self.sweeper;
        let class_name = object.class_name();
        if sweeper
            .exclusion
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(&class_name))
        {
            self.report.excluded += 1;
            return;
        }
        self.report.objects_visited += 1;

        if object.supports_introspection() {
            object.visit_fields(&mut |label, child| {
                if !is_metatype_field(label, child) {
                    self.value(child);
                }
            });
        } else {
            legacy::walk_reference_slots(object, &sweeper.framework_roots, &mut |child| {
                self.value(child)
            });
        }

        if self.modified.contains(&class_name) || self.modified.contains(base_name(&class_name)) {
            if object.notify(self.hook) {
                self.report.notified += 1;
            } else {
                debug!(class = %class_name, hook = self.hook, "Object does not respond to hook");
            }
        }
    }
}

/// Fields holding type metadata rather than instances
fn is_metatype_field(label: &str, child: &dyn Reflect) -> bool {
    label.ends_with(".Type")
        || label.ends_with(".Protocol")
        || label == "metatype"
        || label == "isa"
        || child.type_name().ends_with(".Type")
}
