//! The patchable image capability
//!
//! Every component of the engine reaches the host runtime through
//! [`PatchableImage`]: listing and resolving symbols, rewriting call-site
//! cells, reading and writing class slot tables, swapping selector
//! implementations and observing generic metadata allocation. Porting the
//! engine to a different runtime means implementing this trait and nothing
//! else.
//!
//! Two implementations ship with the crate:
//! - [`MemoryImage`]: a self-contained managed runtime with callable host
//!   functions, classes and instances
//! - [`NativeImage`] (unix): shared objects loaded with `dlopen` that describe
//!   themselves through a `livepatch_sdk::LpManifest`

mod memory;

#[cfg(unix)]
mod loader;
#[cfg(unix)]
mod native;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use livepatch_sdk::SymbolKind;
pub use memory::{
    ClassBuilder, HostFn, Invocation, MemoryImage, ModuleBuilder, ObjectRef, Value,
};

#[cfg(unix)]
pub use loader::Library;
#[cfg(unix)]
pub use native::NativeImage;

use crate::error::PatchError;

/// A code or data address inside the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub usize);

impl Address {
    /// The null address
    pub const NULL: Address = Address(0);

    /// Check for the null address
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifies one loaded code module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Identifies one class descriptor registered with the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub usize);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// An exported symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name
    pub name: String,
    /// Entry address
    pub address: Address,
    /// Module that defines it
    pub module: ModuleId,
    /// Explicit classification
    pub kind: SymbolKind,
}

/// Static description of a class descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    /// Fully-qualified type name (`Box<Int>` for specializations)
    pub name: String,
    /// Module that registered the descriptor
    pub module: ModuleId,
    /// Superclass type name
    pub superclass: Option<String>,
    /// Total instance size
    pub size: usize,
    /// Address point offset inside the metadata
    pub address_point: usize,
    /// Generic base definition
    pub is_generic: bool,
    /// Inherits from a generic class
    pub derives_from_generic: bool,
    /// Test case whose test entry runs after injection
    pub is_test_case: bool,
}

impl ClassInfo {
    /// Type name up to the first type-argument delimiter
    pub fn base_name(&self) -> &str {
        crate::generics::base_name(&self.name)
    }
}

/// Which selector table of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodTableKind {
    /// Instance methods
    Instance,
    /// Metatype (static) methods
    Meta,
}

/// Redirect every call site for `name` to `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebinding {
    /// Called symbol
    pub name: String,
    /// New target
    pub address: Address,
}

/// Receives every generic specialization the runtime creates.
///
/// Called from whichever thread instantiates the specialization, so
/// implementations must synchronize their own storage.
pub trait AllocationObserver: Send + Sync {
    /// A concrete descriptor named `name` was just allocated
    fn specialization_allocated(&self, class: ClassId, name: &str);
}

/// The host runtime as seen by the patch engine
pub trait PatchableImage: Send + Sync {
    /// Load a freshly built module
    fn load_module(&self, path: &Path) -> Result<ModuleId, PatchError>;

    /// All loaded modules in load order
    fn modules(&self) -> Vec<ModuleId>;

    /// Load sequence number (1 for the first module)
    fn module_sequence(&self, module: ModuleId) -> Option<u64>;

    /// Exported symbols of a module, in table order
    fn exported_symbols(&self, module: ModuleId) -> Vec<Symbol>;

    /// The symbol of `module` located at `address`
    fn resolve_in(&self, module: ModuleId, address: Address) -> Option<Symbol>;

    /// Address of `name` as exported by `module`
    fn lookup_symbol(&self, module: ModuleId, name: &str) -> Option<Address>;

    /// Retarget the call sites of `module`. Returns the names whose target
    /// actually changed.
    fn rewrite_call_sites(&self, module: ModuleId, rebindings: &[Rebinding]) -> Vec<String>;

    /// Class descriptors registered by `module`
    fn classes_in(&self, module: ModuleId) -> Vec<ClassId>;

    /// Every descriptor sharing `name`, in registration order
    fn classes_named(&self, name: &str) -> Vec<ClassId>;

    /// Describe a class descriptor
    fn class_info(&self, class: ClassId) -> Option<ClassInfo>;

    /// Current slot table contents
    fn read_slot_table(&self, class: ClassId) -> Result<Vec<Address>, PatchError>;

    /// Overwrite one slot
    fn write_slot(&self, class: ClassId, index: usize, value: Address) -> Result<(), PatchError>;

    /// Current selector table contents
    fn method_table(
        &self,
        class: ClassId,
        kind: MethodTableKind,
    ) -> Result<Vec<(String, Address)>, PatchError>;

    /// Replace the implementation of an existing selector
    fn replace_method(
        &self,
        class: ClassId,
        kind: MethodTableKind,
        selector: &str,
        imp: Address,
    ) -> Result<(), PatchError>;

    /// Call a metatype selector that takes no arguments
    fn invoke_class_method(&self, class: ClassId, selector: &str) -> Result<(), PatchError>;

    /// Route generic metadata allocation through `observer`
    fn install_allocation_observer(
        &self,
        observer: Arc<dyn AllocationObserver>,
    ) -> Result<(), PatchError>;

    /// Find `name` in the most recently loaded module that exports it
    fn find_symbol(&self, name: &str) -> Option<Symbol> {
        self.modules().into_iter().rev().find_map(|module| {
            let address = self.lookup_symbol(module, name)?;
            self.resolve_in(module, address)
        })
    }
}
