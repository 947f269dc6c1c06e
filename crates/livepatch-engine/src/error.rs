//! Error types
//!
//! Only precondition failures and image-level failures surface as errors.
//! Everything the patch pipeline treats as best-effort (layout mismatches,
//! unresolvable slots, missing selectors, a missing allocation hook) is logged
//! and counted in the reports instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::image::{Address, ClassId, MethodTableKind, ModuleId};

/// Errors reported to the caller of the engine or of a [`crate::PatchableImage`]
#[derive(Debug, Error)]
pub enum PatchError {
    /// A load was requested with an empty module path
    #[error("Module path is empty")]
    EmptyModulePath,

    /// A sweep was requested without any roots
    #[error("Sweep requires at least one root")]
    EmptyRootSet,

    /// Nothing loadable exists at the given path
    #[error("No module found at {0}")]
    ModuleNotFound(PathBuf),

    /// The native loader failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A module referenced a name nothing exports
    #[error("Unresolved symbol {name} referenced by module {module}")]
    UnresolvedSymbol {
        /// Symbol name
        name: String,
        /// Name of the referencing module
        module: String,
    },

    /// Module id not known to the image
    #[error("Unknown module {0}")]
    UnknownModule(ModuleId),

    /// No class descriptor carries this type name
    #[error("Unknown type {0}")]
    UnknownType(String),

    /// No function lives at this address
    #[error("No function at address {0}")]
    UnknownAddress(Address),

    /// Class id not known to the image
    #[error("Unknown class {0}")]
    UnknownClass(ClassId),

    /// Slot write outside the class's slot table
    #[error("Slot {index} out of bounds for class {class} ({len} slots)")]
    SlotOutOfBounds {
        /// Target class
        class: ClassId,
        /// Requested slot
        index: usize,
        /// Slot table length
        len: usize,
    },

    /// Selector missing from a method table
    #[error("Selector {selector} not found in {kind:?} table of class {class}")]
    UnknownSelector {
        /// Target class
        class: ClassId,
        /// Which table was searched
        kind: MethodTableKind,
        /// Selector name
        selector: String,
    },

    /// Virtual call by name on a class that has no such slot
    #[error("Method {method} not found on {class_name}")]
    UnknownMethod {
        /// Type name of the receiver
        class_name: String,
        /// Method name
        method: String,
    },

    /// The host runtime offers no generic metadata allocation hook
    #[error("Generic metadata allocation hook is unavailable")]
    HookUnavailable,

    /// An object outlived the image that created it
    #[error("Image has been released")]
    ImageReleased,

    /// The injection queue is no longer accepting work
    #[error("Injection queue is closed")]
    QueueClosed,

    /// The injection worker thread could not be started
    #[error("Failed to spawn injection thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Configuration could not be read
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors that can occur while loading a native module
#[derive(Debug, Error)]
pub enum LoadError {
    /// Library file not found or could not be loaded
    #[error("Library not found: {path}")]
    NotFound {
        /// Path that was attempted
        path: String,
    },

    /// Symbol not found in library
    #[error("Symbol not found: {symbol} in {library}")]
    SymbolNotFound {
        /// Symbol name that was not found
        symbol: String,
        /// Library path
        library: String,
    },

    /// The manifest is missing, has the wrong ABI version or malformed records
    #[error("Invalid manifest in {library}: {reason}")]
    InvalidManifest {
        /// Library path
        library: String,
        /// What was wrong
        reason: String,
    },

    /// Platform-specific error
    #[error("Platform error: {0}")]
    PlatformError(String),

    /// Invalid path encoding
    #[error("Invalid UTF-8 in path: {0}")]
    InvalidPath(String),
}
