//! livepatch SDK - the manifest a hot-reloadable native module exports
//!
//! A module that wants its code absorbed by a running process exports one
//! C-ABI function under [`MANIFEST_SYMBOL`]. It returns a pointer to a static
//! [`LpManifest`] describing:
//!
//! - every exported symbol together with its explicit [`SymbolKind`]
//! - every call-site cell the module calls through (one indirection cell per
//!   referenced name, rewritten in place when a newer implementation arrives)
//! - every class record, with writable slot arrays and selector tables
//!
//! The classification is carried in the manifest rather than derived from
//! mangled names, so the engine never has to guess which symbols are safe to
//! redirect.
//!
//! # Example
//!
//! ```ignore
//! use livepatch_sdk::{LpManifest, LpSymbol, SymbolKind, LIVEPATCH_ABI_VERSION};
//!
//! #[no_mangle]
//! pub extern "C" fn livepatch_manifest() -> *const LpManifest {
//!     &MANIFEST
//! }
//! ```

#![warn(missing_docs)]

use std::ffi::{c_char, c_void, CStr};

/// Version of the manifest layout understood by this SDK.
pub const LIVEPATCH_ABI_VERSION: u32 = 1;

/// Name of the exported function returning the module manifest.
pub const MANIFEST_SYMBOL: &str = "livepatch_manifest";

/// Signature of the manifest entry point.
pub type ManifestFn = unsafe extern "C" fn() -> *const LpManifest;

/// The class is a generic base definition; concrete specializations are
/// created lazily by the runtime.
pub const CLASS_FLAG_GENERIC: u32 = 1 << 0;

/// The class inherits from a generic class and must be patched through its
/// selector tables instead of its slot table.
pub const CLASS_FLAG_DERIVES_FROM_GENERIC: u32 = 1 << 1;

/// The class is a test case. After it is injected the engine calls its test
/// entry, a metatype selector with the signature `extern "C" fn()`.
pub const CLASS_FLAG_TEST_CASE: u32 = 1 << 2;

// ============================================================================
// Symbol kinds
// ============================================================================

/// Closed classification of an exported symbol.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// Free function
    Function = 0,
    /// Instance or class method
    Method = 1,
    /// Computed property getter
    Getter = 2,
    /// Computed property setter
    Setter = 3,
    /// Static member function
    StaticMember = 4,
    /// Accessor handing out the address of static or global mutable storage
    MutableAddressor = 5,
    /// Value-returning getter whose result is an opaque foreign type. These are
    /// emitted into several compilation units and must never be redirected.
    OpaqueGetter = 6,
    /// Deallocating destructor (slot 0 of every class)
    Destructor = 7,
    /// Bridging or reabstraction thunk
    Thunk = 8,
    /// Runtime support routine
    RuntimeInternal = 9,
    /// Type metadata accessor or record
    Metadata = 10,
}

impl SymbolKind {
    /// Decode a raw manifest value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => SymbolKind::Function,
            1 => SymbolKind::Method,
            2 => SymbolKind::Getter,
            3 => SymbolKind::Setter,
            4 => SymbolKind::StaticMember,
            5 => SymbolKind::MutableAddressor,
            6 => SymbolKind::OpaqueGetter,
            7 => SymbolKind::Destructor,
            8 => SymbolKind::Thunk,
            9 => SymbolKind::RuntimeInternal,
            10 => SymbolKind::Metadata,
            _ => return None,
        })
    }

    /// Raw manifest value.
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Short lowercase name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Getter => "getter",
            SymbolKind::Setter => "setter",
            SymbolKind::StaticMember => "static",
            SymbolKind::MutableAddressor => "addressor",
            SymbolKind::OpaqueGetter => "opaque-getter",
            SymbolKind::Destructor => "destructor",
            SymbolKind::Thunk => "thunk",
            SymbolKind::RuntimeInternal => "runtime",
            SymbolKind::Metadata => "metadata",
        }
    }
}

// ============================================================================
// Manifest records
// ============================================================================

/// One exported symbol.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LpSymbol {
    /// NUL-terminated symbol name
    pub name: *const c_char,
    /// Entry address
    pub address: *const c_void,
    /// Raw [`SymbolKind`]
    pub kind: u32,
}

/// One call-site indirection cell. Every call the module makes to `name`
/// loads its target from `cell`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LpBinding {
    /// NUL-terminated name of the called symbol
    pub name: *const c_char,
    /// Writable cell holding the current target
    pub cell: *mut *const c_void,
}

/// One selector table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LpMethod {
    /// NUL-terminated selector
    pub selector: *const c_char,
    /// Current implementation
    pub imp: *const c_void,
}

/// One class implementation registered by the module.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LpClass {
    /// NUL-terminated fully-qualified type name
    pub name: *const c_char,
    /// NUL-terminated superclass name, or null for root classes
    pub superclass: *const c_char,
    /// Total instance size in bytes
    pub size: usize,
    /// Offset of the address point inside the class metadata
    pub address_point: usize,
    /// `CLASS_FLAG_*` bits
    pub flags: u32,
    /// Writable slot array; slot 0 is the destructor
    pub slots: *mut *const c_void,
    /// Number of entries in `slots`
    pub slot_count: usize,
    /// Writable instance selector table
    pub methods: *mut LpMethod,
    /// Number of entries in `methods`
    pub method_count: usize,
    /// Writable metatype (static) selector table
    pub class_methods: *mut LpMethod,
    /// Number of entries in `class_methods`
    pub class_method_count: usize,
}

/// The root record returned by [`MANIFEST_SYMBOL`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LpManifest {
    /// Must equal [`LIVEPATCH_ABI_VERSION`]
    pub abi_version: u32,
    /// NUL-terminated module name
    pub module_name: *const c_char,
    /// Exported symbols
    pub symbols: *const LpSymbol,
    /// Number of exported symbols
    pub symbol_count: usize,
    /// Call-site cells
    pub bindings: *const LpBinding,
    /// Number of call-site cells
    pub binding_count: usize,
    /// Class records
    pub classes: *const LpClass,
    /// Number of class records
    pub class_count: usize,
}

// SAFETY: manifests are immutable statics; the mutable tables they point at
// are only written by the engine from its single injection queue.
unsafe impl Send for LpManifest {}
unsafe impl Sync for LpManifest {}
unsafe impl Send for LpSymbol {}
unsafe impl Sync for LpSymbol {}
unsafe impl Send for LpBinding {}
unsafe impl Sync for LpBinding {}
unsafe impl Send for LpClass {}
unsafe impl Sync for LpClass {}
unsafe impl Send for LpMethod {}
unsafe impl Sync for LpMethod {}

impl LpManifest {
    /// Exported symbols as a slice.
    ///
    /// # Safety
    ///
    /// `symbols` must point at `symbol_count` valid records (or be null).
    pub unsafe fn symbols(&self) -> &[LpSymbol] {
        raw_slice(self.symbols, self.symbol_count)
    }

    /// Call-site cells as a slice.
    ///
    /// # Safety
    ///
    /// `bindings` must point at `binding_count` valid records (or be null).
    pub unsafe fn bindings(&self) -> &[LpBinding] {
        raw_slice(self.bindings, self.binding_count)
    }

    /// Class records as a slice.
    ///
    /// # Safety
    ///
    /// `classes` must point at `class_count` valid records (or be null).
    pub unsafe fn classes(&self) -> &[LpClass] {
        raw_slice(self.classes, self.class_count)
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len)
    }
}

/// Read a NUL-terminated manifest string.
///
/// Returns `None` for null pointers and non-UTF-8 data.
///
/// # Safety
///
/// `ptr` must be null or point at a NUL-terminated string that outlives `'a`.
pub unsafe fn manifest_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}
