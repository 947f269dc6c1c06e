//! Livepatch Engine
//!
//! Absorbs freshly compiled code into a running process:
//! - **Symbols**: address resolution and the patchable-code predicate (`symbols`)
//! - **Interposition**: newest implementation per symbol name, replayed into
//!   every module's call sites (`interpose`)
//! - **Classes**: slot table patching of old class versions (`classes`, `vtable`)
//!   and selector swizzling (`swizzle`)
//! - **Generics**: specialization tracking and in-place patching (`generics`)
//! - **Sweep**: lifecycle notification of live instances (`sweep`)
//! - **Image**: the host runtime behind [`PatchableImage`] (`image`)
//!
//! # Example
//!
//! ```rust,ignore
//! use livepatch_engine::{InjectionQueue, PatchConfig, PatchEngine};
//!
//! let engine = PatchEngine::new(image, PatchConfig::default());
//! let queue = InjectionQueue::start(engine)?;
//!
//! let report = queue.submit("/tmp/build/Widget.so")?.recv()??;
//! println!("patched {} classes", report.classes_patched);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Host runtime abstraction and its implementations
pub mod image;

/// Address to symbol resolution
pub mod symbols;

/// Process-wide symbol interposition
pub mod interpose;

/// Class version sets and layout checks
pub mod classes;

/// Slot table patching
pub mod vtable;

/// Selector table swizzling
pub mod swizzle;

/// Generic specialization registry
pub mod generics;

/// Live object sweep
pub mod sweep;

// ============================================================================
// Pipeline and Host Integration
// ============================================================================

pub mod config;
pub mod context;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod events;
pub mod listeners;
pub mod logging;
pub mod queue;
pub mod roots;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigError, PatchConfig, QueueMode};
pub use context::{ImmediateContext, MainContext, MainThreadQueue, Task};
pub use engine::{BuildHint, PatchEngine, PatchReport};
pub use error::{LoadError, PatchError};
pub use events::{EventBus, PatchEvent};
pub use generics::{GenericRegistry, HookState};
pub use image::{
    Address, AllocationObserver, ClassId, ClassInfo, MemoryImage, MethodTableKind, ModuleId,
    PatchableImage, Rebinding, Symbol, SymbolKind,
};
#[cfg(unix)]
pub use image::NativeImage;
pub use interpose::InterpositionRegistry;
pub use listeners::{Divergence, ListenerVerdict, LoadListener, TestCaseRunner};
pub use queue::{InjectionQueue, PatchReply};
pub use roots::SeedRoots;
pub use sweep::{FallbackVisitor, LiveObject, Reflect, Role, Shape, SweepReport, Sweeper};
pub use symbols::{is_patchable, SymbolResolver};
