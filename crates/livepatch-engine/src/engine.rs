//! The patch pipeline
//!
//! [`PatchEngine::load`] runs one module through every stage:
//! 1. load the module and invalidate negative resolver entries
//! 2. patch each redefined class: slot tables of old versions (or selector
//!    tables for classes deriving from a generic), then selector tables
//! 3. patch the specializations of every redefined generic base
//! 4. absorb the module into the interposition registry
//! 5. notify load listeners, then re-run injected test cases
//! 6. on the main context: sweep live objects, then publish a [`PatchEvent`]
//!
//! Everything after the load itself is best-effort: problems with one slot,
//! class or listener are logged and counted, never returned.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::classes::{layout_compatible, ClassVersionSet};
use crate::config::PatchConfig;
use crate::context::{ImmediateContext, MainContext};
use crate::error::PatchError;
use crate::events::{EventBus, PatchEvent};
use crate::generics::{GenericRegistry, HookState};
use crate::image::{ClassId, ModuleId, PatchableImage};
use crate::interpose::InterpositionRegistry;
use crate::listeners::{Divergence, ListenerVerdict, LoadListener, TestCaseRunner};
use crate::roots::SeedRoots;
use crate::sweep::{Reflect, SweepReport, Sweeper};
use crate::swizzle::swizzle_methods;
use crate::symbols::SymbolResolver;
use crate::vtable::VTablePatcher;

/// Actionable diagnostic attached to a load that changed nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildHint {
    /// No class was patched and no call site rebound
    NothingPatched,
}

impl fmt::Display for BuildHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildHint::NothingPatched => write!(
                f,
                "no classes patched and no symbols rebound; check that the module \
                 was built with interposable call sites and dynamic replacement enabled"
            ),
        }
    }
}

/// What one load did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    /// The loaded module
    pub module: ModuleId,
    /// Its load sequence number
    pub sequence: u64,
    /// Descriptors the module installed
    pub classes: Vec<ClassId>,
    /// Type names of those descriptors
    pub class_names: Vec<String>,
    /// Redefined classes whose old versions were patched
    pub classes_patched: usize,
    /// Slots rewritten across all classes and specializations
    pub slots_written: usize,
    /// Classes skipped because their layout changed
    pub layout_mismatches: Vec<String>,
    /// Selector implementations replaced
    pub selectors_swizzled: usize,
    /// Generic specializations patched in place
    pub specializations_patched: usize,
    /// Symbols whose call sites were rebound, sorted
    pub rebound: Vec<String>,
    /// Set when the load had no effect
    pub hint: Option<BuildHint>,
    /// Listeners whose state no longer matches the code
    pub divergences: Vec<Divergence>,
    /// Time from load request to dispatching the sweep
    pub elapsed: Duration,
}

impl PatchReport {
    fn new(module: ModuleId, sequence: u64) -> Self {
        Self {
            module,
            sequence,
            classes: Vec::new(),
            class_names: Vec::new(),
            classes_patched: 0,
            slots_written: 0,
            layout_mismatches: Vec::new(),
            selectors_swizzled: 0,
            specializations_patched: 0,
            rebound: Vec::new(),
            hint: None,
            divergences: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Whether a restart is recommended
    pub fn needs_restart(&self) -> bool {
        !self.divergences.is_empty()
    }
}

/// Owns every registry and runs the patch pipeline
pub struct PatchEngine {
    image: Arc<dyn PatchableImage>,
    config: PatchConfig,
    resolver: SymbolResolver,
    interposer: InterpositionRegistry,
    generics: GenericRegistry,
    sweeper: Arc<Sweeper>,
    roots: SeedRoots,
    main: Arc<dyn MainContext>,
    events: Arc<EventBus>,
    listeners: Vec<Arc<dyn LoadListener>>,
    last_sweep: Arc<Mutex<Option<SweepReport>>>,
}

impl PatchEngine {
    /// Create an engine over `image`. The generic allocation hook is
    /// installed right away when generic patching is enabled.
    pub fn new(image: Arc<dyn PatchableImage>, config: PatchConfig) -> Self {
        let mut generics = GenericRegistry::new();
        generics.install(&*image, config.enable_generic_patching);
        let sweeper = Sweeper::new(
            config.sweep_exclusion_pattern.as_deref(),
            config.framework_roots.clone(),
        );
        let mut listeners: Vec<Arc<dyn LoadListener>> = Vec::new();
        if config.run_test_cases {
            listeners.push(Arc::new(TestCaseRunner::new(config.test_entry.clone())));
        }
        Self {
            resolver: SymbolResolver::new(),
            interposer: InterpositionRegistry::new(config.preserve_static_state),
            generics,
            sweeper: Arc::new(sweeper),
            roots: SeedRoots::new(),
            main: Arc::new(ImmediateContext),
            events: Arc::new(EventBus::new()),
            listeners,
            last_sweep: Arc::new(Mutex::new(None)),
            image,
            config,
        }
    }

    /// Run sweeps and event delivery on `context`
    pub fn with_main_context(mut self, context: Arc<dyn MainContext>) -> Self {
        self.main = context;
        self
    }

    /// Sweep from `roots`, shared with the host
    pub fn with_roots(mut self, roots: SeedRoots) -> Self {
        self.roots = roots;
        self
    }

    /// Register a load listener
    pub fn add_listener(&mut self, listener: Arc<dyn LoadListener>) {
        self.listeners.push(listener);
    }

    /// The host runtime
    pub fn image(&self) -> &Arc<dyn PatchableImage> {
        &self.image
    }

    /// Active configuration
    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// Sweep roots
    pub fn roots(&self) -> &SeedRoots {
        &self.roots
    }

    /// The sweeper, for registering fallback visitors
    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    /// Patch-complete notifications
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The interposition table
    pub fn interposition(&self) -> &InterpositionRegistry {
        &self.interposer
    }

    /// Generic specialization tracking
    pub fn generics(&self) -> &GenericRegistry {
        &self.generics
    }

    /// State of the generic allocation hook
    pub fn generic_hook(&self) -> HookState {
        self.generics.state()
    }

    /// Result of the most recent sweep that has run
    pub fn last_sweep(&self) -> Option<SweepReport> {
        *self.last_sweep.lock()
    }

    /// Whether listeners needing the key-path hook are notified. When the
    /// toggle is unset this follows the presence of the marker symbol.
    pub fn key_path_hook_enabled(&self) -> bool {
        self.config
            .enable_key_path_hook
            .unwrap_or_else(|| self.image.find_symbol(&self.config.key_path_marker).is_some())
    }

    /// Load the module at `path` and patch it into the running process
    pub fn load(&mut self, path: &Path) -> Result<PatchReport, PatchError> {
        if path.as_os_str().is_empty() {
            return Err(PatchError::EmptyModulePath);
        }
        let started = Instant::now();
        let image = Arc::clone(&self.image);

        let module = image.load_module(path)?;
        self.resolver.module_loaded();
        let sequence = image
            .module_sequence(module)
            .ok_or(PatchError::UnknownModule(module))?;
        let mut report = PatchReport::new(module, sequence);
        let loaded = started.elapsed();
        info!(module = %module, sequence, path = %path.display(), "Loaded module");

        let phase = Instant::now();
        self.patch_classes(&*image, module, &mut report);
        let classes = phase.elapsed();

        let phase = Instant::now();
        report.rebound = self.interposer.absorb(&*image, module)?;
        let interposition = phase.elapsed();
        if self.config.verbose_logging {
            for name in &report.rebound {
                info!(symbol = %name, "Interposed");
            }
        }

        if report.classes_patched == 0 && report.rebound.is_empty() {
            let hint = BuildHint::NothingPatched;
            warn!(module = %module, "{}", hint);
            report.hint = Some(hint);
        }

        self.notify_listeners(&*image, module, &mut report);
        self.dispatch_sweep(&report);

        report.elapsed = started.elapsed();
        if self.config.benchmark_timing {
            info!(
                load_us = loaded.as_micros() as u64,
                classes_us = classes.as_micros() as u64,
                interpose_us = interposition.as_micros() as u64,
                total_us = report.elapsed.as_micros() as u64,
                "Patch timing"
            );
        }
        info!(
            module = %module,
            classes = report.classes_patched,
            slots = report.slots_written,
            specializations = report.specializations_patched,
            rebound = report.rebound.len(),
            "Patch complete"
        );
        Ok(report)
    }

    fn patch_classes(
        &mut self,
        image: &dyn PatchableImage,
        module: ModuleId,
        report: &mut PatchReport,
    ) {
        let mut patcher = VTablePatcher::new(
            image,
            &mut self.resolver,
            &self.interposer,
            self.config.preserve_static_state,
            self.config.verbose_logging,
        );
        let mut generic_bases = Vec::new();

        for class in image.classes_in(module) {
            let Some(info) = image.class_info(class) else {
                continue;
            };
            report.classes.push(class);
            report.class_names.push(info.name.clone());
            if info.is_generic {
                generic_bases.push(class);
                continue;
            }
            let Some(versions) = ClassVersionSet::collect(image, class) else {
                continue;
            };
            if !versions.is_redefinition() {
                continue;
            }

            let mut patched = false;
            for &old in &versions.old {
                if info.derives_from_generic {
                    let Some(old_info) = image.class_info(old) else {
                        continue;
                    };
                    if let Err(mismatch) = layout_compatible(&old_info, &info) {
                        warn!(
                            class = %info.name,
                            %mismatch,
                            "Layout changed; adding or removing stored properties is not supported, skipping class"
                        );
                        if !report.layout_mismatches.contains(&info.name) {
                            report.layout_mismatches.push(info.name.clone());
                        }
                        continue;
                    }
                    // Slot layout of generic subclasses is not stable across builds
                    let swizzle = swizzle_methods(image, old, class, None);
                    report.selectors_swizzled += swizzle.replaced;
                    patched = true;
                    continue;
                }
                match patcher.patch(old, class, module) {
                    Ok(outcome) if outcome.layout_mismatch => {
                        if !report.layout_mismatches.contains(&info.name) {
                            report.layout_mismatches.push(info.name.clone());
                        }
                        continue;
                    }
                    Ok(outcome) => report.slots_written += outcome.written,
                    Err(error) => {
                        warn!(class = %info.name, %error, "Cannot patch class");
                        continue;
                    }
                }
                let swizzle = swizzle_methods(image, old, class, None);
                report.selectors_swizzled += swizzle.replaced;
                patched = true;
            }
            if patched {
                report.classes_patched += 1;
                debug!(class = %info.name, versions = versions.old.len(), "Patched class");
            }
        }

        for base in generic_bases {
            match self.generics.patch_specializations(
                image,
                &mut patcher,
                base,
                module,
                &self.config.lifecycle_hook,
            ) {
                Ok(outcome) => {
                    report.specializations_patched += outcome.specializations;
                    report.slots_written += outcome.slots.written;
                    report.selectors_swizzled += outcome.swizzle.replaced;
                    if outcome.specializations > 0 {
                        report.classes_patched += 1;
                    }
                }
                Err(error) => warn!(class = %base, %error, "Cannot patch specializations"),
            }
        }
    }

    fn notify_listeners(
        &self,
        image: &dyn PatchableImage,
        module: ModuleId,
        report: &mut PatchReport,
    ) {
        if self.listeners.is_empty() {
            return;
        }
        let key_paths = self.key_path_hook_enabled();
        for listener in &self.listeners {
            if listener.requires_key_path_hook() && !key_paths {
                continue;
            }
            if let ListenerVerdict::Diverged(reason) = listener.module_loaded(image, module) {
                warn!(
                    listener = listener.name(),
                    %reason,
                    "State diverged from reloaded code; restart recommended"
                );
                report.divergences.push(Divergence {
                    listener: listener.name().to_string(),
                    reason,
                });
            }
        }
    }

    /// Queue the sweep and the event publish on the main context
    fn dispatch_sweep(&self, report: &PatchReport) {
        let modified: FxHashSet<String> = report.class_names.iter().cloned().collect();
        let roots = self.roots.snapshot();
        let sweeper = Arc::clone(&self.sweeper);
        let events = Arc::clone(&self.events);
        let last_sweep = Arc::clone(&self.last_sweep);
        let hook = self.config.lifecycle_hook.clone();
        let event = PatchEvent {
            module: report.module,
            sequence: report.sequence,
            classes: report.classes.clone(),
            class_names: report.class_names.clone(),
            rebound: report.rebound.clone(),
        };

        self.main.dispatch(Box::new(move || {
            if modified.is_empty() || roots.is_empty() {
                debug!("Nothing to sweep");
            } else {
                let roots: Vec<&dyn Reflect> =
                    roots.iter().map(|root| &**root as &dyn Reflect).collect();
                match sweeper.sweep(&roots, &modified, &hook) {
                    Ok(sweep) => *last_sweep.lock() = Some(sweep),
                    Err(error) => warn!(%error, "Sweep failed"),
                }
            }
            events.publish(event);
        }));
    }
}
