//! Native backend: shared objects described by a manifest
//!
//! Each module exports `livepatch_manifest`, which hands the engine raw
//! pointers to the module's own writable tables: call-site cells, class slot
//! arrays and selector tables. Patching writes straight into those tables.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use livepatch_sdk::{
    manifest_str, LpManifest, LpMethod, CLASS_FLAG_DERIVES_FROM_GENERIC, CLASS_FLAG_GENERIC,
    CLASS_FLAG_TEST_CASE,
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::loader::Library;
use super::{
    Address, AllocationObserver, ClassId, ClassInfo, MethodTableKind, ModuleId, PatchableImage,
    Rebinding, Symbol, SymbolKind,
};
use crate::error::{LoadError, PatchError};

struct NativeModule {
    name: String,
    _library: Option<Library>,
    symbols: Vec<Symbol>,
    by_name: FxHashMap<String, Address>,
    by_address: FxHashMap<Address, usize>,
    /// (called name, cell address)
    bindings: Vec<(String, usize)>,
    classes: Vec<ClassId>,
}

struct NativeClass {
    info: ClassInfo,
    slots: usize,
    slot_count: usize,
    methods: usize,
    method_count: usize,
    class_methods: usize,
    class_method_count: usize,
}

impl NativeClass {
    fn table(&self, kind: MethodTableKind) -> (*mut LpMethod, usize) {
        match kind {
            MethodTableKind::Instance => (self.methods as *mut LpMethod, self.method_count),
            MethodTableKind::Meta => (self.class_methods as *mut LpMethod, self.class_method_count),
        }
    }
}

#[derive(Default)]
struct NativeState {
    modules: Vec<NativeModule>,
    classes: Vec<NativeClass>,
}

impl NativeState {
    fn module(&self, id: ModuleId) -> Option<&NativeModule> {
        self.modules.get((id.0 as usize).wrapping_sub(1))
    }

    fn class(&self, id: ClassId) -> Result<&NativeClass, PatchError> {
        self.classes.get(id.0).ok_or(PatchError::UnknownClass(id))
    }
}

/// Image backed by `dlopen`ed shared objects
#[derive(Default)]
pub struct NativeImage {
    state: RwLock<NativeState>,
}

impl NativeImage {
    /// Create an image with no modules
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manifest that is already mapped into the process, such as
    /// the one of the main executable.
    ///
    /// # Safety
    ///
    /// Every pointer in `manifest` must stay valid for the lifetime of the
    /// image, and the slot arrays, selector tables and call-site cells it
    /// points at must be writable.
    pub unsafe fn load_manifest(
        &self,
        path: impl Into<PathBuf>,
        manifest: &'static LpManifest,
    ) -> Result<ModuleId, PatchError> {
        self.register(path.into(), None, manifest)
    }

    unsafe fn register(
        &self,
        path: PathBuf,
        library: Option<Library>,
        manifest: &'static LpManifest,
    ) -> Result<ModuleId, PatchError> {
        let library_name = path.display().to_string();
        let invalid = |reason: String| LoadError::InvalidManifest {
            library: library_name.clone(),
            reason,
        };
        let name = manifest_str(manifest.module_name)
            .unwrap_or(library_name.as_str())
            .to_string();

        let mut state = self.state.write();
        let id = ModuleId(state.modules.len() as u32 + 1);

        let mut symbols = Vec::with_capacity(manifest.symbol_count);
        let mut by_name = FxHashMap::default();
        let mut by_address = FxHashMap::default();
        for raw in manifest.symbols() {
            let symbol_name = manifest_str(raw.name)
                .ok_or_else(|| invalid("symbol with a null or non-UTF-8 name".to_string()))?;
            let kind = SymbolKind::from_raw(raw.kind).ok_or_else(|| {
                invalid(format!("symbol {} has unknown kind {}", symbol_name, raw.kind))
            })?;
            let address = Address(raw.address as usize);
            by_name.insert(symbol_name.to_string(), address);
            by_address.insert(address, symbols.len());
            symbols.push(Symbol {
                name: symbol_name.to_string(),
                address,
                module: id,
                kind,
            });
        }

        let mut bindings = Vec::with_capacity(manifest.binding_count);
        for raw in manifest.bindings() {
            let called = manifest_str(raw.name)
                .ok_or_else(|| invalid("call site with a null or non-UTF-8 name".to_string()))?;
            if raw.cell.is_null() {
                return Err(invalid(format!("call site {} has no cell", called)).into());
            }
            bindings.push((called.to_string(), raw.cell as usize));
        }

        let mut classes = Vec::with_capacity(manifest.class_count);
        for raw in manifest.classes() {
            let class_name = manifest_str(raw.name)
                .ok_or_else(|| invalid("class with a null or non-UTF-8 name".to_string()))?;
            if raw.slots.is_null() && raw.slot_count > 0 {
                return Err(invalid(format!("class {} has no slot array", class_name)).into());
            }
            classes.push(NativeClass {
                info: ClassInfo {
                    name: class_name.to_string(),
                    module: id,
                    superclass: manifest_str(raw.superclass).map(str::to_string),
                    size: raw.size,
                    address_point: raw.address_point,
                    is_generic: raw.flags & CLASS_FLAG_GENERIC != 0,
                    derives_from_generic: raw.flags & CLASS_FLAG_DERIVES_FROM_GENERIC != 0,
                    is_test_case: raw.flags & CLASS_FLAG_TEST_CASE != 0,
                },
                slots: raw.slots as usize,
                slot_count: raw.slot_count,
                methods: raw.methods as usize,
                method_count: if raw.methods.is_null() { 0 } else { raw.method_count },
                class_methods: raw.class_methods as usize,
                class_method_count: if raw.class_methods.is_null() {
                    0
                } else {
                    raw.class_method_count
                },
            });
        }

        let first_class = state.classes.len();
        let class_ids = (first_class..first_class + classes.len())
            .map(ClassId)
            .collect();
        state.classes.extend(classes);

        debug!(
            module = %id,
            name = %name,
            symbols = symbols.len(),
            call_sites = bindings.len(),
            "Registered native module"
        );
        state.modules.push(NativeModule {
            name,
            _library: library,
            symbols,
            by_name,
            by_address,
            bindings,
            classes: class_ids,
        });
        Ok(id)
    }

    /// Name of a loaded module
    pub fn module_name(&self, module: ModuleId) -> Option<String> {
        self.state.read().module(module).map(|m| m.name.clone())
    }

    /// Current target of the call-site cell for `name` in `module`
    pub fn binding(&self, module: ModuleId, name: &str) -> Option<Address> {
        let state = self.state.read();
        let record = state.module(module)?;
        record
            .bindings
            .iter()
            .find(|(called, _)| called == name)
            .map(|(_, cell)| unsafe { Address(std::ptr::read_volatile(*cell as *const usize)) })
    }
}

impl PatchableImage for NativeImage {
    fn load_module(&self, path: &Path) -> Result<ModuleId, PatchError> {
        let library = Library::open(path)?;
        let manifest = library.manifest()?;
        // SAFETY: the library is kept open for the lifetime of the image, so
        // everything its manifest points at stays mapped.
        unsafe { self.register(path.to_path_buf(), Some(library), manifest) }
    }

    fn modules(&self) -> Vec<ModuleId> {
        let count = self.state.read().modules.len() as u32;
        (1..=count).map(ModuleId).collect()
    }

    fn module_sequence(&self, module: ModuleId) -> Option<u64> {
        self.state.read().module(module).map(|_| module.0 as u64)
    }

    fn exported_symbols(&self, module: ModuleId) -> Vec<Symbol> {
        self.state
            .read()
            .module(module)
            .map(|m| m.symbols.clone())
            .unwrap_or_default()
    }

    fn resolve_in(&self, module: ModuleId, address: Address) -> Option<Symbol> {
        let state = self.state.read();
        let record = state.module(module)?;
        let index = *record.by_address.get(&address)?;
        record.symbols.get(index).cloned()
    }

    fn lookup_symbol(&self, module: ModuleId, name: &str) -> Option<Address> {
        self.state
            .read()
            .module(module)
            .and_then(|m| m.by_name.get(name).copied())
    }

    fn rewrite_call_sites(&self, module: ModuleId, rebindings: &[Rebinding]) -> Vec<String> {
        // Cells are written in place; the write lock serializes writers.
        let state = self.state.write();
        let Some(record) = state.module(module) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for rebinding in rebindings {
            for (called, cell) in &record.bindings {
                if *called != rebinding.name {
                    continue;
                }
                let cell = *cell as *mut usize;
                unsafe {
                    if std::ptr::read_volatile(cell) != rebinding.address.0 {
                        std::ptr::write_volatile(cell, rebinding.address.0);
                        changed.push(rebinding.name.clone());
                    }
                }
            }
        }
        changed
    }

    fn classes_in(&self, module: ModuleId) -> Vec<ClassId> {
        self.state
            .read()
            .module(module)
            .map(|m| m.classes.clone())
            .unwrap_or_default()
    }

    fn classes_named(&self, name: &str) -> Vec<ClassId> {
        self.state
            .read()
            .classes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.info.name == name)
            .map(|(index, _)| ClassId(index))
            .collect()
    }

    fn class_info(&self, class: ClassId) -> Option<ClassInfo> {
        self.state.read().classes.get(class.0).map(|c| c.info.clone())
    }

    fn read_slot_table(&self, class: ClassId) -> Result<Vec<Address>, PatchError> {
        let state = self.state.read();
        let record = state.class(class)?;
        let slots = record.slots as *const usize;
        Ok((0..record.slot_count)
            .map(|index| unsafe { Address(std::ptr::read_volatile(slots.add(index))) })
            .collect())
    }

    fn write_slot(&self, class: ClassId, index: usize, value: Address) -> Result<(), PatchError> {
        let state = self.state.write();
        let record = state.class(class)?;
        if index >= record.slot_count {
            return Err(PatchError::SlotOutOfBounds {
                class,
                index,
                len: record.slot_count,
            });
        }
        unsafe {
            std::ptr::write_volatile((record.slots as *mut usize).add(index), value.0);
        }
        Ok(())
    }

    fn method_table(
        &self,
        class: ClassId,
        kind: MethodTableKind,
    ) -> Result<Vec<(String, Address)>, PatchError> {
        let state = self.state.read();
        let (table, count) = state.class(class)?.table(kind);
        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            unsafe {
                let entry = table.add(index);
                if let Some(selector) = manifest_str((*entry).selector) {
                    let imp = std::ptr::addr_of!((*entry).imp).read_volatile();
                    entries.push((selector.to_string(), Address(imp as usize)));
                }
            }
        }
        Ok(entries)
    }

    fn replace_method(
        &self,
        class: ClassId,
        kind: MethodTableKind,
        selector: &str,
        imp: Address,
    ) -> Result<(), PatchError> {
        let state = self.state.write();
        let (table, count) = state.class(class)?.table(kind);
        for index in 0..count {
            unsafe {
                let entry = table.add(index);
                if manifest_str((*entry).selector) == Some(selector) {
                    std::ptr::addr_of_mut!((*entry).imp).write_volatile(imp.0 as *const c_void);
                    return Ok(());
                }
            }
        }
        Err(PatchError::UnknownSelector {
            class,
            kind,
            selector: selector.to_string(),
        })
    }

    fn invoke_class_method(&self, class: ClassId, selector: &str) -> Result<(), PatchError> {
        let imp = self
            .method_table(class, MethodTableKind::Meta)?
            .into_iter()
            .find(|(name, imp)| name == selector && !imp.is_null())
            .map(|(_, imp)| imp)
            .ok_or_else(|| PatchError::UnknownSelector {
                class,
                kind: MethodTableKind::Meta,
                selector: selector.to_string(),
            })?;
        // SAFETY: the manifest contract declares zero-argument metatype
        // entries as `extern "C" fn()`, and the module is never unloaded.
        let entry = unsafe {
            std::mem::transmute::<*const c_void, extern "C" fn()>(imp.0 as *const c_void)
        };
        entry();
        Ok(())
    }

    fn install_allocation_observer(
        &self,
        _observer: Arc<dyn AllocationObserver>,
    ) -> Result<(), PatchError> {
        // Specialization metadata is created by compiled code this backend
        // cannot intercept.
        Err(PatchError::HookUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livepatch_sdk::{LpBinding, LpClass, LpSymbol, LIVEPATCH_ABI_VERSION};
    use std::ffi::{c_char, CString};

    extern "C" fn render_v1() -> i32 {
        1
    }

    extern "C" fn render_v2() -> i32 {
        2
    }

    extern "C" fn destroy() {}

    fn leak_str(s: &str) -> *const c_char {
        CString::new(s).unwrap().into_raw()
    }

    fn widget_manifest(render: extern "C" fn() -> i32, size: usize) -> &'static LpManifest {
        let symbols = Box::leak(
            vec![
                LpSymbol {
                    name: leak_str("Widget.render"),
                    address: render as *const c_void,
                    kind: SymbolKind::Method.as_raw(),
                },
                LpSymbol {
                    name: leak_str("Widget.deinit"),
                    address: destroy as *const c_void,
                    kind: SymbolKind::Destructor.as_raw(),
                },
            ]
            .into_boxed_slice(),
        );
        let cell: &'static mut *const c_void = Box::leak(Box::new(render as *const c_void));
        let bindings = Box::leak(
            vec![LpBinding {
                name: leak_str("Widget.render"),
                cell,
            }]
            .into_boxed_slice(),
        );
        let slots = Box::leak(
            vec![destroy as *const c_void, render as *const c_void].into_boxed_slice(),
        );
        let methods = Box::leak(
            vec![LpMethod {
                selector: leak_str("render"),
                imp: render as *const c_void,
            }]
            .into_boxed_slice(),
        );
        let classes = Box::leak(
            vec![LpClass {
                name: leak_str("Widget"),
                superclass: std::ptr::null(),
                size,
                address_point: 16,
                flags: 0,
                slots: slots.as_mut_ptr(),
                slot_count: 2,
                methods: methods.as_mut_ptr(),
                method_count: 1,
                class_methods: std::ptr::null_mut(),
                class_method_count: 0,
            }]
            .into_boxed_slice(),
        );
        Box::leak(Box::new(LpManifest {
            abi_version: LIVEPATCH_ABI_VERSION,
            module_name: leak_str("widget"),
            symbols: symbols.as_ptr(),
            symbol_count: symbols.len(),
            bindings: bindings.as_ptr(),
            binding_count: bindings.len(),
            classes: classes.as_ptr(),
            class_count: classes.len(),
        }))
    }

    static TEST_RUNS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    extern "C" fn run_tests() {
        TEST_RUNS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn test_case_manifest() -> &'static LpManifest {
        let slots = Box::leak(vec![destroy as *const c_void].into_boxed_slice());
        let class_methods = Box::leak(
            vec![LpMethod {
                selector: leak_str("runTests"),
                imp: run_tests as *const c_void,
            }]
            .into_boxed_slice(),
        );
        let classes = Box::leak(
            vec![LpClass {
                name: leak_str("WidgetTests"),
                superclass: std::ptr::null(),
                size: 16,
                address_point: 16,
                flags: livepatch_sdk::CLASS_FLAG_TEST_CASE,
                slots: slots.as_mut_ptr(),
                slot_count: 1,
                methods: std::ptr::null_mut(),
                method_count: 0,
                class_methods: class_methods.as_mut_ptr(),
                class_method_count: 1,
            }]
            .into_boxed_slice(),
        );
        Box::leak(Box::new(LpManifest {
            abi_version: LIVEPATCH_ABI_VERSION,
            module_name: leak_str("widget-tests"),
            symbols: std::ptr::null(),
            symbol_count: 0,
            bindings: std::ptr::null(),
            binding_count: 0,
            classes: classes.as_ptr(),
            class_count: classes.len(),
        }))
    }

    #[test]
    fn test_invoke_test_entry() {
        let image = NativeImage::new();
        let module = unsafe { image.load_manifest("/tmp/widget-tests.so", test_case_manifest()) }
            .unwrap();
        let class = image.classes_in(module)[0];

        assert!(image.class_info(class).unwrap().is_test_case);
        image.invoke_class_method(class, "runTests").unwrap();
        assert_eq!(TEST_RUNS.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(
            image.invoke_class_method(class, "missing"),
            Err(PatchError::UnknownSelector { .. })
        ));
    }

    #[test]
    fn test_register_manifest() {
        let image = NativeImage::new();
        let module = unsafe { image.load_manifest("widget.so", widget_manifest(render_v1, 32)) }
            .unwrap();

        assert_eq!(image.module_name(module).as_deref(), Some("widget"));
        let symbols = image.exported_symbols(module);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].kind, SymbolKind::Method);

        let address = image.lookup_symbol(module, "Widget.render").unwrap();
        assert_eq!(address, Address(render_v1 as usize));
        assert_eq!(
            image.resolve_in(module, address).unwrap().name,
            "Widget.render"
        );

        let class = image.classes_named("Widget")[0];
        let info = image.class_info(class).unwrap();
        assert_eq!(info.size, 32);
        assert_eq!(info.address_point, 16);
    }

    #[test]
    fn test_rewrite_call_site_cell() {
        let image = NativeImage::new();
        let first =
            unsafe { image.load_manifest("v1.so", widget_manifest(render_v1, 32)) }.unwrap();
        let second =
            unsafe { image.load_manifest("v2.so", widget_manifest(render_v2, 32)) }.unwrap();
        let newest = image.lookup_symbol(second, "Widget.render").unwrap();

        let changed = image.rewrite_call_sites(
            first,
            &[Rebinding {
                name: "Widget.render".to_string(),
                address: newest,
            }],
        );
        assert_eq!(changed, vec!["Widget.render".to_string()]);

        let target = image.binding(first, "Widget.render").unwrap();
        let call: extern "C" fn() -> i32 = unsafe { std::mem::transmute(target.0) };
        assert_eq!(call(), 2);
    }

    #[test]
    fn test_slot_and_selector_writes() {
        let image = NativeImage::new();
        let module =
            unsafe { image.load_manifest("v1.so", widget_manifest(render_v1, 32)) }.unwrap();
        let class = image.classes_in(module)[0];
        let replacement = Address(render_v2 as usize);

        image.write_slot(class, 1, replacement).unwrap();
        assert_eq!(image.read_slot_table(class).unwrap()[1], replacement);
        assert!(matches!(
            image.write_slot(class, 2, replacement),
            Err(PatchError::SlotOutOfBounds { len: 2, .. })
        ));

        image
            .replace_method(class, MethodTableKind::Instance, "render", replacement)
            .unwrap();
        let table = image.method_table(class, MethodTableKind::Instance).unwrap();
        assert_eq!(table, vec![("render".to_string(), replacement)]);
        assert!(image.method_table(class, MethodTableKind::Meta).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_unknown_symbol_kind() {
        let manifest = widget_manifest(render_v1, 32);
        let symbols = Box::leak(
            vec![LpSymbol {
                name: leak_str("odd"),
                address: render_v1 as *const c_void,
                kind: 99,
            }]
            .into_boxed_slice(),
        );
        let broken = Box::leak(Box::new(LpManifest {
            symbols: symbols.as_ptr(),
            symbol_count: 1,
            ..*manifest
        }));

        let image = NativeImage::new();
        let result = unsafe { image.load_manifest("broken.so", broken) };
        assert!(matches!(
            result,
            Err(PatchError::Load(LoadError::InvalidManifest { .. }))
        ));
        assert!(image.modules().is_empty());
    }

    #[test]
    fn test_allocation_hook_unavailable() {
        struct Ignore;
        impl AllocationObserver for Ignore {
            fn specialization_allocated(&self, _: ClassId, _: &str) {}
        }

        let image = NativeImage::new();
        assert!(matches!(
            image.install_allocation_observer(Arc::new(Ignore)),
            Err(PatchError::HookUnavailable)
        ));
    }
}
