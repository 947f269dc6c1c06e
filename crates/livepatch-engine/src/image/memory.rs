//! In-process managed runtime
//!
//! [`MemoryImage`] is a complete host runtime living entirely in memory:
//! modules are assembled with [`ModuleBuilder`], functions are Rust closures
//! registered at synthetic addresses, classes carry slot tables and selector
//! tables, and every call a module makes by name goes through that module's
//! own call-site table.
//!
//! Call sites follow flat-namespace linking: a name the module defines binds
//! to its own definition, anything else binds to the *first* module that
//! exported it. A freshly loaded module therefore starts out calling stale
//! code until the interposition registry replays its history into it.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::{
    Address, AllocationObserver, ClassId, ClassInfo, MethodTableKind, ModuleId, PatchableImage,
    Rebinding, Symbol, SymbolKind,
};
use crate::error::PatchError;
use crate::sweep::{LiveObject, Reflect, Role, Shape};

/// Body of a host function
pub type HostFn = Arc<dyn Fn(&Invocation<'_>) -> Value + Send + Sync>;

/// First synthetic function address handed out
const FIRST_ADDRESS: usize = 0x1000;
/// Distance between consecutive synthetic addresses
const ADDRESS_STRIDE: usize = 0x10;
/// Instance size used when a class does not declare one
const DEFAULT_INSTANCE_SIZE: usize = 16;
/// Slot name of the destructor every class receives at slot 0
const DESTRUCTOR_SLOT_NAME: &str = "deinit";

// ============================================================================
// Values and objects
// ============================================================================

/// A runtime value
#[derive(Clone)]
pub enum Value {
    /// No value
    Unit,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// String
    Str(String),
    /// Ordered sequence
    List(Vec<Value>),
    /// String-keyed mapping
    Map(BTreeMap<String, Value>),
    /// Reference to a class instance
    Object(ObjectRef),
}

impl Value {
    /// String payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload, if any
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Object payload, if any
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Map(map) => f.debug_map().entries(map).finish(),
            Value::Object(o) => write!(f, "{:?}", o),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<ObjectRef> for Value {
    fn from(o: ObjectRef) -> Self {
        Value::Object(o)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Shared handle to a class instance
#[derive(Clone)]
pub struct ObjectRef(Arc<Instance>);

struct Instance {
    id: u64,
    class: ClassId,
    image: Weak<Shared>,
    fields: RwLock<Vec<(String, Value)>>,
}

impl ObjectRef {
    /// Unique instance number
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Descriptor the instance was allocated with
    pub fn class(&self) -> ClassId {
        self.0.class
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Type name of the instance's descriptor
    pub fn class_name(&self) -> String {
        self.image()
            .ok()
            .and_then(|image| image.class_info(self.0.class))
            .map(|info| info.name)
            .unwrap_or_else(|| "<released>".to_string())
    }

    /// Store a field, appending it if the name is new
    pub fn set_field(&self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        let mut fields = self.0.fields.write();
        match fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => fields.push((name.to_string(), value)),
        }
    }

    /// Read a field
    pub fn field(&self, name: &str) -> Option<Value> {
        self.0
            .fields
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Virtual call: dispatch through the slot table of the instance's own
    /// descriptor
    pub fn call(&self, method: &str, args: &[Value]) -> Result<Value, PatchError> {
        let image = self.image()?;
        let address = {
            let state = image.shared.state.read();
            let record = state.class(self.0.class)?;
            let index = record
                .slot_names
                .iter()
                .position(|name| name == method)
                .ok_or_else(|| PatchError::UnknownMethod {
                    class_name: record.info.name.clone(),
                    method: method.to_string(),
                })?;
            record.slots[index]
        };
        image.call_address(address, Some(self), args)
    }

    /// Message send: dispatch through the instance selector table
    pub fn send(&self, selector: &str, args: &[Value]) -> Result<Value, PatchError> {
        let image = self.image()?;
        let address = {
            let state = image.shared.state.read();
            let record = state.class(self.0.class)?;
            find_method(&record.methods, selector).ok_or_else(|| PatchError::UnknownSelector {
                class: self.0.class,
                kind: MethodTableKind::Instance,
                selector: selector.to_string(),
            })?
        };
        image.call_address(address, Some(self), args)
    }

    fn image(&self) -> Result<MemoryImage, PatchError> {
        self.0
            .image
            .upgrade()
            .map(|shared| MemoryImage { shared })
            .ok_or(PatchError::ImageReleased)
    }

    fn field_snapshot(&self) -> Vec<(String, Value)> {
        self.0.fields.read().clone()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name(), self.0.id)
    }
}

/// Arguments of one host function call
pub struct Invocation<'a> {
    image: &'a MemoryImage,
    module: ModuleId,
    receiver: Option<&'a ObjectRef>,
    args: &'a [Value],
}

impl<'a> Invocation<'a> {
    /// The running image
    pub fn image(&self) -> &'a MemoryImage {
        self.image
    }

    /// Module that defines the executing function
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// `self` for methods
    pub fn receiver(&self) -> Option<&'a ObjectRef> {
        self.receiver
    }

    /// All arguments
    pub fn args(&self) -> &'a [Value] {
        self.args
    }

    /// One argument, `Unit` if absent
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Unit)
    }

    /// Call `name` through the executing module's call sites
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, PatchError> {
        self.image.call_symbol(self.module, name, args)
    }
}

// ============================================================================
// Builders
// ============================================================================

struct FunctionDef {
    name: String,
    kind: SymbolKind,
    body: HostFn,
}

/// Describes a module before it is loaded
pub struct ModuleBuilder {
    name: String,
    functions: Vec<FunctionDef>,
    imports: Vec<String>,
    classes: Vec<ClassBuilder>,
}

impl ModuleBuilder {
    /// Start an empty module
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            imports: Vec::new(),
            classes: Vec::new(),
        }
    }

    /// Export a function
    pub fn function<F>(mut self, name: impl Into<String>, kind: SymbolKind, body: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> Value + Send + Sync + 'static,
    {
        self.functions.push(FunctionDef {
            name: name.into(),
            kind,
            body: Arc::new(body),
        });
        self
    }

    /// Export a method
    pub fn method<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> Value + Send + Sync + 'static,
    {
        self.function(name, SymbolKind::Method, body)
    }

    /// Declare a call site for a symbol defined elsewhere
    pub fn import(mut self, name: impl Into<String>) -> Self {
        self.imports.push(name.into());
        self
    }

    /// Register a class
    pub fn class(mut self, class: ClassBuilder) -> Self {
        self.classes.push(class);
        self
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Describes a class descriptor before it is registered
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: String,
    superclass: Option<String>,
    size: usize,
    address_point: usize,
    generic: bool,
    derives_from_generic: bool,
    legacy_layout: bool,
    test_case: bool,
    slots: Vec<(String, String)>,
    methods: Vec<(String, String)>,
    class_methods: Vec<(String, String)>,
    fields: Vec<String>,
}

impl ClassBuilder {
    /// Start a class. Slot 0 is always the destructor `<name>.deinit`,
    /// synthesized if the module does not define it.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            size: DEFAULT_INSTANCE_SIZE,
            address_point: 0,
            generic: false,
            derives_from_generic: false,
            legacy_layout: false,
            test_case: false,
            slots: Vec::new(),
            methods: Vec::new(),
            class_methods: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Set the superclass
    pub fn superclass(mut self, name: impl Into<String>) -> Self {
        self.superclass = Some(name.into());
        self
    }

    /// Set the instance size
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the address point
    pub fn address_point(mut self, offset: usize) -> Self {
        self.address_point = offset;
        self
    }

    /// Mark as a generic base definition
    pub fn generic(mut self) -> Self {
        self.generic = true;
        self
    }

    /// Mark as inheriting from a generic class
    pub fn derives_from_generic(mut self) -> Self {
        self.derives_from_generic = true;
        self
    }

    /// Instances offer no structural introspection
    pub fn legacy_layout(mut self) -> Self {
        self.legacy_layout = true;
        self
    }

    /// Mark as a test case whose test entry runs after injection
    pub fn test_case(mut self) -> Self {
        self.test_case = true;
        self
    }

    /// Append a virtual slot named `slot` bound to `symbol`
    pub fn slot(mut self, slot: impl Into<String>, symbol: impl Into<String>) -> Self {
        self.slots.push((slot.into(), symbol.into()));
        self
    }

    /// Add an instance selector bound to `symbol`
    pub fn selector(mut self, selector: impl Into<String>, symbol: impl Into<String>) -> Self {
        self.methods.push((selector.into(), symbol.into()));
        self
    }

    /// Add a metatype selector bound to `symbol`
    pub fn class_selector(
        mut self,
        selector: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Self {
        self.class_methods.push((selector.into(), symbol.into()));
        self
    }

    /// Declare a stored field
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(name.into());
        self
    }

    fn destructor_symbol(&self) -> String {
        format!("{}.{}", self.name, DESTRUCTOR_SLOT_NAME)
    }

    fn referenced_symbols(&self) -> impl Iterator<Item = &str> {
        self.slots
            .iter()
            .chain(&self.methods)
            .chain(&self.class_methods)
            .map(|(_, symbol)| symbol.as_str())
    }
}

// ============================================================================
// Image state
// ============================================================================

struct FunctionRecord {
    symbol: Symbol,
    body: HostFn,
}

struct ModuleRecord {
    name: String,
    exports: Vec<Symbol>,
    by_name: FxHashMap<String, Address>,
    bindings: BTreeMap<String, Address>,
    classes: Vec<ClassId>,
}

#[derive(Clone)]
struct ClassRecord {
    info: ClassInfo,
    slots: Vec<Address>,
    slot_names: Vec<String>,
    methods: Vec<(String, Address)>,
    class_methods: Vec<(String, Address)>,
    fields: Vec<String>,
    legacy_layout: bool,
}

struct State {
    modules: Vec<ModuleRecord>,
    staged: HashMap<PathBuf, ModuleBuilder>,
    functions: FxHashMap<Address, FunctionRecord>,
    classes: Vec<ClassRecord>,
    next_address: usize,
}

impl State {
    fn new() -> Self {
        Self {
            modules: Vec::new(),
            staged: HashMap::new(),
            functions: FxHashMap::default(),
            classes: Vec::new(),
            next_address: FIRST_ADDRESS,
        }
    }

    fn module(&self, id: ModuleId) -> Option<&ModuleRecord> {
        self.modules.get((id.0 as usize).wrapping_sub(1))
    }

    fn module_mut(&mut self, id: ModuleId) -> Option<&mut ModuleRecord> {
        self.modules.get_mut((id.0 as usize).wrapping_sub(1))
    }

    fn class(&self, id: ClassId) -> Result<&ClassRecord, PatchError> {
        self.classes.get(id.0).ok_or(PatchError::UnknownClass(id))
    }

    fn class_mut(&mut self, id: ClassId) -> Result<&mut ClassRecord, PatchError> {
        self.classes.get_mut(id.0).ok_or(PatchError::UnknownClass(id))
    }

    fn latest_class(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .rposition(|c| c.info.name == name)
            .map(ClassId)
    }

    /// First module to export `name`, as a flat-namespace linker would bind it
    fn first_exporter(&self, name: &str) -> Option<Address> {
        self.modules
            .iter()
            .find_map(|m| m.by_name.get(name).copied())
    }

    fn allocate_address(&mut self) -> Address {
        let address = Address(self.next_address);
        self.next_address += ADDRESS_STRIDE;
        address
    }

    fn define(
        &mut self,
        record: &mut ModuleRecord,
        module: ModuleId,
        name: String,
        kind: SymbolKind,
        body: HostFn,
    ) {
        let address = self.allocate_address();
        let symbol = Symbol {
            name: name.clone(),
            address,
            module,
            kind,
        };
        record.by_name.insert(name, address);
        record.exports.push(symbol.clone());
        self.functions.insert(address, FunctionRecord { symbol, body });
    }
}

struct Shared {
    state: RwLock<State>,
    observer: RwLock<Option<Arc<dyn AllocationObserver>>>,
    allocation_hook: bool,
    next_object: AtomicU64,
}

/// In-memory host runtime
#[derive(Clone)]
pub struct MemoryImage {
    shared: Arc<Shared>,
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryImage {
    /// Create an empty image
    pub fn new() -> Self {
        Self::with_allocation_hook(true)
    }

    /// Create an image whose generic metadata allocator cannot be observed
    pub fn without_allocation_hook() -> Self {
        Self::with_allocation_hook(false)
    }

    fn with_allocation_hook(allocation_hook: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::new()),
                observer: RwLock::new(None),
                allocation_hook,
                next_object: AtomicU64::new(1),
            }),
        }
    }

    /// Make a module available to [`PatchableImage::load_module`] at `path`
    pub fn stage(&self, path: impl Into<PathBuf>, module: ModuleBuilder) {
        self.shared.state.write().staged.insert(path.into(), module);
    }

    /// Load a module directly
    pub fn load(&self, module: ModuleBuilder) -> Result<ModuleId, PatchError> {
        let mut state = self.shared.state.write();
        let id = ModuleId(state.modules.len() as u32 + 1);
        let ModuleBuilder {
            name,
            functions,
            imports,
            classes,
        } = module;

        // Validate before touching any state so a failed load leaves no trace
        let mut local: Vec<String> = functions.iter().map(|f| f.name.clone()).collect();
        local.extend(classes.iter().map(ClassBuilder::destructor_symbol));
        let referenced = imports
            .iter()
            .map(String::as_str)
            .chain(classes.iter().flat_map(ClassBuilder::referenced_symbols));
        for symbol in referenced {
            if !local.iter().any(|l| l == symbol) && state.first_exporter(symbol).is_none() {
                return Err(PatchError::UnresolvedSymbol {
                    name: symbol.to_string(),
                    module: name,
                });
            }
        }

        let mut record = ModuleRecord {
            name,
            exports: Vec::new(),
            by_name: FxHashMap::default(),
            bindings: BTreeMap::new(),
            classes: Vec::new(),
        };

        for def in functions {
            state.define(&mut record, id, def.name, def.kind, def.body);
        }
        for class in &classes {
            let destructor = class.destructor_symbol();
            if !record.by_name.contains_key(&destructor) {
                state.define(
                    &mut record,
                    id,
                    destructor,
                    SymbolKind::Destructor,
                    Arc::new(|_| Value::Unit),
                );
            }
        }

        for (name, address) in &record.by_name {
            record.bindings.insert(name.clone(), *address);
        }
        for import in imports {
            if record.bindings.contains_key(&import) {
                continue;
            }
            if let Some(address) = state.first_exporter(&import) {
                record.bindings.insert(import, address);
            }
        }

        for class in classes {
            let bind = |symbol: &str| -> Address {
                record
                    .by_name
                    .get(symbol)
                    .copied()
                    .or_else(|| state.first_exporter(symbol))
                    .unwrap_or(Address::NULL)
            };
            let mut slots = vec![bind(&class.destructor_symbol())];
            let mut slot_names = vec![DESTRUCTOR_SLOT_NAME.to_string()];
            for (slot, symbol) in &class.slots {
                slots.push(bind(symbol));
                slot_names.push(slot.clone());
            }
            let methods = class
                .methods
                .iter()
                .map(|(selector, symbol)| (selector.clone(), bind(symbol)))
                .collect();
            let class_methods = class
                .class_methods
                .iter()
                .map(|(selector, symbol)| (selector.clone(), bind(symbol)))
                .collect();

            let class_id = ClassId(state.classes.len());
            state.classes.push(ClassRecord {
                info: ClassInfo {
                    name: class.name,
                    module: id,
                    superclass: class.superclass,
                    size: class.size,
                    address_point: class.address_point,
                    is_generic: class.generic,
                    derives_from_generic: class.derives_from_generic,
                    is_test_case: class.test_case,
                },
                slots,
                slot_names,
                methods,
                class_methods,
                fields: class.fields,
                legacy_layout: class.legacy_layout,
            });
            record.classes.push(class_id);
        }

        debug!(
            module = %id,
            name = %record.name,
            symbols = record.exports.len(),
            classes = record.classes.len(),
            "Loaded module"
        );
        state.modules.push(record);
        Ok(id)
    }

    /// Find a loaded module by name
    pub fn module_named(&self, name: &str) -> Option<ModuleId> {
        self.shared
            .state
            .read()
            .modules
            .iter()
            .position(|m| m.name == name)
            .map(|index| ModuleId(index as u32 + 1))
    }

    /// The most recently registered descriptor named `name`
    pub fn latest_class(&self, name: &str) -> Option<ClassId> {
        self.shared.state.read().latest_class(name)
    }

    /// Number of registered class descriptors
    pub fn class_count(&self) -> usize {
        self.shared.state.read().classes.len()
    }

    /// Allocate an instance of `class`
    pub fn instantiate(&self, class: ClassId) -> Result<ObjectRef, PatchError> {
        let fields = {
            let state = self.shared.state.read();
            state
                .class(class)?
                .fields
                .iter()
                .map(|name| (name.clone(), Value::Unit))
                .collect()
        };
        Ok(ObjectRef(Arc::new(Instance {
            id: self.shared.next_object.fetch_add(1, Ordering::Relaxed),
            class,
            image: Arc::downgrade(&self.shared),
            fields: RwLock::new(fields),
        })))
    }

    /// Allocate an instance of the newest descriptor named `name`
    pub fn instantiate_named(&self, name: &str) -> Result<ObjectRef, PatchError> {
        let class = self
            .latest_class(name)
            .ok_or_else(|| PatchError::UnknownType(name.to_string()))?;
        self.instantiate(class)
    }

    /// Get or create the specialization of generic `base` for `args`.
    ///
    /// Metadata is created once per argument list from the newest generic
    /// definition of `base`; the allocation observer sees each creation.
    pub fn specialize(&self, base: &str, args: &[&str]) -> Result<ClassId, PatchError> {
        let name = format!("{}<{}>", base, args.join(", "));
        if let Some(existing) = self.shared.state.read().latest_class(&name) {
            return Ok(existing);
        }

        let class = {
            let mut state = self.shared.state.write();
            if let Some(existing) = state.latest_class(&name) {
                return Ok(existing);
            }
            let template = state
                .classes
                .iter()
                .rposition(|c| c.info.is_generic && c.info.name == base)
                .ok_or_else(|| PatchError::UnknownType(base.to_string()))?;
            let mut record = state.classes[template].clone();
            record.info.name = name.clone();
            record.info.is_generic = false;
            let class = ClassId(state.classes.len());
            state.classes.push(record);
            class
        };

        let observer = self.shared.observer.read().clone();
        if let Some(observer) = observer {
            observer.specialization_allocated(class, &name);
        }
        Ok(class)
    }

    /// Call `name` through the call sites of `module`
    pub fn call_symbol(
        &self,
        module: ModuleId,
        name: &str,
        args: &[Value],
    ) -> Result<Value, PatchError> {
        let address = {
            let state = self.shared.state.read();
            let record = state.module(module).ok_or(PatchError::UnknownModule(module))?;
            record
                .bindings
                .get(name)
                .copied()
                .ok_or_else(|| PatchError::UnresolvedSymbol {
                    name: name.to_string(),
                    module: record.name.clone(),
                })?
        };
        self.call_address(address, None, args)
    }

    /// Current call-site target for `name` in `module`
    pub fn binding(&self, module: ModuleId, name: &str) -> Option<Address> {
        self.shared
            .state
            .read()
            .module(module)
            .and_then(|m| m.bindings.get(name).copied())
    }

    /// Call a metatype selector
    pub fn send_class(
        &self,
        class: ClassId,
        selector: &str,
        args: &[Value],
    ) -> Result<Value, PatchError> {
        let address = {
            let state = self.shared.state.read();
            let record = state.class(class)?;
            find_method(&record.class_methods, selector).ok_or_else(|| {
                PatchError::UnknownSelector {
                    class,
                    kind: MethodTableKind::Meta,
                    selector: selector.to_string(),
                }
            })?
        };
        self.call_address(address, None, args)
    }

    /// Invoke the function at `address`
    pub fn call_address(
        &self,
        address: Address,
        receiver: Option<&ObjectRef>,
        args: &[Value],
    ) -> Result<Value, PatchError> {
        let (body, module) = {
            let state = self.shared.state.read();
            let function = state
                .functions
                .get(&address)
                .ok_or(PatchError::UnknownAddress(address))?;
            (Arc::clone(&function.body), function.symbol.module)
        };
        let invocation = Invocation {
            image: self,
            module,
            receiver,
            args,
        };
        Ok(body(&invocation))
    }
}

fn find_method(table: &[(String, Address)], selector: &str) -> Option<Address> {
    table
        .iter()
        .find(|(name, _)| name == selector)
        .map(|(_, address)| *address)
}

impl PatchableImage for MemoryImage {
    fn load_module(&self, path: &Path) -> Result<ModuleId, PatchError> {
        let staged = self.shared.state.write().staged.remove(path);
        let module = staged.ok_or_else(|| PatchError::ModuleNotFound(path.to_path_buf()))?;
        self.load(module)
    }

    fn modules(&self) -> Vec<ModuleId> {
        let count = self.shared.state.read().modules.len() as u32;
        (1..=count).map(ModuleId).collect()
    }

    fn module_sequence(&self, module: ModuleId) -> Option<u64> {
        self.shared
            .state
            .read()
            .module(module)
            .map(|_| module.0 as u64)
    }

    fn exported_symbols(&self, module: ModuleId) -> Vec<Symbol> {
        self.shared
            .state
            .read()
            .module(module)
            .map(|m| m.exports.clone())
            .unwrap_or_default()
    }

    fn resolve_in(&self, module: ModuleId, address: Address) -> Option<Symbol> {
        self.shared
            .state
            .read()
            .functions
            .get(&address)
            .filter(|f| f.symbol.module == module)
            .map(|f| f.symbol.clone())
    }

    fn lookup_symbol(&self, module: ModuleId, name: &str) -> Option<Address> {
        self.shared
            .state
            .read()
            .module(module)
            .and_then(|m| m.by_name.get(name).copied())
    }

    fn rewrite_call_sites(&self, module: ModuleId, rebindings: &[Rebinding]) -> Vec<String> {
        let mut state = self.shared.state.write();
        let Some(record) = state.module_mut(module) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for rebinding in rebindings {
            if let Some(cell) = record.bindings.get_mut(&rebinding.name) {
                if *cell != rebinding.address {
                    *cell = rebinding.address;
                    changed.push(rebinding.name.clone());
                }
            }
        }
        changed
    }

    fn classes_in(&self, module: ModuleId) -> Vec<ClassId> {
        self.shared
            .state
            .read()
            .module(module)
            .map(|m| m.classes.clone())
            .unwrap_or_default()
    }

    fn classes_named(&self, name: &str) -> Vec<ClassId> {
        self.shared
            .state
            .read()
            .classes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.info.name == name)
            .map(|(index, _)| ClassId(index))
            .collect()
    }

    fn class_info(&self, class: ClassId) -> Option<ClassInfo> {
        self.shared
            .state
            .read()
            .classes
            .get(class.0)
            .map(|c| c.info.clone())
    }

    fn read_slot_table(&self, class: ClassId) -> Result<Vec<Address>, PatchError> {
        Ok(self.shared.state.read().class(class)?.slots.clone())
    }

    fn write_slot(&self, class: ClassId, index: usize, value: Address) -> Result<(), PatchError> {
        let mut state = self.shared.state.write();
        let record = state.class_mut(class)?;
        let len = record.slots.len();
        let slot = record
            .slots
            .get_mut(index)
            .ok_or(PatchError::SlotOutOfBounds { class, index, len })?;
        *slot = value;
        Ok(())
    }

    fn method_table(
        &self,
        class: ClassId,
        kind: MethodTableKind,
    ) -> Result<Vec<(String, Address)>, PatchError> {
        let state = self.shared.state.read();
        let record = state.class(class)?;
        Ok(match kind {
            MethodTableKind::Instance => record.methods.clone(),
            MethodTableKind::Meta => record.class_methods.clone(),
        })
    }

    fn replace_method(
        &self,
        class: ClassId,
        kind: MethodTableKind,
        selector: &str,
        imp: Address,
    ) -> Result<(), PatchError> {
        let mut state = self.shared.state.write();
        let record = state.class_mut(class)?;
        let table = match kind {
            MethodTableKind::Instance => &mut record.methods,
            MethodTableKind::Meta => &mut record.class_methods,
        };
        let entry = table
            .iter_mut()
            .find(|(name, _)| name == selector)
            .ok_or_else(|| PatchError::UnknownSelector {
                class,
                kind,
                selector: selector.to_string(),
            })?;
        entry.1 = imp;
        Ok(())
    }

    fn invoke_class_method(&self, class: ClassId, selector: &str) -> Result<(), PatchError> {
        self.send_class(class, selector, &[]).map(|_| ())
    }

    fn install_allocation_observer(
        &self,
        observer: Arc<dyn AllocationObserver>,
    ) -> Result<(), PatchError> {
        if !self.shared.allocation_hook {
            return Err(PatchError::HookUnavailable);
        }
        *self.shared.observer.write() = Some(observer);
        Ok(())
    }
}

// ============================================================================
// Sweep integration
// ============================================================================

impl Reflect for Value {
    fn shape(&self) -> Shape {
        match self {
            Value::Unit | Value::Bool(_) | Value::Int(_) | Value::Str(_) => Shape::Scalar,
            Value::List(_) => Shape::Sequence,
            Value::Map(_) => Shape::Mapping,
            Value::Object(_) => Shape::Object,
        }
    }

    fn type_name(&self) -> Cow<'_, str> {
        match self {
            Value::Unit => Cow::Borrowed("Unit"),
            Value::Bool(_) => Cow::Borrowed("Bool"),
            Value::Int(_) => Cow::Borrowed("Int"),
            Value::Str(_) => Cow::Borrowed("String"),
            Value::List(_) => Cow::Borrowed("List"),
            Value::Map(_) => Cow::Borrowed("Map"),
            Value::Object(o) => Cow::Owned(o.class_name()),
        }
    }

    fn visit_children(&self, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {
        match self {
            Value::List(items) => {
                for item in items {
                    visit(Role::Element, item);
                }
            }
            Value::Map(map) => {
                for (key, value) in map {
                    visit(Role::Key, key);
                    visit(Role::Value, value);
                }
            }
            _ => {}
        }
    }

    fn as_object(&self) -> Option<&dyn LiveObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl Reflect for ObjectRef {
    fn shape(&self) -> Shape {
        Shape::Object
    }

    fn type_name(&self) -> Cow<'_, str> {
        Cow::Owned(self.class_name())
    }

    fn as_object(&self) -> Option<&dyn LiveObject> {
        Some(self)
    }
}

impl LiveObject for ObjectRef {
    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    fn class_name(&self) -> String {
        ObjectRef::class_name(self)
    }

    fn supports_introspection(&self) -> bool {
        let Ok(image) = self.image() else {
            return false;
        };
        let state = image.shared.state.read();
        state
            .class(self.0.class)
            .map(|record| !record.legacy_layout)
            .unwrap_or(false)
    }

    fn visit_fields(&self, visit: &mut dyn FnMut(&str, &dyn Reflect)) {
        for (name, value) in &self.field_snapshot() {
            visit(name, value);
        }
    }

    fn class_chain(&self) -> Vec<String> {
        let Ok(image) = self.image() else {
            return Vec::new();
        };
        let state = image.shared.state.read();
        let mut chain = Vec::new();
        let mut current = state.class(self.0.class).ok();
        while let Some(record) = current {
            if chain.contains(&record.info.name) {
                break;
            }
            chain.push(record.info.name.clone());
            current = record
                .info
                .superclass
                .as_deref()
                .and_then(|name| state.latest_class(name))
                .and_then(|id| state.class(id).ok());
        }
        chain
    }

    fn visit_reference_slots(&self, declaring_class: &str, visit: &mut dyn FnMut(&dyn Reflect)) {
        let declared = {
            let Ok(image) = self.image() else {
                return;
            };
            let state = image.shared.state.read();
            let record = match state.class(self.0.class) {
                Ok(own) if own.info.name == declaring_class => own,
                _ => match state
                    .latest_class(declaring_class)
                    .and_then(|id| state.class(id).ok())
                {
                    Some(record) => record,
                    None => return,
                },
            };
            record.fields.clone()
        };
        for (name, value) in &self.field_snapshot() {
            if matches!(value, Value::Object(_)) && declared.contains(name) {
                visit(value);
            }
        }
    }

    fn notify(&self, hook: &str) -> bool {
        self.send(hook, &[]).is_ok()
    }
}
