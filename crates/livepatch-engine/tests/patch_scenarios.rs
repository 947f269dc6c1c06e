use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use livepatch_engine::image::{ClassBuilder, ModuleBuilder, Value};
use livepatch_engine::{
    BuildHint, HookState, ListenerVerdict, LoadListener, MainThreadQueue, MemoryImage, ModuleId,
    PatchConfig, PatchEngine, PatchableImage, SymbolKind,
};

// Helper: stage `module` at `/tmp/<name>.so` and load it through the engine
fn load(
    engine: &mut PatchEngine,
    image: &MemoryImage,
    module: ModuleBuilder,
) -> livepatch_engine::PatchReport {
    let path = format!("/tmp/{}.so", module.name());
    image.stage(path.clone(), module);
    engine.load(Path::new(&path)).unwrap()
}

fn engine_for(image: &MemoryImage) -> PatchEngine {
    PatchEngine::new(Arc::new(image.clone()), PatchConfig::default())
}

/// Class `X` whose `f` returns `version` and whose `injected` selector
/// counts invocations in `hooks`
fn x_module(name: &str, version: &'static str, hooks: &Arc<AtomicUsize>) -> ModuleBuilder {
    let hooks = Arc::clone(hooks);
    ModuleBuilder::new(name)
        .method("X.f", move |_| Value::from(version))
        .method("X.injected", move |_| {
            hooks.fetch_add(1, Ordering::SeqCst);
            Value::Unit
        })
        .class(
            ClassBuilder::new("X")
                .slot("f", "X.f")
                .selector("injected", "X.injected")
                .field("peer"),
        )
}

// ============================================================================
// Class Patching
// ============================================================================

#[test]
fn test_existing_instance_sees_new_method() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let hooks = Arc::new(AtomicUsize::new(0));

    load(&mut engine, &image, x_module("m1", "v1", &hooks));
    let x = image.instantiate_named("X").unwrap();
    assert_eq!(x.call("f", &[]).unwrap(), Value::from("v1"));

    let report = load(&mut engine, &image, x_module("m2", "v2", &hooks));
    assert_eq!(report.classes_patched, 1);
    assert_eq!(report.slots_written, 1);
    assert!(report.hint.is_none());
    assert_eq!(x.call("f", &[]).unwrap(), Value::from("v2"));
}

#[test]
fn test_non_patchable_slots_stay_identical() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let module = |name: &str, version: &'static str| {
        ModuleBuilder::new(name)
            .method("W.draw", move |_| Value::from(version))
            .function("W.tint", SymbolKind::OpaqueGetter, move |_| Value::from(version))
            .function("W.bridge", SymbolKind::Thunk, move |_| Value::from(version))
            .class(
                ClassBuilder::new("W")
                    .slot("draw", "W.draw")
                    .slot("tint", "W.tint")
                    .slot("bridge", "W.bridge"),
            )
    };

    load(&mut engine, &image, module("w1", "v1"));
    let old = image.latest_class("W").unwrap();
    let before = image.read_slot_table(old).unwrap();
    load(&mut engine, &image, module("w2", "v2"));
    let after = image.read_slot_table(old).unwrap();

    assert_eq!(after[0], before[0]);
    assert_ne!(after[1], before[1]);
    assert_eq!(after[2], before[2]);
    assert_eq!(after[3], before[3]);

    let w = image.instantiate(old).unwrap();
    assert_eq!(w.call("draw", &[]).unwrap(), Value::from("v2"));
    assert_eq!(w.call("tint", &[]).unwrap(), Value::from("v1"));
}

#[test]
fn test_layout_change_is_skipped() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let module = |name: &str, version: &'static str, size: usize| {
        ModuleBuilder::new(name)
            .method("Y.f", move |_| Value::from(version))
            .class(ClassBuilder::new("Y").size(size).slot("f", "Y.f"))
    };

    load(&mut engine, &image, module("y1", "v1", 16));
    let y = image.instantiate_named("Y").unwrap();
    let report = load(&mut engine, &image, module("y2", "v2", 32));

    assert_eq!(report.layout_mismatches, vec!["Y".to_string()]);
    assert_eq!(report.classes_patched, 0);
    assert_eq!(report.slots_written, 0);
    assert_eq!(y.call("f", &[]).unwrap(), Value::from("v1"));
}

#[test]
fn test_three_versions_patch_every_old_descriptor() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let hooks = Arc::new(AtomicUsize::new(0));

    load(&mut engine, &image, x_module("m1", "v1", &hooks));
    let first = image.instantiate_named("X").unwrap();
    load(&mut engine, &image, x_module("m2", "v2", &hooks));
    let second = image.instantiate_named("X").unwrap();
    let report = load(&mut engine, &image, x_module("m3", "v3", &hooks));

    assert_eq!(report.slots_written, 2);
    assert_eq!(first.call("f", &[]).unwrap(), Value::from("v3"));
    assert_eq!(second.call("f", &[]).unwrap(), Value::from("v3"));
}

#[test]
fn test_generic_subclass_is_swizzled_not_slot_patched() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let module = |name: &str, version: &'static str| {
        ModuleBuilder::new(name)
            .method("IntList.describe", move |_| Value::from(version))
            .class(
                ClassBuilder::new("IntList")
                    .derives_from_generic()
                    .slot("describe", "IntList.describe")
                    .selector("describe", "IntList.describe"),
            )
    };

    load(&mut engine, &image, module("l1", "v1"));
    let list = image.instantiate_named("IntList").unwrap();
    let report = load(&mut engine, &image, module("l2", "v2"));

    assert_eq!(report.classes_patched, 1);
    assert_eq!(report.slots_written, 0);
    assert_eq!(report.selectors_swizzled, 1);
    assert_eq!(list.send("describe", &[]).unwrap(), Value::from("v2"));
    assert_eq!(list.call("describe", &[]).unwrap(), Value::from("v1"));
}

#[test]
fn test_generic_subclass_layout_change_is_skipped() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let module = |name: &str, version: &'static str, size: usize| {
        ModuleBuilder::new(name)
            .method("L.describe", move |_| Value::from(version))
            .class(
                ClassBuilder::new("L")
                    .derives_from_generic()
                    .size(size)
                    .selector("describe", "L.describe"),
            )
    };

    load(&mut engine, &image, module("l1", "v1", 16));
    let list = image.instantiate_named("L").unwrap();
    let report = load(&mut engine, &image, module("l2", "v2", 48));

    assert_eq!(report.layout_mismatches, vec!["L".to_string()]);
    assert_eq!(report.classes_patched, 0);
    assert_eq!(report.selectors_swizzled, 0);
    assert_eq!(list.send("describe", &[]).unwrap(), Value::from("v1"));
}

// ============================================================================
// Interposition
// ============================================================================

#[test]
fn test_free_function_callers_are_rebound() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);

    let app = load(
        &mut engine,
        &image,
        ModuleBuilder::new("app")
            .function("greeting", SymbolKind::Function, |_| Value::from("hello"))
            .function("main", SymbolKind::Function, |inv| {
                inv.call("greeting", &[]).unwrap_or(Value::Unit)
            }),
    )
    .module;
    let report = load(
        &mut engine,
        &image,
        ModuleBuilder::new("patch")
            .function("greeting", SymbolKind::Function, |_| Value::from("bonjour")),
    );

    assert_eq!(report.rebound, vec!["greeting".to_string()]);
    assert_eq!(
        image.call_symbol(app, "main", &[]).unwrap(),
        Value::from("bonjour")
    );
}

#[test]
fn test_interposition_is_monotonic() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let exporting = |name: &str, result: &'static str| {
        ModuleBuilder::new(name).function("s", SymbolKind::Function, move |_| Value::from(result))
    };

    load(&mut engine, &image, exporting("s1", "1"));
    let second = load(&mut engine, &image, exporting("s2", "2")).module;
    load(
        &mut engine,
        &image,
        ModuleBuilder::new("s3").function("t", SymbolKind::Function, |_| Value::Unit),
    );

    let entry = engine.interposition().entry("s").unwrap();
    assert_eq!(entry.module, second);
    assert_eq!(entry.sequence, 2);
    assert_eq!(
        engine.interposition().lookup("s"),
        image.lookup_symbol(second, "s")
    );
}

#[test]
fn test_static_state_preserved() {
    let image = MemoryImage::new();
    let config = PatchConfig {
        preserve_static_state: true,
        ..PatchConfig::default()
    };
    let mut engine = PatchEngine::new(Arc::new(image.clone()), config);
    let module = |name: &str, value: i64| {
        ModuleBuilder::new(name).function("counter", SymbolKind::MutableAddressor, move |_| {
            Value::Int(value)
        })
    };

    load(&mut engine, &image, module("c1", 1));
    let report = load(&mut engine, &image, module("c2", 2));

    assert!(report.rebound.is_empty());
    assert!(engine.interposition().lookup("counter").is_none());
    assert_eq!(report.hint, Some(BuildHint::NothingPatched));
}

#[test]
fn test_new_module_sees_earlier_patches() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);

    load(
        &mut engine,
        &image,
        ModuleBuilder::new("base").function("helper", SymbolKind::Function, |_| Value::from("old")),
    );
    load(
        &mut engine,
        &image,
        ModuleBuilder::new("fix").function("helper", SymbolKind::Function, |_| Value::from("new")),
    );
    let feature = load(
        &mut engine,
        &image,
        ModuleBuilder::new("feature")
            .import("helper")
            .function("run", SymbolKind::Function, |inv| {
                inv.call("helper", &[]).unwrap_or(Value::Unit)
            }),
    );

    assert!(feature.rebound.contains(&"helper".to_string()));
    assert_eq!(
        image.call_symbol(feature.module, "run", &[]).unwrap(),
        Value::from("new")
    );
}

// ============================================================================
// Generics
// ============================================================================

fn box_module(name: &str, version: &'static str) -> ModuleBuilder {
    ModuleBuilder::new(name)
        .method("Box.value", move |_| Value::from(version))
        .class(ClassBuilder::new("Box").generic().slot("value", "Box.value"))
}

#[test]
fn test_existing_specializations_see_new_method() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    assert_eq!(engine.generic_hook(), HookState::Installed);

    load(&mut engine, &image, box_module("box1", "v1"));
    let int_box = image
        .instantiate(image.specialize("Box", &["Int"]).unwrap())
        .unwrap();
    let string_box = image
        .instantiate(image.specialize("Box", &["String"]).unwrap())
        .unwrap();

    let report = load(&mut engine, &image, box_module("box2", "v2"));
    assert_eq!(report.specializations_patched, 2);
    assert_eq!(int_box.call("value", &[]).unwrap(), Value::from("v2"));
    assert_eq!(string_box.call("value", &[]).unwrap(), Value::from("v2"));
}

#[test]
fn test_sweep_notifies_specializations_of_reloaded_base() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let hooks = Arc::new(AtomicUsize::new(0));
    let module = |name: &str, version: &'static str| {
        let hooks = Arc::clone(&hooks);
        ModuleBuilder::new(name)
            .method("Box.value", move |_| Value::from(version))
            .method("Box.injected", move |_| {
                hooks.fetch_add(1, Ordering::SeqCst);
                Value::Unit
            })
            .class(
                ClassBuilder::new("Box")
                    .generic()
                    .slot("value", "Box.value")
                    .selector("injected", "Box.injected"),
            )
    };

    load(&mut engine, &image, module("box1", "v1"));
    let int_box = image
        .instantiate(image.specialize("Box", &["Int"]).unwrap())
        .unwrap();
    assert_eq!(int_box.class_name(), "Box<Int>");
    engine.roots().add_value(Value::from(int_box.clone()));

    let report = load(&mut engine, &image, module("box2", "v2"));
    assert_eq!(report.class_names, vec!["Box".to_string()]);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    assert_eq!(engine.last_sweep().unwrap().notified, 1);
    assert_eq!(int_box.call("value", &[]).unwrap(), Value::from("v2"));
}

#[test]
fn test_only_reloaded_base_is_patched() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let generic = |name: &str, base: &'static str, version: &'static str| {
        let method = format!("{}.run", base);
        ModuleBuilder::new(name)
            .method(method.clone(), move |_| Value::from(version))
            .class(ClassBuilder::new(base).generic().slot("run", method))
    };

    load(&mut engine, &image, generic("g1", "G", "v1"));
    load(&mut engine, &image, generic("h1", "H", "v1"));
    for arg in ["A", "B", "C"] {
        image.specialize("G", &[arg]).unwrap();
    }
    let h = image.specialize("H", &["A"]).unwrap();
    assert_eq!(engine.generics().specializations("G").len(), 3);
    let h_slots = image.read_slot_table(h).unwrap();

    let report = load(&mut engine, &image, generic("g2", "G", "v2"));
    assert_eq!(report.specializations_patched, 3);
    assert_eq!(report.slots_written, 3);
    assert_eq!(image.read_slot_table(h).unwrap(), h_slots);
}

#[test]
fn test_generic_patching_degrades_without_hook() {
    let image = MemoryImage::without_allocation_hook();
    let mut engine = engine_for(&image);
    assert_eq!(engine.generic_hook(), HookState::Unavailable);

    load(&mut engine, &image, box_module("box1", "v1"));
    let int_box = image
        .instantiate(image.specialize("Box", &["Int"]).unwrap())
        .unwrap();
    let report = load(&mut engine, &image, box_module("box2", "v2"));

    assert_eq!(report.specializations_patched, 0);
    assert_eq!(int_box.call("value", &[]).unwrap(), Value::from("v1"));
}

// ============================================================================
// Sweep and Events
// ============================================================================

#[test]
fn test_lifecycle_hook_runs_once_per_instance() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let hooks = Arc::new(AtomicUsize::new(0));

    load(&mut engine, &image, x_module("m1", "v1", &hooks));
    let a = image.instantiate_named("X").unwrap();
    let b = image.instantiate_named("X").unwrap();
    a.set_field("peer", b.clone());
    b.set_field("peer", a.clone());
    engine.roots().add_value(Value::from(a.clone()));
    engine
        .roots()
        .add_value(vec![Value::from(b.clone()), Value::from(a.clone())]);

    let events = engine.events().subscribe();
    let report = load(&mut engine, &image, x_module("m2", "v2", &hooks));

    assert_eq!(hooks.load(Ordering::SeqCst), 2);
    let sweep = engine.last_sweep().unwrap();
    assert_eq!(sweep.objects_visited, 2);
    assert_eq!(sweep.notified, 2);

    let event = events.try_recv().unwrap();
    assert_eq!(event.module, report.module);
    assert_eq!(event.class_names, vec!["X".to_string()]);
}

#[test]
fn test_sweep_waits_for_main_context() {
    let image = MemoryImage::new();
    let main = Arc::new(MainThreadQueue::new());
    let mut engine = engine_for(&image).with_main_context(main.clone());
    let hooks = Arc::new(AtomicUsize::new(0));

    load(&mut engine, &image, x_module("m1", "v1", &hooks));
    assert_eq!(main.run_pending(), 1);
    engine
        .roots()
        .add_value(Value::from(image.instantiate_named("X").unwrap()));
    let events = engine.events().subscribe();
    load(&mut engine, &image, x_module("m2", "v2", &hooks));

    assert_eq!(hooks.load(Ordering::SeqCst), 0);
    assert!(events.try_recv().is_err());

    assert_eq!(main.run_pending(), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    assert_eq!(events.try_iter().count(), 1);
}

#[test]
fn test_excluded_types_are_not_notified() {
    let image = MemoryImage::new();
    let config = PatchConfig {
        sweep_exclusion_pattern: Some("^X$".to_string()),
        ..PatchConfig::default()
    };
    let mut engine = PatchEngine::new(Arc::new(image.clone()), config);
    let hooks = Arc::new(AtomicUsize::new(0));

    load(&mut engine, &image, x_module("m1", "v1", &hooks));
    engine
        .roots()
        .add_value(Value::from(image.instantiate_named("X").unwrap()));
    load(&mut engine, &image, x_module("m2", "v2", &hooks));

    assert_eq!(hooks.load(Ordering::SeqCst), 0);
    assert_eq!(engine.last_sweep().unwrap().excluded, 1);
}

#[test]
fn test_legacy_objects_are_walked() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let hooks = Arc::new(AtomicUsize::new(0));

    load(
        &mut engine,
        &image,
        ModuleBuilder::new("ui")
            .class(ClassBuilder::new("Object"))
            .class(
                ClassBuilder::new("Window")
                    .superclass("Object")
                    .legacy_layout()
                    .field("content"),
            ),
    );
    load(&mut engine, &image, x_module("m1", "v1", &hooks));
    let window = image.instantiate_named("Window").unwrap();
    window.set_field("content", image.instantiate_named("X").unwrap());
    engine.roots().add_value(Value::from(window));

    load(&mut engine, &image, x_module("m2", "v2", &hooks));
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Listeners and Diagnostics
// ============================================================================

struct KeyPathCache {
    calls: AtomicUsize,
}

impl LoadListener for KeyPathCache {
    fn name(&self) -> &str {
        "key-path-cache"
    }

    fn requires_key_path_hook(&self) -> bool {
        true
    }

    fn module_loaded(&self, _image: &dyn PatchableImage, _module: ModuleId) -> ListenerVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ListenerVerdict::Diverged("cached key path offsets are stale".to_string())
    }
}

#[test]
fn test_key_path_listener_gated_and_divergence_reported() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let cache = Arc::new(KeyPathCache {
        calls: AtomicUsize::new(0),
    });
    engine.add_listener(cache.clone());

    let report = load(
        &mut engine,
        &image,
        ModuleBuilder::new("plain").function("f", SymbolKind::Function, |_| Value::Unit),
    );
    assert_eq!(cache.calls.load(Ordering::SeqCst), 0);
    assert!(!report.needs_restart());

    let report = load(
        &mut engine,
        &image,
        ModuleBuilder::new("routing").function(
            "RoutingKit.Parameters",
            SymbolKind::Metadata,
            |_| Value::Unit,
        ),
    );
    assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
    assert!(report.needs_restart());
    assert_eq!(report.divergences[0].listener, "key-path-cache");
}

#[test]
fn test_empty_module_produces_build_hint() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);

    let report = load(&mut engine, &image, ModuleBuilder::new("nothing"));
    assert_eq!(report.hint, Some(BuildHint::NothingPatched));
    assert!(report.rebound.is_empty());
}

/// Test-case class `WidgetTests` whose `runTests` entry counts runs
fn suite_module(name: &str, runs: &Arc<AtomicUsize>) -> ModuleBuilder {
    let runs = Arc::clone(runs);
    ModuleBuilder::new(name)
        .method("WidgetTests.runTests", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Value::Unit
        })
        .class(
            ClassBuilder::new("WidgetTests")
                .test_case()
                .class_selector("runTests", "WidgetTests.runTests"),
        )
}

#[test]
fn test_injected_test_case_runs_after_each_load() {
    let image = MemoryImage::new();
    let mut engine = engine_for(&image);
    let runs = Arc::new(AtomicUsize::new(0));

    load(&mut engine, &image, suite_module("suite1", &runs));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let report = load(&mut engine, &image, suite_module("suite2", &runs));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(!report.needs_restart());
}

#[test]
fn test_test_case_runs_can_be_disabled() {
    let image = MemoryImage::new();
    let config = PatchConfig {
        run_test_cases: false,
        ..PatchConfig::default()
    };
    let mut engine = PatchEngine::new(Arc::new(image.clone()), config);
    let runs = Arc::new(AtomicUsize::new(0));

    load(&mut engine, &image, suite_module("suite1", &runs));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}
