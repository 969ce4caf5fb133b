use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::test_vm;
use crate::content::MemoryContent;
use crate::error::{ContentError, ScriptError};
use crate::handle_table::HandleTable;
use crate::settings::{BuildConfig, VmSettings};
use crate::vm::{Vm, VmLifecycle};

#[test]
fn test_lifecycle() {
    let (vm, _) = test_vm(&[]);
    assert_eq!(vm.lifecycle(), VmLifecycle::Created);
    vm.run_code("local x = 1").unwrap();
    assert_eq!(vm.lifecycle(), VmLifecycle::Running);

    vm.shutdown();
    assert_eq!(vm.lifecycle(), VmLifecycle::Destroyed);
    assert!(matches!(vm.run_code("local x = 1"), Err(ScriptError::Destroyed)));
    // Idempotent.
    vm.shutdown();
    assert_eq!(vm.lifecycle(), VmLifecycle::Destroyed);
}

#[test]
fn test_weak_handle_follows_lifetime() {
    let (vm, _) = test_vm(&[]);
    let weak = vm.weak_handle();
    assert!(weak.is_alive());
    assert!(weak.upgrade().is_some_and(|v| v.handle() == vm.handle()));

    vm.shutdown();
    assert!(!weak.is_alive());
    drop(vm);
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_vms_share_handle_table() {
    let table = HandleTable::shared();
    let a = Vm::new(VmSettings::default().with_handles(Arc::clone(&table))).unwrap();
    let b = Vm::new(VmSettings::default().with_handles(Arc::clone(&table))).unwrap();
    assert_ne!(a.handle(), b.handle());

    let handle = a.handle();
    assert!(table.resolve(handle).is_some());
    drop(a);
    assert!(table.resolve(handle).is_none());
    assert!(table.resolve(b.handle()).is_some());
}

#[test]
fn test_print_routes_to_output() {
    let (vm, captured) = test_vm(&[]);
    vm.run_code(r#"print("hello", 42, {}, "world")"#).unwrap();
    assert_eq!(*captured.output.lock(), vec!["hello", "42", "world"]);
}

#[test]
fn test_os_and_io_are_absent() {
    let (vm, _) = test_vm(&[("os.lua", "return {}")]);
    vm.run_code(
        r#"
        assert(os == nil)
        assert(io == nil)
        local ok, err = pcall(require, "os")
        assert(not ok)
        assert(err == "error loading module 'os':\n\tfile not found or error reading file.", err)
        "#,
    )
    .unwrap();
}

#[test]
fn test_require_resolves_through_content() {
    let (vm, _) = test_vm(&[
        ("lib/shapes.lua", "return { area = function(w, h) return w * h end }"),
        ("main.lua", "local shapes = require 'lib.shapes' Result = shapes.area(3, 4)"),
    ]);
    vm.run_script("main.lua").unwrap();
    vm.run_code("assert(Result == 12)").unwrap();
}

#[test]
fn test_require_missing_module() {
    let (vm, _) = test_vm(&[]);
    vm.run_code(
        r#"
        local ok, err = pcall(require, "missing")
        assert(not ok)
        assert(err == "error loading module 'missing':\nstack:\n\t'file not found or error reading file.'", err)
        "#,
    )
    .unwrap();
}

#[test]
fn test_require_reports_syntax_errors() {
    let (vm, _) = test_vm(&[("broken.lua", "return {")]);
    vm.run_code(
        r#"
        local ok, err = pcall(require, "broken")
        assert(not ok)
        assert(err:find("error loading module 'broken'", 1, true), err)
        "#,
    )
    .unwrap();
}

#[test]
fn test_run_script_missing() {
    let (vm, _) = test_vm(&[]);
    assert!(matches!(vm.run_script("nothing"), Err(ScriptError::NotFound(_))));
}

#[test]
fn test_resolve_file_path_from_relative() {
    let (vm, _) = test_vm(&[("a/b.lua", "")]);
    assert_eq!(
        vm.resolve_file_path_from_relative("a/b"),
        Some("scripts/a/b.lua".into())
    );
    assert_eq!(
        vm.resolve_file_path_from_relative("a/b.lua"),
        Some("scripts/a/b.lua".into())
    );
    assert_eq!(vm.resolve_file_path_from_relative("../scripts/a/b"), None);
    assert_eq!(vm.resolve_file_path_from_relative("a/../a/b"), None);
    assert_eq!(vm.resolve_file_path_from_relative("a/c"), None);
}

#[test]
fn test_syntax_error_is_reported() {
    let (vm, captured) = test_vm(&[]);
    let result = vm.run_code("this is not lua");
    assert!(matches!(result, Err(ScriptError::Load { .. })));
    assert_eq!(captured.errors.lock().len(), 1);
}

#[test]
fn test_runtime_error_is_reported() {
    let (vm, captured) = test_vm(&[]);
    let result = vm.run_code("local function fail() error('boom') end fail()");
    match result {
        Err(ScriptError::Runtime { reason, traceback }) => {
            assert!(reason.contains("boom"), "{reason}");
            assert!(traceback.contains("fail"), "{traceback}");
        }
        other => panic!("unexpected {other:?}"),
    }
    let errors = captured.errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("boom"));
}

#[test]
fn test_random_ranges() {
    let (vm, _) = test_vm(&[]);
    vm.run_code(
        r#"
        for _ = 1, 200 do
            local f = math.random()
            assert(f >= 0 and f < 1)
            local n = math.random(6)
            assert(n >= 1 and n <= 6 and math.type(n) == "integer")
            local r = math.random(-3, 3)
            assert(r >= -3 and r <= 3)
        end
        assert(math.random(5, 5) == 5)
        "#,
    )
    .unwrap();
}

#[test]
fn test_random_argument_checks() {
    let (vm, _) = test_vm(&[]);
    vm.run_code(
        r#"
        local ok, err = pcall(math.random, 0)
        assert(not ok and err:find("bad argument #1 to 'random' (interval is empty)", 1, true), err)
        ok, err = pcall(math.random, 5, 1)
        assert(not ok and err:find("bad argument #2 to 'random' (interval is empty)", 1, true), err)
        ok, err = pcall(math.random, 1, 2, 3)
        assert(not ok and err:find("wrong number of arguments", 1, true), err)
        "#,
    )
    .unwrap();
}

#[test]
fn test_random_seed_is_deterministic() {
    let (vm, _) = test_vm(&[]);
    vm.run_code(
        r#"
        math.randomseed(1234)
        local a = { math.random(1000), math.random(1000), math.random() }
        math.randomseed(1234)
        local b = { math.random(1000), math.random(1000), math.random() }
        for i = 1, 3 do assert(a[i] == b[i]) end
        "#,
    )
    .unwrap();
}

#[test]
fn test_progress_counters() {
    let (vm, _) = test_vm(&[]);
    vm.run_code("__initprogresssteps__(3) __initprogresssteps__(2) __oninitprogress__() __oninitprogress__()")
        .unwrap();
    assert_eq!(vm.progress_total(), 5);
    assert_eq!(vm.progress_count(), 2);

    vm.run_code(
        r#"
        local ok, err = pcall(__initprogresssteps__, -1)
        assert(not ok and err:find("expected integer >= 0.", 1, true), err)
        ok, err = pcall(__initprogresssteps__)
        assert(not ok)
        "#,
    )
    .unwrap();
    assert_eq!(vm.progress_total(), 5);
}

#[test]
fn test_build_config_globals() {
    let settings = VmSettings {
        build_config: BuildConfig::Developer,
        ..Default::default()
    };
    let vm = Vm::new(settings).unwrap();
    vm.run_code(
        "assert(g_bBuildConfigDeveloper == true and g_bBuildConfigDebug == false and g_bBuildConfigShip == false)",
    )
    .unwrap();
}

#[test]
fn test_create_table_global() {
    let (vm, _) = test_vm(&[]);
    vm.run_code("local t = CreateTable(4, 2) t[1] = 1 t.x = 2 assert(#t == 1 and t.x == 2)")
        .unwrap();
}

#[test]
fn test_interrupt_stops_running_script() {
    let (vm, captured) = test_vm(&[]);
    let remote = vm.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.interrupt();
    });

    let result = vm.run_code("while true do end");
    stopper.join().unwrap();

    assert!(matches!(result, Err(ScriptError::Interrupted)));
    assert!(vm.interrupted());
    // Errors after an interrupt are not reported.
    assert!(captured.errors.lock().is_empty());
    assert!(matches!(vm.run_code("local x = 1"), Err(ScriptError::Interrupted)));
}

#[test]
fn test_registered_function() {
    let (vm, _) = test_vm(&[]);
    vm.register_function("Add", |fi| {
        let (Some(a), Some(b)) = (fi.get_number(0), fi.get_number(1)) else {
            fi.raise_error(1, "number expected");
            return;
        };
        fi.push_return_number(a + b);
    })
    .unwrap();

    vm.run_code(
        r#"
        assert(Add(2, 3) == 5)
        local ok, err = pcall(Add, 1)
        assert(not ok and err:find("bad argument #2 to 'Add' (number expected)", 1, true), err)
        "#,
    )
    .unwrap();
}

#[test]
fn test_native_panic_becomes_script_error() {
    let (vm, _) = test_vm(&[]);
    vm.register_function("Explode", |_| panic!("kaboom")).unwrap();
    vm.run_code(
        r#"
        local ok, err = pcall(Explode)
        assert(not ok and err:find("kaboom", 1, true), err)
        "#,
    )
    .unwrap();
}

#[test]
fn test_gc_step_and_full() {
    let (vm, _) = test_vm(&[]);
    vm.run_code("Junk = {} for i = 1, 10000 do Junk[i] = { i } end Junk = nil")
        .unwrap();
    let before = vm.used_memory();
    for _ in 0..4 {
        vm.step_garbage_collector().unwrap();
        let step = vm.gc_step_size();
        assert!((1..=64).contains(&step));
    }
    vm.gc_full().unwrap();
    assert!(vm.used_memory() < before);
}

#[test]
fn test_gc_step_size_beyond_i32_completes_cycle() {
    let settings = VmSettings {
        min_gc_step_size: u32::MAX,
        initial_gc_step_size: u32::MAX,
        max_gc_step_size: u32::MAX,
        ..Default::default()
    };
    let vm = Vm::new(settings).unwrap();
    vm.run_code("Junk = {} for i = 1, 10000 do Junk[i] = { i } end Junk = nil")
        .unwrap();
    let before = vm.used_memory();
    vm.step_garbage_collector().unwrap();
    assert_eq!(vm.gc_step_size(), u32::MAX);
    assert!(vm.used_memory() < before);
}

fn source_vm(build_config: BuildConfig, allow_source_fallback: bool) -> Vm {
    let mut content = MemoryContent::new();
    content.insert("scripts/main.lua", "Ran = true");
    content.insert("scripts/lib.lua", "return 1");
    let settings = VmSettings {
        base_paths: vec!["scripts".into()],
        build_config,
        allow_source_fallback,
        ..Default::default()
    }
    .with_content(Arc::new(content));
    Vm::new(settings).unwrap()
}

#[test]
fn test_ship_build_refuses_source_units() {
    let vm = source_vm(BuildConfig::Ship, true);
    assert!(!vm.settings().source_fallback_enabled());
    assert!(matches!(
        vm.run_script("main.lua"),
        Err(ScriptError::Content(ContentError::SourceNotAllowed(_)))
    ));
    vm.run_code(
        r#"
        assert(Ran == nil)
        local ok, err = pcall(require, "lib")
        assert(not ok)
        assert(err:find("source fallback is disabled", 1, true), err)
        "#,
    )
    .unwrap();
}

#[test]
fn test_source_fallback_flag_applies_to_custom_content() {
    let strict = source_vm(BuildConfig::Developer, false);
    assert!(matches!(
        strict.run_script("main.lua"),
        Err(ScriptError::Content(ContentError::SourceNotAllowed(_)))
    ));

    let open = source_vm(BuildConfig::Developer, true);
    open.run_script("main.lua").unwrap();
    open.run_code("assert(Ran == true and require 'lib' == 1)").unwrap();
}

#[test]
fn test_memory_profiling() {
    let settings = VmSettings {
        enable_memory_profiling: true,
        ..Default::default()
    };
    let vm = Vm::new(settings).unwrap();
    vm.run_code("Keep = {} for i = 1, 1000 do Keep[i] = tostring(i) end")
        .unwrap();

    let report = vm.query_memory_profiling_data();
    assert!(!report.is_empty());
    assert!(report.iter().any(|(name, bytes)| name == "[code]" && *bytes > 0));

    let plain = Vm::new(VmSettings::default()).unwrap();
    assert!(plain.query_memory_profiling_data().is_empty());
}

#[test]
fn test_memory_profiling_charges_running_function() {
    let settings = VmSettings {
        enable_memory_profiling: true,
        ..Default::default()
    };
    let vm = Vm::new(settings).unwrap();
    vm.run_code(
        "local function build(n)\n  local t = {}\n  for i = 1, n do t[i] = tostring(i) .. '!' end\n  return t\nend\nKeep = build(2000)",
    )
    .unwrap();

    let report = vm.query_memory_profiling_data();
    let bytes_for = |owner: &str| {
        report
            .iter()
            .find(|(name, _)| name == owner)
            .map(|(_, bytes)| *bytes)
            .unwrap_or(0)
    };
    // `build` is defined on line 1 of the chunk.
    assert!(bytes_for("[code]:1") > bytes_for("[code]"));
}

#[test]
fn test_settings_from_json() {
    let settings = VmSettings::from_json(
        r#"{ "name": "game", "base_paths": ["a", "b"], "max_gc_step_size": 32, "build_config": "Ship" }"#,
    )
    .unwrap();
    assert_eq!(settings.name, "game");
    assert_eq!(settings.base_paths.len(), 2);
    assert_eq!(settings.max_gc_step_size, 32);
    assert_eq!(settings.min_gc_step_size, 1);
    assert_eq!(settings.build_config, BuildConfig::Ship);
}

#[test]
fn test_hotload_hooks() {
    let (vm, _) = test_vm(&[]);
    assert!(!vm.on_hotload().unwrap());
    assert!(!vm.dispose().unwrap());

    vm.run_code(
        r#"
        function OnHotload() Hot = true end
        function RestoreDynamicGameStateData(state) Restored = state.level end
        "#,
    )
    .unwrap();
    assert!(vm.on_hotload().unwrap());

    let mut state = crate::data_node::DataNode::table();
    state.insert("level", 7);
    assert!(vm.restore_dynamic_game_state_data(&state).unwrap());
    vm.run_code("assert(Hot == true and Restored == 7)").unwrap();
}
