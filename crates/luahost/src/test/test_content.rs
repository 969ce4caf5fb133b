use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::compiled_unit::{build_universal, UnitKind};
use crate::content::{wait_for, FileSystemContent, MemoryContent, ScriptContent};
use crate::error::ContentError;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("luahost-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_memory_content_resolves_under_base() {
    let mut content = MemoryContent::new();
    content.insert("scripts/main.lua", "return 1");

    let path = content.resolve(Path::new("scripts"), "main.lua").unwrap();
    assert_eq!(path, PathBuf::from("scripts/main.lua"));
    assert!(content.resolve(Path::new("other"), "main.lua").is_none());

    let unit = content.load(&path).unwrap();
    assert_eq!(unit.kind(), UnitKind::Source);
    assert_eq!(unit.bytes(), b"return 1");
}

#[test]
fn test_memory_content_missing() {
    let content = MemoryContent::new();
    assert!(matches!(
        content.load(Path::new("nope.lua")),
        Err(ContentError::NotFound(_))
    ));
}

#[test]
fn test_memory_content_detects_universal_units() {
    let mut content = MemoryContent::new();
    content.insert("a.lua", build_universal(b"s", b"g"));
    assert_eq!(
        content.load(Path::new("a.lua")).unwrap().kind(),
        UnitKind::Bytecode
    );
}

#[test]
fn test_file_system_content() {
    let dir = scratch_dir("fs");
    std::fs::write(dir.join("hello.lua"), "print('hi')").unwrap();

    let content = FileSystemContent::new(true);
    let path = content.resolve(&dir, "hello.lua").unwrap();
    assert_eq!(content.load(&path).unwrap().bytes(), b"print('hi')");
    assert!(content.resolve(&dir, "missing.lua").is_none());
    assert!(matches!(
        content.load(&dir.join("missing.lua")),
        Err(ContentError::NotFound(_))
    ));

    let strict = FileSystemContent::new(false);
    assert!(matches!(
        strict.load(&path),
        Err(ContentError::SourceNotAllowed(_))
    ));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_file_system_rejects_corrupt_unit() {
    let dir = scratch_dir("corrupt");
    let mut unit = build_universal(b"s", b"g");
    unit.truncate(10);
    std::fs::write(dir.join("bad.lua"), &unit).unwrap();

    let content = FileSystemContent::new(true).with_load_timeout(Duration::ZERO);
    assert!(matches!(
        content.load(&dir.join("bad.lua")),
        Err(ContentError::Unit { .. })
    ));
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_file_system_waits_for_unit_in_flight() {
    let dir = scratch_dir("inflight");
    let target = dir.join("cooked.lua");
    let full = build_universal(b"standard", b"gc64");
    let mut partial = full.clone();
    partial.truncate(10);
    std::fs::write(&target, &partial).unwrap();

    let writer = {
        let dir = dir.clone();
        let target = target.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let staging = dir.join("cooked.tmp");
            std::fs::write(&staging, &full).unwrap();
            std::fs::rename(&staging, &target).unwrap();
        })
    };

    let content = FileSystemContent::new(false).with_load_timeout(Duration::from_secs(10));
    let start = Instant::now();
    let unit = content.load(&target).unwrap();
    assert_eq!(unit.kind(), UnitKind::Bytecode);
    assert!(start.elapsed() >= Duration::from_millis(40));

    writer.join().unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_file_system_missing_file_is_final() {
    let dir = scratch_dir("final");
    let content = FileSystemContent::new(true).with_load_timeout(Duration::from_secs(10));
    let start = Instant::now();
    assert!(matches!(
        content.load(&dir.join("absent.lua")),
        Err(ContentError::NotFound(_))
    ));
    assert!(start.elapsed() < Duration::from_secs(5));
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_wait_for_polls_until_ready() {
    let polls = AtomicUsize::new(0);
    let value = wait_for(Duration::from_secs(5), || {
        let n = polls.fetch_add(1, Ordering::SeqCst);
        (n == 3).then_some("loaded")
    });
    assert_eq!(value, Some("loaded"));
    assert_eq!(polls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_wait_for_times_out() {
    let value: Option<()> = wait_for(Duration::from_millis(10), || None);
    assert!(value.is_none());
}
