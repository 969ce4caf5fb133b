use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::compiled_unit::{
    build_universal, has_universal_signature, BytecodeVariant, CompiledScriptUnit, UnitKind,
    UniversalHeader, HEADER_SIZE, PAYLOAD_ALIGN, UNIVERSAL_SIGNATURE,
};
use crate::error::CompiledUnitError;

#[test]
fn test_universal_layout() {
    let unit = build_universal(b"standard-bytes", b"gc64");
    let header = UniversalHeader::parse(&unit).unwrap();

    assert_eq!(header.signature, UNIVERSAL_SIGNATURE);
    assert_eq!(header.gc64_offset as usize % PAYLOAD_ALIGN, 0);
    assert_eq!(header.standard_offset as usize % PAYLOAD_ALIGN, 0);
    assert!(header.gc64_offset as usize >= HEADER_SIZE);
    assert_eq!(header.payload(&unit, BytecodeVariant::Gc64).unwrap(), b"gc64");
    assert_eq!(
        header.payload(&unit, BytecodeVariant::Standard).unwrap(),
        b"standard-bytes"
    );
}

#[test]
fn test_native_variant_is_selected() {
    let unit = build_universal(b"std", b"g64");
    let compiled = CompiledScriptUnit::from_universal("a.lua", unit).unwrap();
    let expected: &[u8] = if cfg!(target_pointer_width = "64") { b"g64" } else { b"std" };

    assert_eq!(compiled.bytes(), expected);
    assert_eq!(compiled.kind(), UnitKind::Bytecode);
    assert_eq!(compiled.path().to_str(), Some("a.lua"));
}

#[test]
fn test_header_errors() {
    assert_eq!(
        UniversalHeader::parse(&[0u8; 8]),
        Err(CompiledUnitError::TooShort(8))
    );

    let mut bad = build_universal(b"a", b"b");
    bad[0] ^= 0xff;
    assert!(matches!(
        UniversalHeader::parse(&bad),
        Err(CompiledUnitError::BadSignature(_))
    ));
    assert!(!has_universal_signature(&bad));

    let mut version = build_universal(b"a", b"b");
    version[4] = 9;
    assert_eq!(
        UniversalHeader::parse(&version),
        Err(CompiledUnitError::BadVersion(9))
    );
}

#[test]
fn test_out_of_range_payload_rejected() {
    let mut unit = build_universal(b"abc", b"def");
    // Claim a gc64 payload far larger than the buffer.
    unit[12..16].copy_from_slice(&10_000u32.to_le_bytes());
    assert!(matches!(
        CompiledScriptUnit::from_universal_variant("x", unit, BytecodeVariant::Gc64),
        Err(CompiledUnitError::BadRange { .. })
    ));
}

struct TrackedBuffer {
    bytes: Vec<u8>,
    drops: Arc<AtomicUsize>,
}

impl AsRef<[u8]> for TrackedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_buffer_released_on_success_and_failure() {
    let drops = Arc::new(AtomicUsize::new(0));

    let good = TrackedBuffer {
        bytes: build_universal(b"s", b"g"),
        drops: Arc::clone(&drops),
    };
    let unit = CompiledScriptUnit::from_universal("ok", good).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    let bad = TrackedBuffer {
        bytes: vec![1, 2, 3],
        drops: Arc::clone(&drops),
    };
    assert!(CompiledScriptUnit::from_universal("bad", bad).is_err());
    assert_eq!(drops.load(Ordering::SeqCst), 2);

    // The unit keeps its own copy of the payload.
    assert_eq!(unit.bytes().len(), 1);
}

#[test]
fn test_bytecode_unit_runs_in_vm() {
    let vm = crate::vm::Vm::new(crate::settings::VmSettings::default()).unwrap();
    let dumped = vm
        .with_lua(|lua| {
            let f = lua.load("return 6 * 7").into_function().unwrap();
            f.dump(true)
        })
        .unwrap();
    let universal = build_universal(&dumped, &dumped);
    let unit = CompiledScriptUnit::from_universal("answer.lua", universal).unwrap();

    let answer: i64 = vm
        .with_lua(|lua| {
            lua.load(unit.bytes())
                .set_mode(mlua::ChunkMode::Binary)
                .eval()
                .unwrap()
        })
        .unwrap();
    assert_eq!(answer, 42);
}
