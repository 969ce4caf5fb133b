//! Compiled script units.
//!
//! Cooked scripts are stored in a "universal" container carrying two bytecode
//! builds, one for 64-bit (GC64) and one for 32-bit targets:
//!
//! ```text
//! u32 signature   0xA3C882F3
//! i32 version     1
//! u32 gc64 offset, u32 gc64 size
//! u32 standard offset, u32 standard size
//! ...payloads, each aligned to 16 bytes
//! ```
//!
//! All fields are little endian. Signature and version are validated before
//! any offset is trusted, and offsets are bounds-checked against the buffer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::CompiledUnitError;

pub const UNIVERSAL_SIGNATURE: u32 = 0xA3C8_82F3;
pub const UNIVERSAL_VERSION: i32 = 1;
pub const HEADER_SIZE: usize = 24;
pub const PAYLOAD_ALIGN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytecodeVariant {
    /// 32-bit pointer build.
    Standard,
    /// 64-bit pointer build.
    Gc64,
}

impl BytecodeVariant {
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            BytecodeVariant::Gc64
        } else {
            BytecodeVariant::Standard
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniversalHeader {
    pub signature: u32,
    pub version: i32,
    pub gc64_offset: u32,
    pub gc64_size: u32,
    pub standard_offset: u32,
    pub standard_size: u32,
}

impl UniversalHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, CompiledUnitError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CompiledUnitError::TooShort(bytes.len()));
        }
        let signature = LittleEndian::read_u32(&bytes[0..4]);
        if signature != UNIVERSAL_SIGNATURE {
            return Err(CompiledUnitError::BadSignature(signature));
        }
        let version = LittleEndian::read_i32(&bytes[4..8]);
        if version != UNIVERSAL_VERSION {
            return Err(CompiledUnitError::BadVersion(version));
        }
        Ok(Self {
            signature,
            version,
            gc64_offset: LittleEndian::read_u32(&bytes[8..12]),
            gc64_size: LittleEndian::read_u32(&bytes[12..16]),
            standard_offset: LittleEndian::read_u32(&bytes[16..20]),
            standard_size: LittleEndian::read_u32(&bytes[20..24]),
        })
    }

    pub fn range(&self, variant: BytecodeVariant) -> (u32, u32) {
        match variant {
            BytecodeVariant::Gc64 => (self.gc64_offset, self.gc64_size),
            BytecodeVariant::Standard => (self.standard_offset, self.standard_size),
        }
    }

    /// Returns the payload slice for `variant`, rejecting ranges outside `bytes`.
    pub fn payload<'a>(
        &self,
        bytes: &'a [u8],
        variant: BytecodeVariant,
    ) -> Result<&'a [u8], CompiledUnitError> {
        let (offset, size) = self.range(variant);
        let bad = CompiledUnitError::BadRange {
            offset,
            size,
            len: bytes.len(),
        };
        let start = offset as usize;
        let end = start.checked_add(size as usize).ok_or_else(|| bad.clone())?;
        if start < HEADER_SIZE || end > bytes.len() {
            return Err(bad);
        }
        Ok(&bytes[start..end])
    }
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Builds a universal container from the two bytecode builds.
pub fn build_universal(standard: &[u8], gc64: &[u8]) -> Vec<u8> {
    let gc64_offset = round_up(HEADER_SIZE, PAYLOAD_ALIGN);
    let standard_offset = round_up(gc64_offset + gc64.len(), PAYLOAD_ALIGN);

    let mut out = Vec::with_capacity(standard_offset + standard.len());
    // Writes into a Vec cannot fail.
    let _ = out.write_u32::<LittleEndian>(UNIVERSAL_SIGNATURE);
    let _ = out.write_i32::<LittleEndian>(UNIVERSAL_VERSION);
    let _ = out.write_u32::<LittleEndian>(gc64_offset as u32);
    let _ = out.write_u32::<LittleEndian>(gc64.len() as u32);
    let _ = out.write_u32::<LittleEndian>(standard_offset as u32);
    let _ = out.write_u32::<LittleEndian>(standard.len() as u32);
    out.resize(gc64_offset, 0);
    out.extend_from_slice(gc64);
    out.resize(standard_offset, 0);
    out.extend_from_slice(standard);
    out
}

pub fn has_universal_signature(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && LittleEndian::read_u32(&bytes[0..4]) == UNIVERSAL_SIGNATURE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Bytecode,
    Source,
}

/// Immutable chunk ready to be loaded into a VM, plus its path identity.
#[derive(Debug, Clone)]
pub struct CompiledScriptUnit {
    path: PathBuf,
    kind: UnitKind,
    data: Arc<[u8]>,
}

impl CompiledScriptUnit {
    /// Extracts the bytecode for this target from a universal container.
    ///
    /// `buffer` is consumed either way; on failure it is dropped before returning.
    pub fn from_universal<B: AsRef<[u8]>>(
        path: impl Into<PathBuf>,
        buffer: B,
    ) -> Result<Self, CompiledUnitError> {
        Self::from_universal_variant(path, buffer, BytecodeVariant::native())
    }

    pub fn from_universal_variant<B: AsRef<[u8]>>(
        path: impl Into<PathBuf>,
        buffer: B,
        variant: BytecodeVariant,
    ) -> Result<Self, CompiledUnitError> {
        let bytes = buffer.as_ref();
        let header = UniversalHeader::parse(bytes)?;
        let payload = header.payload(bytes, variant)?;
        Ok(Self {
            path: path.into(),
            kind: UnitKind::Bytecode,
            data: Arc::from(payload),
        })
    }

    pub fn from_source(path: impl Into<PathBuf>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            kind: UnitKind::Source,
            data: Arc::from(source.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}
