// Error types for the VM runtime layer
//
// Script runtime errors never unwind through the VM. They are captured by the
// traceback handler and delivered to the configured error delegate; the
// host-side API surfaces them as `ScriptError` values.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by VM lifecycle and call-boundary operations.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// An error raised by script code (or a native function called from it).
    #[error("script error: {reason}")]
    Runtime { reason: String, traceback: String },

    /// A chunk failed to load (syntax error, bad bytecode, missing content).
    #[error("failed loading '{name}': {message}")]
    Load { name: String, message: String },

    #[error("'{0}' could not be resolved against any base path")]
    NotFound(String),

    #[error("VM has been interrupted")]
    Interrupted,

    #[error("VM has been destroyed")]
    Destroyed,

    #[error("no free VM handles")]
    HandleTableFull,

    #[error("no callable target: {0}")]
    NotCallable(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Conversion failures at the native/VM boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarshalError {
    #[error("integer {0} is outside the exact integer range of a VM number")]
    IntegerOutOfRange(i64),

    #[error("number {0} is outside the exact integer range of a VM number")]
    NumberOutOfRange(f64),

    #[error("cannot convert a {0} value")]
    Unsupported(&'static str),

    #[error("unsupported table key type '{0}'")]
    BadKey(&'static str),

    #[error("table nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("{0}")]
    Lua(String),
}

impl From<mlua::Error> for MarshalError {
    fn from(e: mlua::Error) -> Self {
        MarshalError::Lua(e.to_string())
    }
}

/// Failures parsing the universal compiled script header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompiledUnitError {
    #[error("compiled unit is {0} bytes, smaller than its header")]
    TooShort(usize),

    #[error("bad compiled unit signature 0x{0:08x}")]
    BadSignature(u32),

    #[error("unsupported compiled unit version {0}")]
    BadVersion(i32),

    #[error("bytecode range {offset}+{size} exceeds unit size {len}")]
    BadRange { offset: u32, size: u32, len: usize },
}

/// Failures reported by a content provider.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("{0} not found")]
    NotFound(PathBuf),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Unit {
        path: PathBuf,
        #[source]
        source: CompiledUnitError,
    },

    #[error("{0} is script source and source fallback is disabled")]
    SourceNotAllowed(PathBuf),
}

pub type ScriptResult<T> = Result<T, ScriptError>;
