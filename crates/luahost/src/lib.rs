// Embedded Lua VM runtime
// Handle table, native/script marshaling, call boundaries, allocator hooks,
// GC pacing, VM lifecycle and hot-reload tracking.

#[cfg(test)]
mod test;

pub mod alloc;
pub mod binding;
pub mod call;
pub mod compiled_unit;
pub mod content;
pub mod data_node;
pub mod error;
pub mod gc_pacer;
pub mod handle_table;
pub mod hot_reload;
pub mod marshal;
pub mod settings;
pub mod vm;

pub use binding::{BindingKind, ScriptBinding, ScriptType, TypeRegistrar};
pub use call::{ErrorState, FunctionInterface, FunctionInvoker};
pub use compiled_unit::CompiledScriptUnit;
pub use content::{FileSystemContent, MemoryContent, ScriptContent};
pub use data_node::DataNode;
pub use error::{ScriptError, ScriptResult};
pub use handle_table::{Handle, HandleTable};
pub use marshal::{MarshalOptions, ScriptEnum};
pub use settings::{BuildConfig, VmSettings};
pub use vm::{DebuggerAttachment, Vm, VmLifecycle, WeakVm};

/// Re-exported so debugger and host crates use the same VM binding.
pub use mlua;
