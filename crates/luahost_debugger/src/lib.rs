// Wire debugger client for luahost VMs
// Frame codec, per-VM step tracking, breakpoint table, variable
// introspection and the background network threads.

#[cfg(test)]
mod test;

pub mod breakpoints;
pub mod client;
pub mod introspect;
pub mod protocol;
pub mod session;
pub mod signal;

pub use breakpoints::Breakpoints;
pub use client::DebuggerClient;
pub use protocol::{
    ClientTag, Message, ProtocolError, ServerTag, SuspendReason, VariableInfo, VariableType,
    CONNECT_MAGIC, DEBUGGER_PORT, PROTOCOL_VERSION,
};
pub use session::{ExecuteState, StepTracker};
