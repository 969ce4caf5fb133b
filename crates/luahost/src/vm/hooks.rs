// Instruction-count and line hooks.
//
// The count hook is always installed so an interrupt reaches running script
// even in tight loops. Line events are only requested while a debugger is
// attached, since they fire on every executed line. Call and return events
// are only requested with memory profiling, to keep the allocation owner on
// the running script function.

use std::ffi::{c_int, CStr};
use std::sync::Arc;

use mlua::{ffi, DebugEvent, HookTriggers, Lua};

use super::{VmShared, WeakVm};
use crate::alloc::{script_owner_name, ProfilingAllocator};

/// Instructions executed between interrupt checks.
pub const INTERRUPT_CHECK_INTERVAL: u32 = 1000;

/// A debugger driving a VM through its line hook.
pub trait DebuggerAttachment: Send + Sync {
    /// Called on every new line while hooks are enabled. Blocking here
    /// suspends the script. An error aborts the running script.
    fn on_step(&self, vm: &WeakVm, lua: &Lua, debug: &mlua::Debug<'_>) -> mlua::Result<()>;

    /// The VM is about to close its state.
    fn on_vm_destroy(&self, vm: &WeakVm);
}

pub(super) fn install(lua: &Lua, shared: &Arc<VmShared>) {
    let debugger = shared
        .settings
        .debugger
        .clone()
        .filter(|_| shared.settings.enable_debugger_hooks);
    let profiling = shared.profiler.is_some();
    let triggers = HookTriggers {
        on_calls: profiling,
        on_returns: profiling,
        every_line: debugger.is_some(),
        every_nth_instruction: Some(INTERRUPT_CHECK_INTERVAL),
        ..Default::default()
    };

    let weak = Arc::downgrade(shared);
    lua.set_hook(triggers, move |lua, debug| {
        let Some(shared) = weak.upgrade() else {
            return Ok(mlua::VmState::Continue);
        };
        if shared.is_interrupted() {
            return Err(mlua::Error::runtime("interrupted"));
        }
        match (debug.event(), &shared.profiler) {
            (DebugEvent::Line, _) => {
                if let Some(debugger) = &debugger {
                    debugger.on_step(&shared.weak, lua, &debug)?;
                }
            }
            (DebugEvent::Call | DebugEvent::TailCall, Some(profiler)) => {
                // Native callees keep charging their script caller.
                charge_frame(profiler, &debug);
            }
            (DebugEvent::Ret, Some(profiler)) => {
                // Level 0 is still the returning function.
                let mut level = 1;
                loop {
                    let Some(frame) = lua.inspect_stack(level) else {
                        profiler.set_script_owner(None);
                        break;
                    };
                    if charge_frame(profiler, &frame) {
                        break;
                    }
                    level += 1;
                }
            }
            _ => {}
        }
        Ok(mlua::VmState::Continue)
    });
}

/// Makes the frame's function the allocation owner. False for native frames.
fn charge_frame(profiler: &ProfilingAllocator, frame: &mlua::Debug<'_>) -> bool {
    let source = frame.source();
    if source.what == "C" {
        return false;
    }
    let Some(chunk) = source.source.as_deref() else {
        return false;
    };
    let owner = profiler.intern(&script_owner_name(chunk, source.what, source.line_defined));
    profiler.set_script_owner(Some(owner));
    true
}

/// Unprotected VM errors are unrecoverable. Log and abort rather than let
/// the VM longjmp out of the host.
pub(super) unsafe extern "C-unwind" fn on_panic(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: the VM calls this with the error object on top of the stack.
    let message = unsafe {
        let ptr = ffi::lua_tolstring(state, -1, std::ptr::null_mut());
        if ptr.is_null() {
            "<non-string error>".to_string()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    };
    log::error!("unprotected error in VM: {message}");
    std::process::abort()
}
