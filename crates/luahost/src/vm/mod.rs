//! VM lifecycle.
//!
//! A [`Vm`] owns exactly one embedded Lua state. Every entry into the state
//! goes through one re-entrant lock, so a host thread and script callbacks
//! running on that thread may nest freely while other threads wait.
//!
//! State shared with script callbacks (settings, interrupt flag, GC pacer,
//! hot-load sets, binding registry) lives in [`VmShared`] behind an `Arc`.
//! Callbacks capture that `Arc`, never the `Vm`, so the Lua state never
//! keeps its owner alive.

mod builtins;
mod hooks;
mod loader;

use std::cell::RefCell;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mlua::{ffi, Function, IntoLua, Lua, StdLib, Value};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::alloc::{lua_alloc, AllocatorHook, OwnerScope, ProfilingAllocator, ScriptAllocator, SystemAllocator};
use crate::binding::{self, BindingKind, BindingRegistry, ScriptBinding, ScriptType};
use crate::call::{self, ErrorState, FunctionInterface, FunctionInvoker, InvokeTarget};
use crate::content::{FileSystemContent, ScriptContent};
use crate::data_node::DataNode;
use crate::error::{ScriptError, ScriptResult};
use crate::gc_pacer::GcPacer;
use crate::handle_table::{Handle, HandleTable};
use crate::hot_reload::HotLoadData;
use crate::marshal::{self, EnumDescriptor, MarshalOptions, ScriptEnum};
use crate::settings::VmSettings;

pub use hooks::{DebuggerAttachment, INTERRUPT_CHECK_INTERVAL};

pub type VmHandleTable = HandleTable<VmInner>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum VmLifecycle {
    Uninitialized = 0,
    Created = 1,
    Running = 2,
    Destroying = 3,
    Destroyed = 4,
}

impl VmLifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VmLifecycle::Uninitialized,
            1 => VmLifecycle::Created,
            2 => VmLifecycle::Running,
            3 => VmLifecycle::Destroying,
            _ => VmLifecycle::Destroyed,
        }
    }
}

/// Non-owning reference to a VM, resolved through its handle table.
#[derive(Clone)]
pub struct WeakVm {
    table: Arc<VmHandleTable>,
    handle: Handle,
}

impl WeakVm {
    pub fn upgrade(&self) -> Option<Vm> {
        self.table.resolve(self.handle).map(|inner| Vm { inner })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_alive(&self) -> bool {
        self.upgrade().is_some()
    }
}

impl std::fmt::Debug for WeakVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakVm").field(&self.handle).finish()
    }
}

/// State reachable from script callbacks without taking the VM lock.
pub(crate) struct VmShared {
    pub settings: VmSettings,
    pub weak: WeakVm,
    pub content: Arc<dyn ScriptContent>,
    pub profiler: Option<Arc<ProfilingAllocator>>,
    pub hot_load: HotLoadData,
    pub bindings: Mutex<BindingRegistry>,
    pub rng: Mutex<StdRng>,
    pub last_error: Arc<Mutex<Option<ErrorState>>>,
    pub progress_total: AtomicI64,
    pub progress_count: AtomicI64,
    gc: Mutex<GcPacer>,
    interrupted: AtomicBool,
    lifecycle: AtomicU8,
}

impl VmShared {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> VmLifecycle {
        VmLifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, state: VmLifecycle) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }

    pub fn mark_running(&self) {
        let _ = self.lifecycle.compare_exchange(
            VmLifecycle::Created as u8,
            VmLifecycle::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Attributes allocations to `name` until the scope drops. No-op without profiling.
    pub fn enter_owner(&self, name: &str) -> Option<OwnerScope<'_>> {
        self.profiler.as_ref().map(|p| p.enter_named(name))
    }

    /// Sends an error to the delegate. Suppressed once the VM is interrupted.
    pub fn report_error(&self, state: &ErrorState) {
        if self.is_interrupted() {
            return;
        }
        match &self.settings.error_handler {
            Some(handler) => handler(state),
            None => log::error!("[{}] {}", self.settings.name, state.traceback),
        }
    }

    pub fn output(&self, text: &str) {
        match &self.settings.standard_output {
            Some(out) => out(text),
            None => log::info!("[{}] {}", self.settings.name, text),
        }
    }
}

struct RawState(*mut ffi::lua_State);

// SAFETY: the state is only touched while holding the VM lock.
unsafe impl Send for RawState {}

struct Runtime {
    lua: Lua,
    stack: RefCell<Vec<Value>>,
    xpcall: Function,
    traceback: Function,
}

/// The live Lua state plus everything that must be dropped before it closes.
pub(crate) struct VmCore {
    rt: ManuallyDrop<Runtime>,
    state: RawState,
    _hook: Box<AllocatorHook>,
}

impl VmCore {
    fn create(allocator: Arc<dyn ScriptAllocator>, shared: &Arc<VmShared>) -> ScriptResult<Self> {
        let hook = AllocatorHook::new(allocator);
        // SAFETY: the hook is boxed and outlives the state (dropped after lua_close).
        let state = unsafe { ffi::lua_newstate(lua_alloc, hook.as_ud() as *mut c_void) };
        if state.is_null() {
            return Err(ScriptError::Lua(mlua::Error::MemoryError(
                "lua_newstate failed".to_string(),
            )));
        }
        // SAFETY: fresh state, nothing else references it yet.
        let lua = unsafe {
            ffi::lua_atpanic(state, hooks::on_panic);
            ffi::luaL_requiref(state, c"_G".as_ptr(), ffi::luaopen_base, 1);
            ffi::luaL_requiref(state, c"debug".as_ptr(), ffi::luaopen_debug, 1);
            ffi::lua_pop(state, 2);
            Lua::init_from_ptr(state)
        };

        match Self::configure(&lua, shared) {
            Ok((xpcall, traceback)) => Ok(Self {
                rt: ManuallyDrop::new(Runtime {
                    lua,
                    stack: RefCell::new(Vec::new()),
                    xpcall,
                    traceback,
                }),
                state: RawState(state),
                _hook: hook,
            }),
            Err(e) => {
                drop(lua);
                // SAFETY: every value created from the state has been dropped.
                unsafe { ffi::lua_close(state) };
                Err(e.into())
            }
        }
    }

    fn configure(lua: &Lua, shared: &Arc<VmShared>) -> mlua::Result<(Function, Function)> {
        lua.load_std_libs(
            StdLib::PACKAGE
                | StdLib::TABLE
                | StdLib::STRING
                | StdLib::MATH
                | StdLib::COROUTINE
                | StdLib::UTF8,
        )?;
        call::install_trampoline(lua)?;

        let weak_cache = lua.create_table()?;
        let mode = lua.create_table()?;
        mode.raw_set("__mode", "kv")?;
        weak_cache.set_metatable(Some(mode));
        lua.set_named_registry_value(binding::WEAK_CACHE_KEY, weak_cache)?;

        builtins::install(lua, shared)?;
        loader::install(lua, shared)?;
        hooks::install(lua, shared);

        let xpcall: Function = lua.globals().get("xpcall")?;
        let traceback = call::create_traceback_handler(lua, Arc::clone(&shared.last_error))?;
        Ok((xpcall, traceback))
    }

    pub fn lua(&self) -> &Lua {
        &self.rt.lua
    }

    pub fn stack(&self) -> &RefCell<Vec<Value>> {
        &self.rt.stack
    }

    pub fn xpcall(&self) -> &Function {
        &self.rt.xpcall
    }

    pub fn traceback(&self) -> &Function {
        &self.rt.traceback
    }

    /// Loads and runs `chunk` in protected mode.
    fn run_chunk(&self, shared: &VmShared, chunk: mlua::Result<Function>, name: &str) -> ScriptResult<()> {
        let function = match chunk {
            Ok(f) => f,
            Err(e) => {
                let message = call::error_reason(&e);
                shared.report_error(&ErrorState::from_reason(format!("{name}: {message}")));
                return Err(ScriptError::Load {
                    name: name.to_string(),
                    message,
                });
            }
        };

        shared.mark_running();
        let _owner = shared.enter_owner(name);
        match call::protected_call(
            self.xpcall(),
            self.traceback(),
            &shared.last_error,
            Value::Function(function),
            Vec::new(),
        ) {
            Ok(_) => Ok(()),
            Err(_) if shared.is_interrupted() => Err(ScriptError::Interrupted),
            Err(state) => {
                shared.report_error(&state);
                Err(ScriptError::Runtime {
                    reason: state.reason,
                    traceback: state.traceback,
                })
            }
        }
    }
}

impl Drop for VmCore {
    fn drop(&mut self) {
        // SAFETY: runtime values go first, then the state they point into.
        unsafe {
            ManuallyDrop::drop(&mut self.rt);
            ffi::lua_close(self.state.0);
        }
    }
}

pub(crate) struct VmCell {
    pub core: RefCell<Option<VmCore>>,
}

pub struct VmInner {
    shared: Arc<VmShared>,
    cell: ReentrantMutex<VmCell>,
    table: Arc<VmHandleTable>,
    handle: Handle,
}

impl VmInner {
    fn shutdown(&self) {
        let guard = self.cell.lock();
        let Ok(mut core) = guard.core.try_borrow_mut() else {
            log::warn!(
                "[{}] shutdown requested while the VM is executing; ignored",
                self.shared.settings.name
            );
            return;
        };
        if core.is_none() && self.shared.lifecycle() == VmLifecycle::Destroyed {
            return;
        }

        self.shared.set_lifecycle(VmLifecycle::Destroying);
        if let Some(debugger) = &self.shared.settings.debugger {
            debugger.on_vm_destroy(&self.shared.weak);
        }
        drop(core.take());
        self.shared.set_lifecycle(VmLifecycle::Destroyed);
        self.table.free(self.handle);
        log::debug!("[{}] VM destroyed", self.shared.settings.name);
    }
}

impl Drop for VmInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One embedded VM instance. Cloning shares the same instance.
#[derive(Clone)]
pub struct Vm {
    inner: Arc<VmInner>,
}

impl Vm {
    pub fn new(settings: VmSettings) -> ScriptResult<Vm> {
        let table = settings.handles.clone().unwrap_or_else(VmHandleTable::shared);
        let content: Arc<dyn ScriptContent> = match &settings.content {
            Some(content) => Arc::clone(content),
            None => Arc::new(FileSystemContent::new(settings.source_fallback_enabled())),
        };
        let base: Arc<dyn ScriptAllocator> = settings
            .custom_allocator
            .clone()
            .unwrap_or_else(|| Arc::new(SystemAllocator));
        let profiler = settings
            .enable_memory_profiling
            .then(|| Arc::new(ProfilingAllocator::new(Arc::clone(&base))));
        let allocator: Arc<dyn ScriptAllocator> = match &profiler {
            Some(p) => Arc::clone(p) as Arc<dyn ScriptAllocator>,
            None => base,
        };

        let inner = Arc::new_cyclic(|weak| {
            let handle = table.allocate(weak.clone()).unwrap_or(Handle::INVALID);
            let gc = GcPacer::new(
                settings.initial_gc_step_size,
                settings.min_gc_step_size,
                settings.max_gc_step_size,
                settings.target_incremental_gc_time_ms,
            );
            let hot_load = HotLoadData::new(settings.project_path.as_ref().and_then(|p| {
                settings.base_paths.first().map(|base| base.join(p))
            }));
            let shared = Arc::new(VmShared {
                weak: WeakVm {
                    table: Arc::clone(&table),
                    handle,
                },
                content,
                profiler,
                hot_load,
                bindings: Mutex::new(BindingRegistry::default()),
                rng: Mutex::new(StdRng::from_entropy()),
                last_error: Arc::new(Mutex::new(None)),
                progress_total: AtomicI64::new(0),
                progress_count: AtomicI64::new(0),
                gc: Mutex::new(gc),
                interrupted: AtomicBool::new(false),
                lifecycle: AtomicU8::new(VmLifecycle::Uninitialized as u8),
                settings,
            });
            VmInner {
                shared,
                cell: ReentrantMutex::new(VmCell {
                    core: RefCell::new(None),
                }),
                table: Arc::clone(&table),
                handle,
            }
        });

        let vm = Vm { inner };
        if !vm.inner.handle.is_valid() {
            return Err(ScriptError::HandleTableFull);
        }
        {
            let guard = vm.lock_cell();
            let core = VmCore::create(allocator, &vm.inner.shared)?;
            *guard.core.borrow_mut() = Some(core);
        }
        vm.inner.shared.set_lifecycle(VmLifecycle::Created);
        log::debug!("[{}] VM created", vm.name());
        Ok(vm)
    }

    pub(crate) fn lock_cell(&self) -> ReentrantMutexGuard<'_, VmCell> {
        self.inner.cell.lock()
    }

    pub(crate) fn shared(&self) -> &Arc<VmShared> {
        &self.inner.shared
    }

    /// Runs `f` with the Lua state under the VM lock.
    pub fn with_lua<R>(&self, f: impl FnOnce(&Lua) -> R) -> ScriptResult<R> {
        let guard = self.lock_cell();
        let core = guard.core.borrow();
        let core = core.as_ref().ok_or(ScriptError::Destroyed)?;
        Ok(f(core.lua()))
    }

    fn with_core<R>(&self, f: impl FnOnce(&VmCore) -> ScriptResult<R>) -> ScriptResult<R> {
        let guard = self.lock_cell();
        let core = guard.core.borrow();
        let core = core.as_ref().ok_or(ScriptError::Destroyed)?;
        f(core)
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.settings.name
    }

    pub fn settings(&self) -> &VmSettings {
        &self.inner.shared.settings
    }

    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    pub fn weak_handle(&self) -> WeakVm {
        self.inner.shared.weak.clone()
    }

    pub fn lifecycle(&self) -> VmLifecycle {
        self.inner.shared.lifecycle()
    }

    /// One-way. Running script is stopped at the next instruction-count check.
    pub fn interrupt(&self) {
        self.inner.shared.interrupted.store(true, Ordering::Release);
    }

    pub fn interrupted(&self) -> bool {
        self.inner.shared.is_interrupted()
    }

    pub fn progress_total(&self) -> i64 {
        self.inner.shared.progress_total.load(Ordering::Acquire)
    }

    pub fn progress_count(&self) -> i64 {
        self.inner.shared.progress_count.load(Ordering::Acquire)
    }

    pub fn hot_load(&self) -> &HotLoadData {
        &self.inner.shared.hot_load
    }

    /// Size of the host-visible value stack used by invokers.
    pub fn stack_depth(&self) -> usize {
        self.with_core(|core| Ok(core.stack().borrow().len()))
            .unwrap_or(0)
    }

    /// Exposes `f` to scripts as the global `name`.
    pub fn register_function<F>(&self, name: &str, f: F) -> ScriptResult<()>
    where
        F: Fn(&mut FunctionInterface<'_>) + Send + Sync + 'static,
    {
        self.with_core(|core| {
            let lua = core.lua();
            let function = call::create_native(lua, &self.inner.shared, name, f)?;
            lua.globals().set(name, function)?;
            Ok(())
        })
    }

    /// Makes `E` visible to `DescribeNativeEnum`.
    pub fn register_enum<E: ScriptEnum>(&self) {
        self.inner
            .shared
            .bindings
            .lock()
            .register_enum(EnumDescriptor::of::<E>());
    }

    pub fn bind_type<T: ScriptType>(&self, kind: BindingKind) -> ScriptResult<()> {
        self.with_core(|core| Ok(binding::bind_type_in::<T>(core.lua(), &self.inner.shared, kind)?))
    }

    /// Moves `value` into the VM. It is dropped when the VM collects it.
    pub fn bind_strong_instance<T: ScriptType>(&self, value: T) -> ScriptResult<ScriptBinding> {
        self.with_core(|core| {
            let lua = core.lua();
            let ud = binding::strong_userdata(lua, &self.inner.shared, value)?;
            Ok(ScriptBinding::from_value(lua, self.weak_handle(), Value::UserData(ud))?)
        })
    }

    /// Exposes a host-owned instance. The VM never extends its lifetime.
    pub fn bind_weak_instance<T: ScriptType>(&self, value: &Arc<T>) -> ScriptResult<ScriptBinding> {
        self.with_core(|core| {
            let lua = core.lua();
            let ud = binding::weak_userdata(lua, &self.inner.shared, value)?;
            Ok(ScriptBinding::from_value(lua, self.weak_handle(), Value::UserData(ud))?)
        })
    }

    /// Detaches a weak binding from its native instance. Returns false when
    /// `binding` is not a weak native view.
    pub fn set_weak_binding_to_nil(&self, binding: &ScriptBinding) -> bool {
        self.with_core(|core| {
            let Some(Value::UserData(ud)) = binding.value(core.lua()) else {
                return Ok(false);
            };
            let Some((name, BindingKind::Weak)) = binding::userdata_tag(&ud) else {
                return Ok(false);
            };
            let record = self.inner.shared.bindings.lock().find(&name, BindingKind::Weak);
            Ok(record.is_some_and(|r| (r.clear)(&ud)))
        })
        .unwrap_or(false)
    }

    /// Resolves `name` against the base paths. Appends `.lua` when missing and
    /// rejects parent-directory traversal.
    pub fn resolve_file_path_from_relative(&self, name: &str) -> Option<PathBuf> {
        loader::resolve_relative(&self.inner.shared, name).map(|(path, _)| path)
    }

    /// Runs the script at `relative`, reporting (not raising) script errors.
    pub fn run_script(&self, relative: &str) -> ScriptResult<()> {
        let shared = &self.inner.shared;
        if shared.is_interrupted() {
            return Err(ScriptError::Interrupted);
        }
        let (path, relative) = loader::resolve_relative(shared, relative)
            .ok_or_else(|| ScriptError::NotFound(relative.to_string()))?;
        shared.hot_load.record_script(&path);
        let unit = loader::load_content(shared, &path)?;
        let chunk_name = loader::chunk_name(&relative);

        self.with_core(|core| {
            let chunk = loader::load_unit(core.lua(), &unit, &chunk_name);
            core.run_chunk(shared, chunk, &chunk_name)
        })
    }

    pub fn run_code(&self, code: &str) -> ScriptResult<()> {
        let shared = &self.inner.shared;
        if shared.is_interrupted() {
            return Err(ScriptError::Interrupted);
        }
        self.with_core(|core| {
            let chunk = core
                .lua()
                .load(code)
                .set_name(loader::CODE_CHUNK_NAME)
                .into_function();
            core.run_chunk(shared, chunk, loader::CODE_CHUNK_NAME)
        })
    }

    /// Calls a global function. See [`FunctionInvoker`].
    pub fn invoker(&self, name: &str) -> ScriptResult<FunctionInvoker<'_>> {
        FunctionInvoker::new(self, InvokeTarget::Global(name))
    }

    /// Calls a bound function, or a member of a bound table or userdata.
    pub fn binding_invoker(
        &self,
        binding: &ScriptBinding,
        member: Option<&str>,
    ) -> ScriptResult<FunctionInvoker<'_>> {
        FunctionInvoker::new(self, InvokeTarget::Binding(binding, member))
    }

    pub fn get_global_binding(&self, name: &str) -> ScriptResult<ScriptBinding> {
        self.with_core(|core| {
            let lua = core.lua();
            let value: Value = lua.globals().get(name)?;
            Ok(ScriptBinding::from_value(lua, self.weak_handle(), value)?)
        })
    }

    pub fn set_global(&self, name: &str, value: impl IntoLua) -> ScriptResult<()> {
        self.with_core(|core| Ok(core.lua().globals().set(name, value)?))
    }

    pub fn set_global_data(&self, name: &str, node: &DataNode, options: MarshalOptions) -> ScriptResult<()> {
        self.with_core(|core| {
            let lua = core.lua();
            let value = marshal::data_node_to_value(lua, node, options)?;
            Ok(lua.globals().set(name, value)?)
        })
    }

    pub fn create_table_binding(&self) -> ScriptResult<ScriptBinding> {
        self.with_core(|core| {
            let lua = core.lua();
            let table = lua.create_table()?;
            Ok(ScriptBinding::from_value(lua, self.weak_handle(), Value::Table(table))?)
        })
    }

    /// Runs one incremental collection slice and adapts the slice size.
    pub fn step_garbage_collector(&self) -> ScriptResult<Duration> {
        self.with_core(|core| {
            let lua = core.lua();
            let mut pacer = self.inner.shared.gc.lock();
            let elapsed = pacer.run(|kbytes| {
                let kbytes = i32::try_from(kbytes).unwrap_or(i32::MAX);
                lua.gc_step_kbytes(kbytes).map(|_| ())
            })?;
            Ok(elapsed)
        })
    }

    pub fn gc_step_size(&self) -> u32 {
        self.inner.shared.gc.lock().step_size()
    }

    pub fn gc_full(&self) -> ScriptResult<()> {
        self.with_core(|core| Ok(core.lua().gc_collect()?))
    }

    pub fn used_memory(&self) -> usize {
        self.with_core(|core| Ok(core.lua().used_memory()))
            .unwrap_or(0)
    }

    /// Live bytes per allocation owner, largest first. Empty unless memory
    /// profiling is enabled.
    pub fn query_memory_profiling_data(&self) -> Vec<(String, i64)> {
        self.inner
            .shared
            .profiler
            .as_ref()
            .map(|p| p.report())
            .unwrap_or_default()
    }

    fn invoke_hook(&self, name: &str, args: Option<&DataNode>) -> ScriptResult<bool> {
        let mut invoker = match self.invoker(name) {
            Ok(invoker) => invoker,
            Err(ScriptError::NotCallable(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if let Some(node) = args {
            invoker.push_data_node(node, MarshalOptions::default());
        }
        invoker.try_invoke()?;
        Ok(true)
    }

    /// Calls the script's `OnHotload` hook. Returns false when it is not defined.
    pub fn on_hotload(&self) -> ScriptResult<bool> {
        self.invoke_hook("OnHotload", None)
    }

    pub fn post_hotload(&self) -> ScriptResult<bool> {
        self.invoke_hook("PostHotload", None)
    }

    pub fn restore_dynamic_game_state_data(&self, record: &DataNode) -> ScriptResult<bool> {
        self.invoke_hook("RestoreDynamicGameStateData", Some(record))
    }

    pub fn dispose(&self) -> ScriptResult<bool> {
        self.invoke_hook("Dispose", None)
    }

    /// Tears the VM down. Safe to call more than once.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("name", &self.name())
            .field("handle", &self.inner.handle)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
