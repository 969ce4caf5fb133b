// Outbound call boundary: the host calling into script
//
// An invoker owns the VM lock from construction to drop, so argument pushes,
// the call itself and result reads happen as one atomic unit with respect to
// other threads. Arguments and results live on the VM's host-visible value
// stack; dropping the invoker truncates that stack back to where it started.

use std::sync::Arc;

use mlua::{ObjectLike, Value};
use parking_lot::ReentrantMutexGuard;

use crate::binding::{self, ScriptBinding, ScriptType};
use crate::call::error_handler::protected_call;
use crate::data_node::DataNode;
use crate::error::{ScriptError, ScriptResult};
use crate::marshal::{
    self, array_index_from_number, array_index_to_number, MarshalOptions, ScriptEnum,
};
use crate::vm::{Vm, VmCell, VmCore};

/// What a `FunctionInvoker` calls.
#[derive(Clone, Copy)]
pub enum InvokeTarget<'b> {
    /// A global function.
    Global(&'b str),
    /// A pinned value, or one of its members. Calling a member passes the
    /// value itself as the first argument.
    Binding(&'b ScriptBinding, Option<&'b str>),
}

pub struct FunctionInvoker<'a> {
    vm: &'a Vm,
    guard: ReentrantMutexGuard<'a, VmCell>,
    name: String,
    top_start: usize,
    return_count: usize,
    pending: Option<ScriptError>,
}

impl<'a> FunctionInvoker<'a> {
    pub(crate) fn new(vm: &'a Vm, target: InvokeTarget<'_>) -> ScriptResult<Self> {
        let guard = vm.lock_cell();
        let (name, top_start) = {
            let core = guard.core.borrow();
            let core = core.as_ref().ok_or(ScriptError::Destroyed)?;
            let (name, callable, receiver) = resolve_target(core, target)?;

            let mut stack = core.stack().borrow_mut();
            let top_start = stack.len();
            stack.push(callable);
            if let Some(receiver) = receiver {
                stack.push(receiver);
            }
            (name, top_start)
        };

        Ok(Self {
            vm,
            guard,
            name,
            top_start,
            return_count: 0,
            pending: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn with_core<R>(&self, f: impl FnOnce(&VmCore) -> R) -> Option<R> {
        let core = self.guard.core.borrow();
        core.as_ref().map(f)
    }

    fn push_with(&mut self, make: impl FnOnce(&VmCore) -> ScriptResult<Value>) -> &mut Self {
        if self.pending.is_some() {
            return self;
        }
        let pushed = self.with_core(|core| {
            let value = make(core)?;
            core.stack().borrow_mut().push(value);
            Ok(())
        });
        match pushed {
            Some(Ok(())) => {}
            Some(Err(e)) => self.pending = Some(e),
            None => self.pending = Some(ScriptError::Destroyed),
        }
        self
    }

    pub fn push_value(&mut self, value: Value) -> &mut Self {
        self.push_with(|_| Ok(value))
    }

    pub fn push_nil(&mut self) -> &mut Self {
        self.push_value(Value::Nil)
    }

    pub fn push_boolean(&mut self, b: bool) -> &mut Self {
        self.push_value(Value::Boolean(b))
    }

    pub fn push_integer(&mut self, v: i32) -> &mut Self {
        self.push_value(Value::Integer(v as i64))
    }

    /// Values outside the exact integer range fail the call.
    pub fn push_i64(&mut self, v: i64) -> &mut Self {
        self.push_with(|_| Ok(Value::Integer(marshal::check_integer(v)?)))
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.push_value(Value::Integer(v as i64))
    }

    pub fn push_number(&mut self, v: f64) -> &mut Self {
        self.push_value(Value::Number(v))
    }

    pub fn push_f32(&mut self, v: f32) -> &mut Self {
        self.push_value(Value::Number(v as f64))
    }

    pub fn push_array_index(&mut self, index: u32) -> &mut Self {
        self.push_value(Value::Number(array_index_to_number(index)))
    }

    pub fn push_string(&mut self, s: &str) -> &mut Self {
        self.push_bytes(s.as_bytes())
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.push_with(|core| Ok(marshal::bytes_to_value(core.lua(), bytes)?))
    }

    pub fn push_enum<E: ScriptEnum>(&mut self, e: E, as_name: bool) -> &mut Self {
        self.push_with(|core| Ok(marshal::enum_to_value(core.lua(), e, as_name)?))
    }

    pub fn push_data_node(&mut self, node: &DataNode, options: MarshalOptions) -> &mut Self {
        self.push_with(|core| Ok(marshal::data_node_to_value(core.lua(), node, options)?))
    }

    pub fn push_binding(&mut self, b: &ScriptBinding) -> &mut Self {
        self.push_with(|core| Ok(b.value(core.lua()).unwrap_or(Value::Nil)))
    }

    pub fn push_user_data<T: ScriptType>(&mut self, value: T) -> &mut Self {
        let shared = Arc::clone(self.vm.shared());
        self.push_with(|core| Ok(Value::UserData(binding::strong_userdata(core.lua(), &shared, value)?)))
    }

    pub fn push_weak_user_data<T: ScriptType>(&mut self, value: &Arc<T>) -> &mut Self {
        let shared = Arc::clone(self.vm.shared());
        self.push_with(|core| Ok(Value::UserData(binding::weak_userdata(core.lua(), &shared, value)?)))
    }

    /// Runs the call. On success returns the number of results now readable
    /// through the `get_*` accessors.
    pub fn try_invoke(&mut self) -> ScriptResult<usize> {
        let shared = Arc::clone(self.vm.shared());
        if let Some(e) = self.pending.take() {
            self.truncate();
            return Err(e);
        }
        if shared.is_interrupted() {
            self.truncate();
            return Err(ScriptError::Interrupted);
        }

        let core = self.guard.core.borrow();
        let core = core.as_ref().ok_or(ScriptError::Destroyed)?;
        shared.mark_running();

        let mut items: Vec<Value> = core.stack().borrow_mut().drain(self.top_start..).collect();
        if items.is_empty() {
            return Err(ScriptError::NotCallable(self.name.clone()));
        }
        let callable = items.remove(0);

        let result = {
            let _owner = shared.enter_owner(&self.name);
            protected_call(core.xpcall(), core.traceback(), &shared.last_error, callable, items)
        };
        match result {
            Ok(results) => {
                self.return_count = results.len();
                core.stack().borrow_mut().extend(results);
                Ok(self.return_count)
            }
            Err(state) => {
                self.return_count = 0;
                if shared.is_interrupted() {
                    return Err(ScriptError::Interrupted);
                }
                shared.report_error(&state);
                Err(ScriptError::Runtime {
                    reason: state.reason,
                    traceback: state.traceback,
                })
            }
        }
    }

    pub fn return_count(&self) -> usize {
        self.return_count
    }

    pub fn get_value(&self, i: usize) -> Option<Value> {
        if i >= self.return_count {
            return None;
        }
        self.with_core(|core| core.stack().borrow().get(self.top_start + i).cloned())
            .flatten()
    }

    pub fn is_nil(&self, i: usize) -> bool {
        matches!(self.get_value(i), Some(Value::Nil))
    }

    pub fn get_boolean(&self, i: usize) -> Option<bool> {
        match self.get_value(i)? {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn get_number(&self, i: usize) -> Option<f64> {
        marshal::value_to_f64(&self.get_value(i)?)
    }

    pub fn get_i64(&self, i: usize) -> Option<i64> {
        marshal::value_to_i64(&self.get_value(i)?)
    }

    /// None when the value does not fit in an `i32`.
    pub fn get_integer(&self, i: usize) -> Option<i32> {
        self.get_i64(i).and_then(|v| i32::try_from(v).ok())
    }

    /// None for negative values and values above `u32::MAX`.
    pub fn get_u32(&self, i: usize) -> Option<u32> {
        self.get_i64(i).and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_array_index(&self, i: usize) -> Option<u32> {
        self.get_number(i).map(array_index_from_number)
    }

    pub fn get_string(&self, i: usize) -> Option<String> {
        match self.get_value(i)? {
            Value::String(s) => Some(String::from(&*s.to_str().ok()?)),
            Value::Integer(v) => Some(v.to_string()),
            Value::Number(v) => Some(v.to_string()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, i: usize) -> Option<Vec<u8>> {
        marshal::value_to_bytes(&self.get_value(i)?)
    }

    pub fn get_enum<E: ScriptEnum>(&self, i: usize) -> Option<E> {
        marshal::value_to_enum(&self.get_value(i)?)
    }

    pub fn get_table(&self, i: usize) -> Option<DataNode> {
        match self.get_value(i)? {
            Value::Table(t) => marshal::table_to_data_node(&t).ok(),
            _ => None,
        }
    }

    pub fn get_binding(&self, i: usize) -> Option<ScriptBinding> {
        let value = self.get_value(i)?;
        self.with_core(|core| ScriptBinding::from_value(core.lua(), self.vm.weak_handle(), value).ok())
            .flatten()
    }

    pub fn with_user_data<T: ScriptType, R>(&self, i: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        binding::with_native(&self.get_value(i)?, f)
    }

    fn truncate(&self) {
        let _ = self.with_core(|core| core.stack().borrow_mut().truncate(self.top_start));
    }
}

impl Drop for FunctionInvoker<'_> {
    fn drop(&mut self) {
        self.truncate();
    }
}

fn is_function(value: &Value) -> bool {
    matches!(value, Value::Function(_))
}

fn resolve_target(
    core: &VmCore,
    target: InvokeTarget<'_>,
) -> ScriptResult<(String, Value, Option<Value>)> {
    let lua = core.lua();
    match target {
        InvokeTarget::Global(name) => {
            let callable: Value = lua.globals().get(name)?;
            if !is_function(&callable) {
                return Err(ScriptError::NotCallable(name.to_string()));
            }
            Ok((name.to_string(), callable, None))
        }
        InvokeTarget::Binding(binding, None) => {
            let callable = binding
                .value(lua)
                .filter(is_function)
                .ok_or_else(|| ScriptError::NotCallable("<binding>".to_string()))?;
            Ok(("<binding>".to_string(), callable, None))
        }
        InvokeTarget::Binding(binding, Some(member)) => {
            let receiver = binding
                .value(lua)
                .ok_or_else(|| ScriptError::NotCallable(member.to_string()))?;
            let callable: Value = match &receiver {
                Value::Table(t) => t.get(member)?,
                Value::UserData(ud) => ud.get(member)?,
                _ => Value::Nil,
            };
            if !is_function(&callable) {
                return Err(ScriptError::NotCallable(member.to_string()));
            }
            Ok((member.to_string(), callable, Some(receiver)))
        }
    }
}
