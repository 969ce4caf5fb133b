//! Inbound call boundary: a host function invoked from script.
//!
//! Host functions never raise VM errors themselves. They record a failure
//! with [`FunctionInterface::raise_error`] and return normally; the
//! registration wrapper turns the recorded failure into a script error after
//! the host function has finished and all of its native state is dropped.
//!
//! Argument indices are zero-based on the host side. A raised error naming
//! argument `i` is reported to script as `bad argument #(i + 1)`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use mlua::{Function, Lua, Value, Variadic};

use crate::binding::{self, ScriptBinding, ScriptType};
use crate::data_node::DataNode;
use crate::marshal::{
    self, array_index_from_number, array_index_to_number, MarshalOptions, ScriptEnum,
};
use crate::vm::{Vm, VmShared};

pub(crate) const TRAMPOLINE_KEY: &str = "luahost.trampoline";

// Natives return `(true, ...)` or `(false, message)`. The trampoline raises the
// message as a plain string error located at the script call site.
const TRAMPOLINE_SOURCE: &str = r#"
local error = error
return function(native)
  local function finish(ok, ...)
    if ok then return ... end
    error((...), 2)
  end
  return function(...) return finish(native(...)) end
end
"#;

pub(crate) fn install_trampoline(lua: &Lua) -> mlua::Result<()> {
    let factory: Function = lua.load(TRAMPOLINE_SOURCE).set_name("=[native]").eval()?;
    lua.set_named_registry_value(TRAMPOLINE_KEY, factory)
}

/// Wraps `body` as a script-callable function named `name`.
pub(crate) fn create_native<F>(
    lua: &Lua,
    shared: &Arc<VmShared>,
    name: impl Into<String>,
    body: F,
) -> mlua::Result<Function>
where
    F: Fn(&mut FunctionInterface<'_>) + Send + Sync + 'static,
{
    let name: String = name.into();
    let owner = shared.profiler.as_ref().map(|p| p.intern(&name));
    let shared = Arc::clone(shared);
    let raw = lua.create_function(move |lua, mut args: Variadic<Value>| {
        if shared.is_interrupted() {
            return failure(lua, "interrupted");
        }
        let _owner = match (&shared.profiler, owner) {
            (Some(profiler), Some(id)) => Some(profiler.enter(id)),
            _ => None,
        };

        let mut fi = FunctionInterface::new(lua, &shared, &name, std::mem::take(&mut *args));
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(&mut fi))) {
            let message = panic_message(payload.as_ref());
            log::error!("native function '{name}' panicked: {message}");
            fi.raise_error(-1, format!("native function '{name}' panicked: {message}"));
        }
        fi.into_results()
    })?;

    let wrap: Function = lua.named_registry_value(TRAMPOLINE_KEY)?;
    wrap.call(raw)
}

fn failure(lua: &Lua, message: &str) -> mlua::Result<Variadic<Value>> {
    Ok(Variadic::from_iter([
        Value::Boolean(false),
        Value::String(lua.create_string(message)?),
    ]))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct FunctionInterface<'a> {
    lua: &'a Lua,
    shared: &'a Arc<VmShared>,
    name: &'a str,
    args: Vec<Value>,
    returns: Vec<Value>,
    invalid_argument: i32,
    error: Option<String>,
}

impl<'a> FunctionInterface<'a> {
    pub(crate) fn new(
        lua: &'a Lua,
        shared: &'a Arc<VmShared>,
        name: &'a str,
        args: Vec<Value>,
    ) -> Self {
        Self {
            lua,
            shared,
            name,
            args,
            returns: Vec::new(),
            invalid_argument: 0,
            error: None,
        }
    }

    pub fn lua(&self) -> &'a Lua {
        self.lua
    }

    pub(crate) fn shared(&self) -> &'a Arc<VmShared> {
        self.shared
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// The VM this call is running in, if it is still alive.
    pub fn vm(&self) -> Option<Vm> {
        self.shared.weak.upgrade()
    }

    pub fn argument_count(&self) -> usize {
        self.args.len()
    }

    pub fn get_value(&self, i: usize) -> Option<&Value> {
        self.args.get(i)
    }

    /// Removes and returns the receiver of a method call.
    pub(crate) fn take_self(&mut self) -> Value {
        if self.args.is_empty() {
            Value::Nil
        } else {
            self.args.remove(0)
        }
    }

    pub fn is_none(&self, i: usize) -> bool {
        i >= self.args.len()
    }

    /// True only when argument `i` was passed and is nil.
    pub fn is_nil(&self, i: usize) -> bool {
        matches!(self.args.get(i), Some(Value::Nil))
    }

    pub fn is_nil_or_none(&self, i: usize) -> bool {
        matches!(self.args.get(i), None | Some(Value::Nil))
    }

    pub fn is_boolean(&self, i: usize) -> bool {
        matches!(self.args.get(i), Some(Value::Boolean(_)))
    }

    pub fn is_number(&self, i: usize) -> bool {
        self.get_number(i).is_some()
    }

    pub fn is_string(&self, i: usize) -> bool {
        matches!(
            self.args.get(i),
            Some(Value::String(_) | Value::Integer(_) | Value::Number(_))
        )
    }

    pub fn is_table(&self, i: usize) -> bool {
        matches!(self.args.get(i), Some(Value::Table(_)))
    }

    pub fn is_function(&self, i: usize) -> bool {
        matches!(self.args.get(i), Some(Value::Function(_)))
    }

    pub fn is_user_data<T: ScriptType>(&self, i: usize) -> bool {
        self.with_user_data::<T, ()>(i, |_| ()).is_some()
    }

    pub fn get_boolean(&self, i: usize) -> Option<bool> {
        match self.args.get(i)? {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Any VM-numeric value, including numeric strings.
    pub fn get_number(&self, i: usize) -> Option<f64> {
        let value = self.args.get(i)?;
        marshal::value_to_f64(value).or_else(|| {
            self.lua
                .coerce_number(value.clone())
                .ok()
                .flatten()
        })
    }

    pub fn get_f32(&self, i: usize) -> Option<f32> {
        self.get_number(i).map(|f| f as f32)
    }

    pub fn get_i64(&self, i: usize) -> Option<i64> {
        match self.args.get(i)? {
            Value::Integer(v) => Some(*v),
            _ => self.get_number(i).filter(|f| f.is_finite()).map(|f| f as i64),
        }
    }

    /// None when the value does not fit in an `i32`.
    pub fn get_integer(&self, i: usize) -> Option<i32> {
        self.get_i64(i).and_then(|v| i32::try_from(v).ok())
    }

    /// None for negative values and values above `u32::MAX`.
    pub fn get_u32(&self, i: usize) -> Option<u32> {
        self.get_i64(i).and_then(|v| u32::try_from(v).ok())
    }

    /// Strings, or numbers converted to their string form.
    pub fn get_string(&self, i: usize) -> Option<String> {
        match self.args.get(i)? {
            Value::String(s) => Some(String::from(&*s.to_str().ok()?)),
            v @ (Value::Integer(_) | Value::Number(_)) => {
                let s = self.lua.coerce_string(v.clone()).ok()??;
                Some(String::from(&*s.to_str().ok()?))
            }
            _ => None,
        }
    }

    pub fn get_bytes(&self, i: usize) -> Option<Vec<u8>> {
        marshal::value_to_bytes(self.args.get(i)?)
    }

    pub fn get_enum<E: ScriptEnum>(&self, i: usize) -> Option<E> {
        marshal::value_to_enum(self.args.get(i)?)
    }

    pub fn get_table(&self, i: usize) -> Option<DataNode> {
        match self.args.get(i)? {
            Value::Table(t) => marshal::table_to_data_node(t).ok(),
            _ => None,
        }
    }

    pub fn get_array_index(&self, i: usize) -> Option<u32> {
        self.get_number(i).map(array_index_from_number)
    }

    /// Runs `f` against the native object behind argument `i`. Fails on a type
    /// mismatch or a cleared weak binding.
    pub fn with_user_data<T: ScriptType, R>(&self, i: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        binding::with_native(self.args.get(i)?, f)
    }

    /// Pins a table, function or userdata argument.
    pub fn get_binding(&self, i: usize) -> Option<ScriptBinding> {
        let value = self.args.get(i)?;
        match value {
            Value::Table(_) | Value::Function(_) | Value::UserData(_) => {
                ScriptBinding::from_value(self.lua, self.shared.weak.clone(), value.clone()).ok()
            }
            _ => None,
        }
    }

    pub fn get_function(&self, i: usize) -> Option<ScriptBinding> {
        if self.is_function(i) {
            self.get_binding(i)
        } else {
            None
        }
    }

    pub fn push_return_value(&mut self, value: Value) {
        self.returns.push(value);
    }

    pub fn push_return_nil(&mut self) {
        self.returns.push(Value::Nil);
    }

    pub fn push_return_boolean(&mut self, b: bool) {
        self.returns.push(Value::Boolean(b));
    }

    pub fn push_return_integer(&mut self, v: i32) {
        self.returns.push(Value::Integer(v as i64));
    }

    pub fn push_return_i64(&mut self, v: i64) {
        self.returns.push(Value::Integer(v));
    }

    pub fn push_return_u32(&mut self, v: u32) {
        self.returns.push(Value::Integer(v as i64));
    }

    pub fn push_return_number(&mut self, v: f64) {
        self.returns.push(Value::Number(v));
    }

    pub fn push_return_f32(&mut self, v: f32) {
        self.returns.push(Value::Number(v as f64));
    }

    pub fn push_return_array_index(&mut self, index: u32) {
        self.returns.push(Value::Number(array_index_to_number(index)));
    }

    pub fn push_return_string(&mut self, s: &str) {
        self.push_return_bytes(s.as_bytes());
    }

    pub fn push_return_bytes(&mut self, bytes: &[u8]) {
        match self.lua.create_string(bytes) {
            Ok(s) => self.returns.push(Value::String(s)),
            Err(e) => self.raise_error(-1, e.to_string()),
        }
    }

    pub fn push_return_enum<E: ScriptEnum>(&mut self, e: E, as_name: bool) {
        match marshal::enum_to_value(self.lua, e, as_name) {
            Ok(v) => self.returns.push(v),
            Err(e) => self.raise_error(-1, e.to_string()),
        }
    }

    pub fn push_return_data_node(&mut self, node: &DataNode, options: MarshalOptions) {
        match marshal::data_node_to_value(self.lua, node, options) {
            Ok(v) => self.returns.push(v),
            Err(e) => self.raise_error(-1, e.to_string()),
        }
    }

    pub fn push_return_binding(&mut self, binding: &ScriptBinding) {
        let value = binding.value(self.lua).unwrap_or(Value::Nil);
        self.returns.push(value);
    }

    /// Returns a new VM-owned instance of `T`.
    pub fn push_return_user_data<T: ScriptType>(&mut self, value: T) {
        match binding::strong_userdata(self.lua, self.shared, value) {
            Ok(ud) => self.returns.push(Value::UserData(ud)),
            Err(e) => self.raise_error(-1, e.to_string()),
        }
    }

    /// Returns a view of a native-owned instance.
    pub fn push_return_weak_user_data<T: ScriptType>(&mut self, value: &Arc<T>) {
        match binding::weak_userdata(self.lua, self.shared, value) {
            Ok(ud) => self.returns.push(Value::UserData(ud)),
            Err(e) => self.raise_error(-1, e.to_string()),
        }
    }

    pub fn return_count(&self) -> usize {
        self.returns.len()
    }

    /// Records a failure. `arg` is the zero-based argument at fault, or a
    /// negative value when no single argument is to blame.
    pub fn raise_error(&mut self, arg: i32, message: impl Into<String>) {
        self.invalid_argument = arg.saturating_add(1).max(0);
        self.error = Some(message.into());
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Zero-based index of the argument named by the last raised error, or -1.
    pub fn invalid_argument(&self) -> i32 {
        if self.invalid_argument == 0 {
            -1
        } else {
            self.invalid_argument - 1
        }
    }

    pub fn error_message(&self) -> Option<String> {
        let message = self.error.as_ref()?;
        Some(if self.invalid_argument > 0 {
            format!(
                "bad argument #{} to '{}' ({})",
                self.invalid_argument, self.name, message
            )
        } else {
            message.clone()
        })
    }

    pub(crate) fn output(&self, line: &str) {
        self.shared.output(line);
    }

    fn into_results(self) -> mlua::Result<Variadic<Value>> {
        if let Some(message) = self.error_message() {
            return failure(self.lua, &message);
        }
        let mut out = Vec::with_capacity(self.returns.len() + 1);
        out.push(Value::Boolean(true));
        out.extend(self.returns);
        Ok(Variadic::from_iter(out))
    }
}
