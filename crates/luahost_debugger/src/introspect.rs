// Reading and writing script variables while a VM is suspended.
//
// Everything here runs on the VM thread from inside the line hook. Locals
// and upvalues are reached through the `debug` library functions called
// directly from the hook, so level 1 of `debug.getlocal` is the suspended
// function (depth 0 on the wire).

use mlua::{Function, Lua, Table, Value};

use crate::breakpoints::Breakpoints;
use crate::protocol::{ClientTag, Message, SuspendReason, VariableInfo, VariableType};
use crate::session::token_file_id;

/// Frames reported with a BreakAt.
pub const MAX_STACK_LEVELS: usize = 32;
/// Variables reported for one frame.
pub const MAX_FRAME_VARIABLES: usize = 128;

const CLASS_NAME_KEY: &str = "m_sClassName";

/// Captured at break time so scripts that replace `debug` cannot hide
/// their frames.
pub struct DebugLib {
    getinfo: Function,
    getlocal: Function,
    setlocal: Function,
    getupvalue: Function,
    setupvalue: Function,
}

impl DebugLib {
    pub fn load(lua: &Lua) -> mlua::Result<Self> {
        let loaded: Table = lua.named_registry_value("_LOADED")?;
        let debug: Table = loaded.get("debug")?;
        Ok(Self {
            getinfo: debug.get("getinfo")?,
            getlocal: debug.get("getlocal")?,
            setlocal: debug.get("setlocal")?,
            getupvalue: debug.get("getupvalue")?,
            setupvalue: debug.get("setupvalue")?,
        })
    }

    fn function_at(&self, depth: u32) -> mlua::Result<Option<Function>> {
        let info: Option<Table> = self.getinfo.call((level(depth), "f"))?;
        match info {
            Some(info) => info.get("func"),
            None => Ok(None),
        }
    }

    fn local(&self, depth: u32, index: i64) -> mlua::Result<Option<(String, Value)>> {
        let (name, value): (Option<String>, Value) = self.getlocal.call((level(depth), index))?;
        Ok(name.map(|n| (n, value)))
    }

    fn upvalue(&self, func: &Function, index: i64) -> mlua::Result<Option<(String, Value)>> {
        let (name, value): (Option<String>, Value) = self.getupvalue.call((func, index))?;
        Ok(name.map(|n| (n, value)))
    }
}

fn level(depth: u32) -> i64 {
    i64::from(depth) + 1
}

/// Number of active frames below the hook.
pub fn stack_depth(lua: &Lua) -> usize {
    let mut depth = 0;
    while lua.inspect_stack(depth).is_some() {
        depth += 1;
    }
    depth
}

/// Token of the innermost frame.
pub fn current_token(lua: &Lua, breakpoints: &Breakpoints) -> u32 {
    match lua.inspect_stack(0) {
        Some(debug) => {
            let source = debug.source();
            breakpoints.token_for(source.source.as_deref(), debug.curr_line()).0
        }
        None => 0,
    }
}

pub fn break_at_message(lua: &Lua, breakpoints: &Breakpoints, reason: SuspendReason) -> Message {
    let mut message = Message::client(ClientTag::BreakAt);
    message.write_i32(reason as i32);
    for level in 0..MAX_STACK_LEVELS {
        let Some(debug) = lua.inspect_stack(level) else {
            break;
        };
        let names = debug.names();
        let source = debug.source();
        let function = names
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or("<anonymous>");
        let (token, file_name) = breakpoints.token_for(source.source.as_deref(), debug.curr_line());
        message.write_str(function).write_u32(token);
        // The server only looks for a name when the file id is 0.
        if token_file_id(token) == 0 {
            message.write_str(file_name.unwrap_or(""));
        }
    }
    message
}

pub fn frame_message(lib: &DebugLib, depth: u32) -> Message {
    let mut message = Message::client(ClientTag::Frame);
    message.write_u32(depth);
    match frame_variables(lib, depth) {
        Ok(vars) => {
            for var in &vars {
                message.write_variable(var);
            }
        }
        Err(e) => log::debug!("frame {depth} not readable: {e}"),
    }
    message
}

pub fn children_message(lua: &Lua, lib: &DebugLib, depth: u32, path: &str) -> Message {
    let mut message = Message::client(ClientTag::GetChildren);
    message.write_u32(depth).write_str(path);
    match children(lua, lib, depth, path) {
        Ok(vars) => {
            for var in &vars {
                message.write_variable(var);
            }
        }
        Err(e) => log::debug!("children of '{path}' not readable: {e}"),
    }
    message
}

pub fn set_variable_message(
    lua: &Lua,
    lib: &DebugLib,
    depth: u32,
    path: &str,
    kind: VariableType,
    value: &str,
) -> Message {
    let mut message = Message::client(ClientTag::SetVariable);
    message.write_u32(depth).write_str(path);
    let done = set_variable(lua, lib, depth, path, kind, value).unwrap_or_else(|e| {
        log::debug!("setting '{path}' failed: {e}");
        false
    });
    message.write_bool(done);
    message
}

/// Upvalues (functions skipped), then locals, then varargs.
pub fn frame_variables(lib: &DebugLib, depth: u32) -> mlua::Result<Vec<VariableInfo>> {
    let mut out = Vec::new();
    let Some(func) = lib.function_at(depth)? else {
        return Ok(out);
    };

    let mut index = 1;
    while let Some((name, value)) = lib.upvalue(&func, index)? {
        push_frame_var(&mut out, &name, &value, true, 0);
        index += 1;
    }

    index = 1;
    while let Some((name, value)) = lib.local(depth, index)? {
        push_frame_var(&mut out, &name, &value, false, 0);
        index += 1;
    }

    index = -1;
    while let Some((name, value)) = lib.local(depth, index)? {
        push_frame_var(&mut out, &name, &value, false, -index);
        index -= 1;
    }
    Ok(out)
}

fn push_frame_var(
    out: &mut Vec<VariableInfo>,
    name: &str,
    value: &Value,
    skip_functions: bool,
    vararg: i64,
) {
    if out.len() >= MAX_FRAME_VARIABLES || name.is_empty() {
        return;
    }
    if skip_functions && matches!(value, Value::Function(_)) {
        return;
    }
    let name = if name.starts_with('(') {
        // Temporaries are hidden; varargs get a stable name.
        if vararg == 0 || !name.contains("vararg") {
            return;
        }
        format!("vararg{vararg}")
    } else if name == "self" {
        "this".to_string()
    } else {
        name.to_string()
    };
    out.push(describe(name, value));
}

pub fn describe(name: String, value: &Value) -> VariableInfo {
    let mut extended_type = String::new();
    let (kind, text) = match value {
        Value::Nil => (VariableType::Nil, "null".to_string()),
        Value::Boolean(b) => (VariableType::Boolean, b.to_string()),
        Value::LightUserData(_) => (VariableType::LightUserData, "<lightuserdata>".to_string()),
        Value::Integer(i) => (VariableType::Number, itoa::Buffer::new().format(*i).to_string()),
        Value::Number(n) => (VariableType::Number, number_to_string(*n)),
        Value::String(s) => (VariableType::String, s.to_string_lossy().to_string()),
        Value::Table(t) => {
            if let Some(mt) = t.metatable() {
                if let Ok(Value::String(class)) = mt.raw_get::<Value>(CLASS_NAME_KEY) {
                    extended_type = class.to_string_lossy().to_string();
                }
            }
            if is_empty(t) {
                (VariableType::EmptyTable, "<empty-table>".to_string())
            } else {
                (VariableType::Table, "<table>".to_string())
            }
        }
        Value::Function(_) => (VariableType::Function, "<function>".to_string()),
        Value::Thread(_) => (VariableType::Thread, "<thread>".to_string()),
        _ => (VariableType::UserData, "<userdata>".to_string()),
    };
    VariableInfo {
        name,
        kind,
        extended_type,
        value: text,
    }
}

fn is_empty(t: &Table) -> bool {
    t.clone().pairs::<Value, Value>().next().is_none()
}

/// Lua's own rendering of a float: 14 significant digits, with `.0` kept
/// on integral values.
pub fn number_to_string(n: f64) -> String {
    let mut s = format_general(n, 14);
    if s.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        s.push_str(".0");
    }
    s
}

/// Table keys as the server displays them.
pub fn key_to_string(key: &Value) -> Option<String> {
    let s = match key {
        Value::Nil => return None,
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => itoa::Buffer::new().format(*i).to_string(),
        Value::Number(n) => format_general(*n, 6),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => format!("{:p}", other.to_pointer()),
    };
    (!s.is_empty()).then_some(s)
}

/// C `%.<precision>g`.
pub fn format_general(n: f64, precision: usize) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let precision = precision.max(1);
    let sci = format!("{:.*e}", precision - 1, n);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= precision as i32 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        trim_fraction(&format!("{n:.decimals$}")).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// First segment: last matching local, then last matching upvalue, then
/// the global.
fn resolve_root(lua: &Lua, lib: &DebugLib, depth: u32, name: &str) -> mlua::Result<Value> {
    let mut found = None;
    let mut index = 1;
    while let Some((local, value)) = lib.local(depth, index)? {
        if local == name {
            found = Some(value);
        }
        index += 1;
    }
    if let Some(value) = found {
        return Ok(value);
    }

    if let Some(func) = lib.function_at(depth)? {
        index = 1;
        while let Some((upvalue, value)) = lib.upvalue(&func, index)? {
            if upvalue == name {
                found = Some(value);
            }
            index += 1;
        }
    }
    match found {
        Some(value) => Ok(value),
        None => lua.globals().get(name),
    }
}

fn split_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        return Vec::new();
    }
    let mut parts: Vec<&str> = path.split('.').collect();
    if parts[0] == "this" {
        parts[0] = "self";
    }
    parts
}

/// The key a path segment addresses: the string key when the table has
/// it, otherwise the segment read as a number or boolean.
fn segment_key(lua: &Lua, table: &Table, segment: &str) -> mlua::Result<Value> {
    let key = Value::String(lua.create_string(segment)?);
    if !table.raw_get::<Value>(key.clone())?.is_nil() {
        return Ok(key);
    }
    if let Ok(n) = segment.parse::<f64>() {
        if n.is_finite() {
            return Ok(Value::Number(n));
        }
    }
    Ok(parse_bool(segment).map(Value::Boolean).unwrap_or(key))
}

fn lookup_segment(lua: &Lua, table: &Table, segment: &str) -> mlua::Result<Value> {
    let key = segment_key(lua, table, segment)?;
    table.get(key)
}

fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

pub fn children(lua: &Lua, lib: &DebugLib, depth: u32, path: &str) -> mlua::Result<Vec<VariableInfo>> {
    let parts = split_path(path);
    let Some((first, rest)) = parts.split_first() else {
        return Ok(Vec::new());
    };
    if lib.function_at(depth)?.is_none() {
        return Ok(Vec::new());
    }

    let mut value = resolve_root(lua, lib, depth, first)?;
    for segment in rest {
        let Value::Table(table) = value else {
            return Ok(Vec::new());
        };
        value = lookup_segment(lua, &table, segment)?;
    }
    let Value::Table(table) = value else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair?;
        if let Some(name) = key_to_string(&key) {
            out.push(describe(name, &value));
        }
    }
    Ok(out)
}

fn parse_value(lua: &Lua, kind: VariableType, text: &str) -> mlua::Result<Option<Value>> {
    Ok(match kind {
        VariableType::Boolean => parse_bool(text).map(Value::Boolean),
        VariableType::Number => text.trim().parse::<f64>().ok().map(Value::Number),
        VariableType::String => Some(Value::String(lua.create_string(text)?)),
        _ => None,
    })
}

pub fn set_variable(
    lua: &Lua,
    lib: &DebugLib,
    depth: u32,
    path: &str,
    kind: VariableType,
    text: &str,
) -> mlua::Result<bool> {
    let parts = split_path(path);
    let Some((last, init)) = parts.split_last() else {
        return Ok(false);
    };
    if lib.function_at(depth)?.is_none() {
        return Ok(false);
    }
    if init.is_empty() {
        return set_root(lua, lib, depth, last, kind, text);
    }

    let mut value = resolve_root(lua, lib, depth, init[0])?;
    for segment in &init[1..] {
        let Value::Table(table) = value else {
            return Ok(false);
        };
        value = lookup_segment(lua, &table, segment)?;
    }
    let Value::Table(table) = value else {
        return Ok(false);
    };
    let Some(new_value) = parse_value(lua, kind, text)? else {
        return Ok(false);
    };
    let key = segment_key(lua, &table, last)?;
    table.set(key, new_value)?;
    Ok(true)
}

fn set_root(
    lua: &Lua,
    lib: &DebugLib,
    depth: u32,
    name: &str,
    kind: VariableType,
    text: &str,
) -> mlua::Result<bool> {
    let mut found = None;
    let mut index = 1;
    while let Some((local, _)) = lib.local(depth, index)? {
        if local == name {
            found = Some(index);
        }
        index += 1;
    }
    if let Some(index) = found {
        let Some(value) = parse_value(lua, kind, text)? else {
            return Ok(false);
        };
        let set: Option<String> = lib.setlocal.call((level(depth), index, value))?;
        return Ok(set.is_some());
    }

    if let Some(func) = lib.function_at(depth)? {
        index = 1;
        while let Some((upvalue, _)) = lib.upvalue(&func, index)? {
            if upvalue == name {
                found = Some(index);
            }
            index += 1;
        }
        if let Some(index) = found {
            let Some(value) = parse_value(lua, kind, text)? else {
                return Ok(false);
            };
            let set: Option<String> = lib.setupvalue.call((func, index, value))?;
            return Ok(set.is_some());
        }
    }

    match parse_value(lua, kind, text)? {
        Some(value) => {
            lua.globals().set(name, value)?;
            Ok(true)
        }
        None => Ok(false),
    }
}
