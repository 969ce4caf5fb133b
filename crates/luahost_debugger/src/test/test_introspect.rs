use std::sync::Arc;

use mlua::{HookTriggers, Lua, Value, VmState};
use parking_lot::Mutex;

use crate::breakpoints::Breakpoints;
use crate::introspect::*;
use crate::protocol::{SuspendReason, VariableInfo, VariableType};
use crate::session::pack_token;

const FIXTURE: &str = r#"
local counter = 10
local function helper() return counter end
local player = setmetatable({ name = "p1", hp = 3.5, [1] = "first", [true] = "yes", inner = { x = 1 } }, { m_sClassName = "Player" })
local empty = {}
local function inspected(self, ...)
  local shadow = 1
  local shadow = 2
  return helper() + shadow
end
result = inspected(player, "va", 42)
"#;

const FIXTURE_LINE: i32 = 9;

/// Runs `FIXTURE` and calls `f` from the line hook the first time line
/// `FIXTURE_LINE` is reached.
fn at_fixture_line<T: Send + 'static>(f: impl Fn(&Lua) -> T + Send + 'static) -> (Lua, T) {
    // The debug library is only available outside the safe subset.
    let lua = unsafe { Lua::unsafe_new() };
    let out = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&out);
    lua.set_hook(HookTriggers::EVERY_LINE, move |lua, debug| {
        let mut slot = slot.lock();
        if debug.curr_line() == FIXTURE_LINE && slot.is_none() {
            *slot = Some(f(lua));
        }
        Ok(VmState::Continue)
    });
    lua.load(FIXTURE).set_name("@scripts/fixture.lua").exec().unwrap();
    lua.remove_hook();
    let value = out.lock().take().expect("fixture line reached");
    (lua, value)
}

fn by_name(mut vars: Vec<VariableInfo>) -> Vec<(String, VariableType, String)> {
    vars.sort_by(|a, b| a.name.cmp(&b.name));
    vars.into_iter().map(|v| (v.name, v.kind, v.value)).collect()
}

#[test]
fn test_frame_variables() {
    let (_, vars) = at_fixture_line(|lua| {
        let lib = DebugLib::load(lua).unwrap();
        frame_variables(&lib, 0).unwrap()
    });
    let names: Vec<&str> = vars.iter().map(|v| v.name.as_str()).collect();
    // The `helper` upvalue is a function and is left out.
    assert_eq!(names, vec!["this", "shadow", "shadow", "vararg1", "vararg2"]);
    assert_eq!(vars[0].kind, VariableType::Table);
    assert_eq!(vars[0].extended_type, "Player");
    assert_eq!(vars[2].value, "2");
    assert_eq!(vars[3].kind, VariableType::String);
    assert_eq!(vars[3].value, "va");
    assert_eq!(vars[4].kind, VariableType::Number);
    assert_eq!(vars[4].value, "42");
}

#[test]
fn test_caller_frame() {
    let (_, (vars, depth)) = at_fixture_line(|lua| {
        let lib = DebugLib::load(lua).unwrap();
        (frame_variables(&lib, 1).unwrap(), stack_depth(lua))
    });
    assert!(depth >= 2);
    let empty = vars.iter().find(|v| v.name == "empty").unwrap();
    assert_eq!(empty.kind, VariableType::EmptyTable);
    assert_eq!(empty.value, "<empty-table>");
    let counter = vars.iter().find(|v| v.name == "counter").unwrap();
    assert_eq!(counter.value, "10");
    assert!(vars.iter().any(|v| v.name == "_ENV" && v.kind == VariableType::Table));
    // Locals of the main chunk include functions.
    assert!(vars.iter().any(|v| v.name == "inspected" && v.kind == VariableType::Function));
}

#[test]
fn test_out_of_range_frame() {
    let (_, vars) = at_fixture_line(|lua| {
        let lib = DebugLib::load(lua).unwrap();
        frame_variables(&lib, 50).unwrap()
    });
    assert!(vars.is_empty());
}

#[test]
fn test_children() {
    let (_, (this, inner, missing, scalar)) = at_fixture_line(|lua| {
        let lib = DebugLib::load(lua).unwrap();
        (
            children(lua, &lib, 0, "this").unwrap(),
            children(lua, &lib, 0, "this.inner").unwrap(),
            children(lua, &lib, 0, "nothing.here").unwrap(),
            children(lua, &lib, 0, "this.1").unwrap(),
        )
    });
    assert_eq!(
        by_name(this),
        vec![
            ("1".to_string(), VariableType::String, "first".to_string()),
            ("hp".to_string(), VariableType::Number, "3.5".to_string()),
            ("inner".to_string(), VariableType::Table, "<table>".to_string()),
            ("name".to_string(), VariableType::String, "p1".to_string()),
            ("true".to_string(), VariableType::String, "yes".to_string()),
        ]
    );
    assert_eq!(
        by_name(inner),
        vec![("x".to_string(), VariableType::Number, "1".to_string())]
    );
    assert!(missing.is_empty());
    assert!(scalar.is_empty());
}

#[test]
fn test_set_variable() {
    let (lua, results) = at_fixture_line(|lua| {
        let lib = DebugLib::load(lua).unwrap();
        vec![
            set_variable(lua, &lib, 0, "shadow", VariableType::Number, "5").unwrap(),
            set_variable(lua, &lib, 0, "this.hp", VariableType::Number, "7").unwrap(),
            set_variable(lua, &lib, 0, "fresh", VariableType::String, "hi").unwrap(),
            set_variable(lua, &lib, 0, "this.name", VariableType::Boolean, "maybe").unwrap(),
            set_variable(lua, &lib, 0, "", VariableType::Number, "1").unwrap(),
        ]
    });
    assert_eq!(results, vec![true, true, true, false, false]);

    // The last `shadow` local was the one written.
    let globals = lua.globals();
    assert_eq!(globals.get::<f64>("result").unwrap(), 15.0);
    assert_eq!(globals.get::<String>("fresh").unwrap(), "hi");
}

#[test]
fn test_break_at_message() {
    let (_, message) = at_fixture_line(|lua| {
        let mut breakpoints = Breakpoints::new();
        breakpoints.set_file("scripts/other".to_string(), 3);
        break_at_message(lua, &breakpoints, SuspendReason::Breakpoint)
    });
    let mut reader = message.reader();
    assert_eq!(reader.read_i32().unwrap(), SuspendReason::Breakpoint as i32);
    assert_eq!(reader.read_string().unwrap(), "inspected");
    assert_eq!(reader.read_u32().unwrap(), pack_token(FIXTURE_LINE as u16, 0));
    assert_eq!(reader.read_string().unwrap(), "scripts/fixture");
    // The main chunk follows.
    assert!(reader.has_data());
}

#[test]
fn test_number_formatting() {
    assert_eq!(number_to_string(3.0), "3.0");
    assert_eq!(number_to_string(-0.0), "-0.0");
    assert_eq!(number_to_string(0.1), "0.1");
    assert_eq!(number_to_string(1e20), "1e+20");
    assert_eq!(number_to_string(f64::INFINITY), "inf");
    assert_eq!(format_general(123456789.0, 6), "1.23457e+08");
    assert_eq!(format_general(0.0001, 6), "0.0001");
    assert_eq!(format_general(0.00001, 6), "1e-05");
    assert_eq!(format_general(2.5, 6), "2.5");
}

#[test]
fn test_key_formatting() {
    assert_eq!(key_to_string(&Value::Integer(12)).as_deref(), Some("12"));
    assert_eq!(key_to_string(&Value::Number(2.5)).as_deref(), Some("2.5"));
    assert_eq!(key_to_string(&Value::Boolean(false)).as_deref(), Some("false"));
    assert_eq!(key_to_string(&Value::Nil), None);
}

#[test]
fn test_set_variable_numeric_segments() {
    let (lua, (inner, results)) = at_fixture_line(|lua| {
        lua.load("nested = { { x = 1 }, label = 'l' }").exec().unwrap();
        let lib = DebugLib::load(lua).unwrap();
        let results = vec![
            set_variable(lua, &lib, 0, "nested.1.x", VariableType::Number, "7").unwrap(),
            set_variable(lua, &lib, 0, "nested.label", VariableType::String, "m").unwrap(),
        ];
        let inner = children(lua, &lib, 0, "nested.1").unwrap();
        let replaced = set_variable(lua, &lib, 0, "nested.1", VariableType::String, "changed").unwrap();
        (inner, results.into_iter().chain([replaced]).collect::<Vec<_>>())
    });
    assert_eq!(results, vec![true, true, true]);
    assert_eq!(
        by_name(inner),
        vec![("x".to_string(), VariableType::Number, "7.0".to_string())]
    );

    let (slot, string_slot, label): (String, Value, String) = lua
        .load("return type(nested[1]) == 'string' and nested[1] or '', nested['1'], nested.label")
        .eval()
        .unwrap();
    assert_eq!(slot, "changed");
    assert!(string_slot.is_nil());
    assert_eq!(label, "m");
}
