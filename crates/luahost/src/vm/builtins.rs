// Globals installed into every VM.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use mlua::{Lua, Table, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::binding::{self, BindingKind};
use crate::call::{create_native, FunctionInterface};
use crate::settings::BuildConfig;

use super::VmShared;

pub(super) fn install(lua: &Lua, shared: &Arc<VmShared>) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set("print", create_native(lua, shared, "print", print)?)?;

    let math: Table = globals.get("math")?;
    math.set("random", create_native(lua, shared, "random", random)?)?;
    math.set("randomseed", create_native(lua, shared, "randomseed", random_seed)?)?;

    globals.set("CreateTable", create_native(lua, shared, "CreateTable", create_table)?)?;
    globals.set(
        "__initprogresssteps__",
        create_native(lua, shared, "__initprogresssteps__", init_progress_steps)?,
    )?;
    globals.set(
        "__oninitprogress__",
        create_native(lua, shared, "__oninitprogress__", |fi| {
            fi.shared().progress_count.fetch_add(1, Ordering::AcqRel);
        })?,
    )?;
    globals.set("IsNativeValid", create_native(lua, shared, "IsNativeValid", is_native_valid)?)?;
    globals.set(
        "DescribeNativeEnum",
        create_native(lua, shared, "DescribeNativeEnum", describe_native_enum)?,
    )?;
    globals.set(
        "HasNativeUserData",
        create_native(lua, shared, "HasNativeUserData", |fi| {
            let name = fi.get_string(0).unwrap_or_default();
            let known = fi.shared().bindings.lock().has_name(&name);
            fi.push_return_boolean(known);
        })?,
    )?;
    globals.set(
        "NewNativeUserData",
        create_native(lua, shared, "NewNativeUserData", new_native_user_data)?,
    )?;

    let config = shared.settings.build_config;
    globals.set("g_bBuildConfigDebug", config == BuildConfig::Debug)?;
    globals.set("g_bBuildConfigDeveloper", config == BuildConfig::Developer)?;
    globals.set("g_bBuildConfigShip", config == BuildConfig::Ship)?;
    Ok(())
}

fn print(fi: &mut FunctionInterface<'_>) {
    for i in 0..fi.argument_count() {
        if fi.is_string(i) || fi.is_number(i) {
            if let Some(text) = fi.get_string(i) {
                fi.output(&text);
            }
        }
    }
}

fn random(fi: &mut FunctionInterface<'_>) {
    let shared = Arc::clone(fi.shared());
    match fi.argument_count() {
        0 => {
            let v: f64 = shared.rng.lock().gen_range(0.0..1.0);
            fi.push_return_number(v);
        }
        1 => {
            let Some(upper) = fi.get_i64(0) else {
                fi.raise_error(0, "number expected");
                return;
            };
            if upper < 1 {
                fi.raise_error(0, "interval is empty");
                return;
            }
            let v = shared.rng.lock().gen_range(1..=upper);
            fi.push_return_i64(v);
        }
        2 => {
            let (Some(lower), Some(upper)) = (fi.get_i64(0), fi.get_i64(1)) else {
                fi.raise_error(-1, "number expected");
                return;
            };
            if lower > upper {
                fi.raise_error(1, "interval is empty");
                return;
            }
            let v = shared.rng.lock().gen_range(lower..=upper);
            fi.push_return_i64(v);
        }
        _ => fi.raise_error(-1, "wrong number of arguments"),
    }
}

fn random_seed(fi: &mut FunctionInterface<'_>) {
    let rng = match fi.get_number(0) {
        Some(seed) => StdRng::seed_from_u64(seed.to_bits()),
        None => StdRng::from_entropy(),
    };
    *fi.shared().rng.lock() = rng;
}

fn create_table(fi: &mut FunctionInterface<'_>) {
    let narr = fi.get_integer(0).unwrap_or(0).max(0) as usize;
    let nrec = fi.get_integer(1).unwrap_or(0).max(0) as usize;
    match fi.lua().create_table_with_capacity(narr, nrec) {
        Ok(t) => fi.push_return_value(Value::Table(t)),
        Err(e) => fi.raise_error(-1, e.to_string()),
    }
}

fn init_progress_steps(fi: &mut FunctionInterface<'_>) {
    match fi.get_i64(0) {
        Some(n) if n >= 0 && fi.get_number(0).is_some_and(|f| f.fract() == 0.0) => {
            fi.shared().progress_total.fetch_add(n, Ordering::AcqRel);
        }
        _ => fi.raise_error(0, "expected integer >= 0."),
    }
}

fn is_native_valid(fi: &mut FunctionInterface<'_>) {
    let alive = match fi.get_value(0) {
        Some(Value::UserData(ud)) => binding::userdata_tag(ud)
            .and_then(|(name, kind)| fi.shared().bindings.lock().find(&name, kind))
            .is_some_and(|record| (record.is_alive)(ud)),
        _ => false,
    };
    fi.push_return_boolean(alive);
}

fn describe_native_enum(fi: &mut FunctionInterface<'_>) {
    let name = fi.get_string(0).unwrap_or_default();
    let Some(descriptor) = fi.shared().bindings.lock().enum_descriptor(&name) else {
        fi.push_return_nil();
        return;
    };

    let describe = |lua: &Lua| -> mlua::Result<Table> {
        let names = lua.create_table()?;
        let values = lua.create_table()?;
        for (name, value) in descriptor.values {
            names.raw_set(*value, *name)?;
            values.raw_set(*name, *value)?;
        }
        let out = lua.create_table()?;
        out.raw_set("Names", names)?;
        out.raw_set("Values", values)?;
        Ok(out)
    };
    match describe(fi.lua()) {
        Ok(t) => fi.push_return_value(Value::Table(t)),
        Err(e) => fi.raise_error(-1, e.to_string()),
    }
}

fn new_native_user_data(fi: &mut FunctionInterface<'_>) {
    let name = fi.get_string(0).unwrap_or_default();
    let record = fi.shared().bindings.lock().find(&name, BindingKind::Strong);
    let Some(factory) = record.and_then(|r| r.factory) else {
        fi.push_return_nil();
        return;
    };
    match factory(fi.lua()) {
        Ok(ud) => fi.push_return_value(Value::UserData(ud)),
        Err(e) => fi.raise_error(-1, e.to_string()),
    }
}
