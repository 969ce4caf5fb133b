//! Native <-> VM value conversion.
//!
//! Primitives map one to one. Structured records go through [`DataNode`],
//! enums through [`ScriptEnum`], and byte buffers become VM strings (copied).
//! Native objects are covered by the binding module.

mod index;
mod record;

use mlua::{Lua, Value};

use crate::error::MarshalError;

pub use index::{array_index_from_number, array_index_to_number, INVALID_INDEX};
pub use record::{
    check_integer, check_integral_number, data_node_to_value, table_to_data_node, value_to_data_node, MarshalOptions,
    MAX_DEPTH,
};

/// A native enum visible to scripts as integers, or by name on request.
pub trait ScriptEnum: Sized + Copy + 'static {
    const NAME: &'static str;
    /// `(name, value)` pairs in declaration order.
    const VALUES: &'static [(&'static str, i32)];

    fn to_i32(self) -> i32;
    fn from_i32(value: i32) -> Option<Self>;

    fn name(self) -> Option<&'static str> {
        let v = self.to_i32();
        Self::VALUES.iter().find(|(_, x)| *x == v).map(|(n, _)| *n)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::VALUES
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| Self::from_i32(*v))
    }
}

/// Type-erased enum description, registered per VM for `DescribeNativeEnum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumDescriptor {
    pub name: &'static str,
    pub values: &'static [(&'static str, i32)],
}

impl EnumDescriptor {
    pub fn of<E: ScriptEnum>() -> Self {
        Self {
            name: E::NAME,
            values: E::VALUES,
        }
    }
}

pub fn enum_to_value<E: ScriptEnum>(lua: &Lua, e: E, as_name: bool) -> Result<Value, MarshalError> {
    if as_name {
        if let Some(name) = e.name() {
            return Ok(Value::String(lua.create_string(name)?));
        }
    }
    Ok(Value::Integer(e.to_i32() as i64))
}

/// Accepts either the integer value or the name.
pub fn value_to_enum<E: ScriptEnum>(value: &Value) -> Option<E> {
    match value {
        Value::Integer(i) => i32::try_from(*i).ok().and_then(E::from_i32),
        Value::Number(f) => E::from_i32(*f as i32),
        Value::String(s) => s.to_str().ok().and_then(|s| E::from_name(&s)),
        _ => None,
    }
}

pub fn bytes_to_value(lua: &Lua, bytes: &[u8]) -> Result<Value, MarshalError> {
    Ok(Value::String(lua.create_string(bytes)?))
}

pub fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Accepts integers and floats, nothing else.
pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(f) => Some(*f),
        _ => None,
    }
}

pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Number(f) if f.is_finite() => Some(f.trunc() as i64),
        _ => None,
    }
}
