// DataNode <-> table conversion

use std::collections::BTreeMap;

use mlua::{Lua, Table, Value};

use crate::data_node::{DataNode, MAX_EXACT_INTEGER};
use crate::error::MarshalError;

/// Nesting bound for both directions. Cyclic tables hit it instead of recursing forever.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarshalOptions {
    /// Push a top-level `Null` as an empty table rather than nil.
    pub convert_nil_to_empty_table: bool,
}

pub fn check_integer(i: i64) -> Result<i64, MarshalError> {
    if (-MAX_EXACT_INTEGER..=MAX_EXACT_INTEGER).contains(&i) {
        Ok(i)
    } else {
        Err(MarshalError::IntegerOutOfRange(i))
    }
}

/// An integral float as an exact integer.
pub fn check_integral_number(f: f64) -> Result<i64, MarshalError> {
    if f.fract() == 0.0 && f.abs() <= MAX_EXACT_INTEGER as f64 {
        Ok(f as i64)
    } else {
        Err(MarshalError::NumberOutOfRange(f))
    }
}

pub fn data_node_to_value(
    lua: &Lua,
    node: &DataNode,
    options: MarshalOptions,
) -> Result<Value, MarshalError> {
    if node.is_null() && options.convert_nil_to_empty_table {
        return Ok(Value::Table(lua.create_table()?));
    }
    node_to_value(lua, node, 0)
}

fn node_to_value(lua: &Lua, node: &DataNode, depth: usize) -> Result<Value, MarshalError> {
    if depth > MAX_DEPTH {
        return Err(MarshalError::TooDeep(MAX_DEPTH));
    }
    let value = match node {
        DataNode::Null => Value::Nil,
        DataNode::Boolean(b) => Value::Boolean(*b),
        DataNode::Int(i) => Value::Integer(check_integer(*i)?),
        DataNode::Float(f) => Value::Number(*f),
        DataNode::String(s) => Value::String(lua.create_string(s)?),
        DataNode::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, node_to_value(lua, item, depth + 1)?)?;
            }
            Value::Table(table)
        }
        DataNode::Table(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), node_to_value(lua, item, depth + 1)?)?;
            }
            Value::Table(table)
        }
    };
    Ok(value)
}

pub fn value_to_data_node(value: &Value) -> Result<DataNode, MarshalError> {
    value_to_node(value, 0)
}

pub fn table_to_data_node(table: &Table) -> Result<DataNode, MarshalError> {
    table_to_node(table, 1)
}

fn value_to_node(value: &Value, depth: usize) -> Result<DataNode, MarshalError> {
    match value {
        Value::Nil => Ok(DataNode::Null),
        Value::Boolean(b) => Ok(DataNode::Boolean(*b)),
        Value::Integer(i) => Ok(DataNode::Int(check_integer(*i)?)),
        Value::Number(f) => Ok(DataNode::Float(*f)),
        Value::String(s) => Ok(DataNode::String(String::from(&*s.to_str()?))),
        Value::Table(t) => table_to_node(t, depth + 1),
        other => Err(MarshalError::Unsupported(other.type_name())),
    }
}

fn table_to_node(table: &Table, depth: usize) -> Result<DataNode, MarshalError> {
    if depth > MAX_DEPTH {
        return Err(MarshalError::TooDeep(MAX_DEPTH));
    }

    // A non-nil first element makes the table an array; everything else is a map.
    let first: Value = table.raw_get(1)?;
    if !first.is_nil() {
        let len = table.raw_len();
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            let item: Value = table.raw_get(i)?;
            items.push(value_to_node(&item, depth)?);
        }
        return Ok(DataNode::Array(items));
    }

    let mut map = BTreeMap::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, item) = pair?;
        let key = match &key {
            Value::String(s) => String::from(&*s.to_str()?),
            Value::Integer(i) => itoa::Buffer::new().format(*i).to_string(),
            Value::Number(f) if f.fract() == 0.0 && f.is_finite() => {
                itoa::Buffer::new().format(check_integral_number(*f)?).to_string()
            }
            other => return Err(MarshalError::BadKey(other.type_name())),
        };
        map.insert(key, value_to_node(&item, depth)?);
    }
    Ok(DataNode::Table(map))
}
