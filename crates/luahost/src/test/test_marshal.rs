use std::collections::BTreeMap;

use mlua::{Lua, Value};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data_node::{DataNode, MAX_EXACT_INTEGER};
use crate::error::MarshalError;
use crate::marshal::{
    array_index_from_number, array_index_to_number, check_integer, check_integral_number,
    data_node_to_value,
    enum_to_value, table_to_data_node, value_to_data_node, value_to_enum, value_to_i64,
    MarshalOptions, ScriptEnum, INVALID_INDEX, MAX_DEPTH,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Weather {
    Sunny = 0,
    Rain = 3,
}

impl ScriptEnum for Weather {
    const NAME: &'static str = "Weather";
    const VALUES: &'static [(&'static str, i32)] = &[("Sunny", 0), ("Rain", 3)];

    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Weather::Sunny),
            3 => Some(Weather::Rain),
            _ => None,
        }
    }
}

#[test]
fn test_array_index_conversion() {
    assert_eq!(array_index_from_number(1.0), 0);
    assert_eq!(array_index_from_number(10.0), 9);
    assert_eq!(array_index_from_number(0.0), INVALID_INDEX);
    assert_eq!(array_index_from_number(-4.0), INVALID_INDEX);
    assert_eq!(array_index_from_number(f64::NAN), INVALID_INDEX);
    assert_eq!(array_index_to_number(0), 1.0);
    assert_eq!(array_index_to_number(41), 42.0);
}

#[test]
fn test_integer_range() {
    assert_eq!(check_integer(MAX_EXACT_INTEGER), Ok(MAX_EXACT_INTEGER));
    assert_eq!(check_integer(-MAX_EXACT_INTEGER), Ok(-MAX_EXACT_INTEGER));
    assert_eq!(
        check_integer(MAX_EXACT_INTEGER + 1),
        Err(MarshalError::IntegerOutOfRange(MAX_EXACT_INTEGER + 1))
    );

    let lua = Lua::new();
    assert!(matches!(
        data_node_to_value(&lua, &DataNode::Int(i64::MAX), MarshalOptions::default()),
        Err(MarshalError::IntegerOutOfRange(_))
    ));
}

#[test]
fn test_float_keys_must_be_exact_integers() {
    assert_eq!(check_integral_number(42.0), Ok(42));
    assert_eq!(
        check_integral_number(1e300),
        Err(MarshalError::NumberOutOfRange(1e300))
    );

    let lua = Lua::new();
    let table: mlua::Table = lua.load("return { [1e300] = 1 }").eval().unwrap();
    assert_eq!(
        table_to_data_node(&table),
        Err(MarshalError::NumberOutOfRange(1e300))
    );
}

fn random_scalar(rng: &mut StdRng) -> DataNode {
    match rng.gen_range(0..5) {
        0 => DataNode::Boolean(rng.r#gen()),
        1 => {
            let edge = MAX_EXACT_INTEGER - rng.gen_range(0..4);
            DataNode::Int(if rng.r#gen() { edge } else { -edge })
        }
        2 => DataNode::Int(rng.gen_range(-MAX_EXACT_INTEGER..=MAX_EXACT_INTEGER)),
        // Integral floats come back as integers, so keep a fractional part.
        3 => DataNode::Float(rng.gen_range(-1_000_000_000i64..1_000_000_000) as f64 + 0.25),
        _ => {
            let len = rng.gen_range(0..8);
            DataNode::String((0..len).map(|_| rng.sample(Alphanumeric) as char).collect())
        }
    }
}

/// Arrays are never empty and never hold nulls; both would read back as maps.
fn random_tree(rng: &mut StdRng, levels: usize) -> DataNode {
    if levels == 0 || rng.gen_bool(0.3) {
        return random_scalar(rng);
    }
    let width = rng.gen_range(1..=3);
    if rng.r#gen() {
        DataNode::Array((0..width).map(|_| random_tree(rng, levels - 1)).collect())
    } else {
        DataNode::Table(
            (0..width)
                .map(|i| (format!("k{i}"), random_tree(rng, levels - 1)))
                .collect(),
        )
    }
}

fn wrap(rng: &mut StdRng, mut node: DataNode, levels: usize) -> DataNode {
    for _ in 0..levels {
        node = if rng.r#gen() {
            DataNode::Array(vec![node, random_scalar(rng)])
        } else {
            let mut map = BTreeMap::new();
            map.insert("inner".to_string(), node);
            DataNode::Table(map)
        };
    }
    node
}

#[test]
fn test_random_nested_records_round_trip() {
    let lua = Lua::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for i in 0..200 {
        let node = if i % 4 == 0 {
            let leaf = random_scalar(&mut rng);
            wrap(&mut rng, leaf, MAX_DEPTH)
        } else {
            let tree = random_tree(&mut rng, 4);
            let levels = rng.gen_range(0..=MAX_DEPTH - 4);
            wrap(&mut rng, tree, levels)
        };
        let value = data_node_to_value(&lua, &node, MarshalOptions::default()).unwrap();
        assert_eq!(value_to_data_node(&value).unwrap(), node, "iteration {i}");
        if let Value::Table(table) = &value {
            assert_eq!(table_to_data_node(table).unwrap(), node, "iteration {i}");
        }
    }
}

#[test]
fn test_random_records_past_limits_are_rejected() {
    let lua = Lua::new();
    let mut rng = StdRng::seed_from_u64(0x11);
    for _ in 0..50 {
        let leaf = random_scalar(&mut rng);
        let deep = wrap(&mut rng, leaf, MAX_DEPTH + 1);
        assert!(matches!(
            data_node_to_value(&lua, &deep, MarshalOptions::default()),
            Err(MarshalError::TooDeep(MAX_DEPTH))
        ));

        let levels = rng.gen_range(0..MAX_DEPTH);
        let wide = wrap(&mut rng, DataNode::Int(MAX_EXACT_INTEGER + 1), levels);
        assert!(matches!(
            data_node_to_value(&lua, &wide, MarshalOptions::default()),
            Err(MarshalError::IntegerOutOfRange(i)) if i == MAX_EXACT_INTEGER + 1
        ));
    }

    let nest = |levels: usize| -> Value {
        lua.load(format!("local t = 1 for _ = 1, {levels} do t = {{ t }} end return t"))
            .eval()
            .unwrap()
    };
    assert!(value_to_data_node(&nest(MAX_DEPTH)).is_ok());
    assert_eq!(
        value_to_data_node(&nest(MAX_DEPTH + 1)),
        Err(MarshalError::TooDeep(MAX_DEPTH))
    );

    let wide: Value = lua
        .load("return { { { x = math.tointeger(2^53) + 1 } } }")
        .eval()
        .unwrap();
    assert_eq!(
        value_to_data_node(&wide),
        Err(MarshalError::IntegerOutOfRange(MAX_EXACT_INTEGER + 1))
    );
}

#[test]
fn test_record_to_table() {
    let lua = Lua::new();
    let mut node = DataNode::table();
    node.insert("name", "crate");
    node.insert("count", 3);
    node.insert("ratio", 0.5);
    node.insert(
        "tags",
        DataNode::Array(vec![DataNode::from("a"), DataNode::from("b")]),
    );

    let value = data_node_to_value(&lua, &node, MarshalOptions::default()).unwrap();
    lua.globals().set("record", value).unwrap();
    lua.load(
        r#"
        assert(record.name == "crate")
        assert(record.count == 3)
        assert(record.ratio == 0.5)
        assert(#record.tags == 2 and record.tags[1] == "a" and record.tags[2] == "b")
        "#,
    )
    .exec()
    .unwrap();
}

#[test]
fn test_table_to_record() {
    let lua = Lua::new();
    let table: mlua::Table = lua
        .load(r#"return { title = "x", nested = { 1, 2, 3 }, [7] = true, flag = false }"#)
        .eval()
        .unwrap();
    let node = table_to_data_node(&table).unwrap();

    let mut expected = BTreeMap::new();
    expected.insert("title".to_string(), DataNode::from("x"));
    expected.insert(
        "nested".to_string(),
        DataNode::Array(vec![DataNode::Int(1), DataNode::Int(2), DataNode::Int(3)]),
    );
    expected.insert("7".to_string(), DataNode::Boolean(true));
    expected.insert("flag".to_string(), DataNode::Boolean(false));
    assert_eq!(node, DataNode::Table(expected));
}

#[test]
fn test_empty_array_becomes_empty_table() {
    let lua = Lua::new();
    let value = data_node_to_value(&lua, &DataNode::array(), MarshalOptions::default()).unwrap();
    assert_eq!(value_to_data_node(&value).unwrap(), DataNode::table());
}

#[test]
fn test_nil_to_empty_table_option() {
    let lua = Lua::new();
    let plain = data_node_to_value(&lua, &DataNode::Null, MarshalOptions::default()).unwrap();
    assert!(plain.is_nil());

    let options = MarshalOptions {
        convert_nil_to_empty_table: true,
    };
    let converted = data_node_to_value(&lua, &DataNode::Null, options).unwrap();
    assert!(matches!(converted, Value::Table(_)));
}

#[test]
fn test_unsupported_values() {
    let lua = Lua::new();
    let f = lua.create_function(|_, ()| Ok(())).unwrap();
    assert_eq!(
        value_to_data_node(&Value::Function(f)),
        Err(MarshalError::Unsupported("function"))
    );

    let table: mlua::Table = lua.load("return { [true] = 1 }").eval().unwrap();
    assert_eq!(
        table_to_data_node(&table),
        Err(MarshalError::BadKey("boolean"))
    );
}

#[test]
fn test_cyclic_table_is_bounded() {
    let lua = Lua::new();
    let table: mlua::Table = lua.load("local t = {} t.self = t return t").eval().unwrap();
    assert!(matches!(
        table_to_data_node(&table),
        Err(MarshalError::TooDeep(_))
    ));
}

#[test]
fn test_enum_by_value_and_name() {
    let lua = Lua::new();
    assert!(matches!(
        enum_to_value(&lua, Weather::Rain, false).unwrap(),
        Value::Integer(3)
    ));
    let named = enum_to_value(&lua, Weather::Rain, true).unwrap();
    assert_eq!(value_to_enum::<Weather>(&named), Some(Weather::Rain));
    assert_eq!(value_to_enum::<Weather>(&Value::Integer(0)), Some(Weather::Sunny));
    assert_eq!(value_to_enum::<Weather>(&Value::Integer(1)), None);
    assert_eq!(Weather::from_name("Sunny"), Some(Weather::Sunny));
}

#[test]
fn test_number_coercion() {
    assert_eq!(value_to_i64(&Value::Number(3.9)), Some(3));
    assert_eq!(value_to_i64(&Value::Number(f64::INFINITY)), None);
    assert_eq!(value_to_i64(&Value::Boolean(true)), None);
}

#[test]
fn test_data_node_json() {
    let node = DataNode::from_json(r#"{"a":[1,2.5,"x"],"b":null}"#).unwrap();
    assert_eq!(node.get("a").and_then(|a| a.at(1)).and_then(DataNode::as_f64), Some(2.5));
    assert!(node.get("b").is_some_and(DataNode::is_null));
}
