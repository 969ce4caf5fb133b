// Structured record exchanged between host code and script tables

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Largest integer a VM number represents exactly (2^53).
pub const MAX_EXACT_INTEGER: i64 = 9_007_199_254_740_992;

/// A native key/value tree that marshals to and from nested VM tables.
///
/// Arrays map to 1-based sequence tables, tables map to string-keyed tables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataNode {
    #[default]
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<DataNode>),
    Table(BTreeMap<String, DataNode>),
}

impl DataNode {
    pub fn table() -> Self {
        DataNode::Table(BTreeMap::new())
    }

    pub fn array() -> Self {
        DataNode::Array(Vec::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DataNode::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataNode::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataNode::Int(i) => Some(*i),
            DataNode::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataNode::Int(i) => Some(*i as f64),
            DataNode::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataNode::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&DataNode> {
        match self {
            DataNode::Table(t) => t.get(key),
            _ => None,
        }
    }

    pub fn at(&self, index: usize) -> Option<&DataNode> {
        match self {
            DataNode::Array(a) => a.get(index),
            _ => None,
        }
    }

    /// Inserts into a table node. No-op on other node kinds.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DataNode>) {
        if let DataNode::Table(t) = self {
            t.insert(key.into(), value.into());
        }
    }

    /// Appends to an array node. No-op on other node kinds.
    pub fn push(&mut self, value: impl Into<DataNode>) {
        if let DataNode::Array(a) = self {
            a.push(value.into());
        }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<bool> for DataNode {
    fn from(b: bool) -> Self {
        DataNode::Boolean(b)
    }
}

impl From<i32> for DataNode {
    fn from(i: i32) -> Self {
        DataNode::Int(i as i64)
    }
}

impl From<i64> for DataNode {
    fn from(i: i64) -> Self {
        DataNode::Int(i)
    }
}

impl From<f64> for DataNode {
    fn from(f: f64) -> Self {
        DataNode::Float(f)
    }
}

impl From<&str> for DataNode {
    fn from(s: &str) -> Self {
        DataNode::String(s.to_string())
    }
}

impl From<String> for DataNode {
    fn from(s: String) -> Self {
        DataNode::String(s)
    }
}

impl From<Vec<DataNode>> for DataNode {
    fn from(a: Vec<DataNode>) -> Self {
        DataNode::Array(a)
    }
}
