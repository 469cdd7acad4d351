//! Unified value type for object data
//!
//! `Value` is the tagged variant every object property is made of. Object
//! references are first-class: `Ref` points at a persisted object by id,
//! `NewRef` is a *provisional* reference valid only inside a single insert
//! batch (it names a batch entry by index and is rectified to a `Ref`
//! before anything is persisted).
//!
//! # JSON mapping
//!
//! Values map onto plain JSON except for references, which serialize as
//! single-key objects:
//!
//! ```text
//! Ref(17)    <->  {"__ref": 17}
//! NewRef(2)  <->  {"__neg_provid": 2}
//! ```
//!
//! A JSON object whose only key is one of the marker keys is always decoded
//! as the corresponding reference; the marker keys are reserved.

use crate::types::Oid;
use serde_json::json;
use std::collections::BTreeMap;

/// JSON marker key for persisted references
pub const REF_KEY: &str = "__ref";
/// JSON marker key for provisional (within-batch) references
pub const PROVISIONAL_KEY: &str = "__neg_provid";

/// Unified value type for all object properties
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Reference to a persisted object
    Ref(Oid),
    /// Provisional reference to an entry of the current insert batch,
    /// by batch index; never persisted
    NewRef(usize),
    /// Array of values
    Array(Vec<Value>),
    /// Map of string keys to values
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Convert to the JSON representation
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Str(s) => json!(s),
            Value::Ref(id) => json!({ REF_KEY: id }),
            Value::NewRef(k) => json!({ PROVISIONAL_KEY: k }),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Decode from the JSON representation
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(id) = obj.get(REF_KEY).and_then(|v| v.as_u64()) {
                        return Value::Ref(id);
                    }
                    if let Some(k) = obj.get(PROVISIONAL_KEY).and_then(|v| v.as_u64()) {
                        return Value::NewRef(k as usize);
                    }
                }
                Value::Map(
                    obj.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Integer view, accepting `Int` only
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view, widening `Int` to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// String view
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Reference id, for persisted references only
    pub fn as_ref_id(&self) -> Option<Oid> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// View a value as a list: `Null` is empty, an `Array` yields its
    /// elements, anything else is a single-element list.
    ///
    /// Operators use this to extract plural (multi-valued) fields.
    pub fn as_list(&self) -> Vec<&Value> {
        match self {
            Value::Null => Vec::new(),
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    /// Replace every `NewRef(k)` in this value tree with `Ref(ids[k])`.
    ///
    /// A `NewRef` index with no matching batch entry is left untouched and
    /// reported via the returned flag so callers can fail the batch.
    pub fn rectify(&mut self, ids: &[Oid]) -> bool {
        let mut complete = true;
        match self {
            Value::NewRef(k) => {
                if let Some(&id) = ids.get(*k) {
                    *self = Value::Ref(id);
                } else {
                    complete = false;
                }
            }
            Value::Array(items) => {
                for item in items {
                    complete &= item.rectify(ids);
                }
            }
            Value::Map(map) => {
                for item in map.values_mut() {
                    complete &= item.rectify(ids);
                }
            }
            _ => {}
        }
        complete
    }

    /// Walk the value tree and report every persisted reference as a
    /// `(dotted path, id)` pair, rooted at `prefix`.
    pub fn collect_refs(&self, prefix: &str, out: &mut Vec<(String, Oid)>) {
        match self {
            Value::Ref(id) => out.push((prefix.to_string(), *id)),
            Value::Array(items) => {
                for item in items {
                    // Array elements keep the field path of their container
                    item.collect_refs(prefix, out);
                }
            }
            Value::Map(map) => {
                for (k, v) in map {
                    let path = if prefix.is_empty() {
                        k.clone()
                    } else {
                        format!("{}.{}", prefix, k)
                    };
                    v.collect_refs(&path, out);
                }
            }
            _ => {}
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
