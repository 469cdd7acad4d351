//! Sequence operators
//!
//! An operator is the language-neutral description of a sequence's record
//! schema and, for derived sequences, of the function mapping source
//! records to destination records. Three kinds exist:
//!
//! - [`DataOperator`]: the primary sequence, keyed by `[id]`
//! - [`IndexOperator`]: one destination record per extracted key, value =
//!   JSON object of the payload fields
//! - [`AggregationOperator`]: destination records are accumulator arrays
//!   `[count, sum_1, sum_2, ...]` merged by inc/dec operations
//!
//! The first key field of a derived operator may be plural (array-valued
//! source field, marked with a trailing `$`), producing one destination
//! record per element. A `category` filter restricts the operator to
//! records of one category.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use torus_core::{singular_name, FieldKind, KeyCodec, Oid, Result, Value, WebObject};

/// One field of a derived key schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    /// Source field name; `id` reads the source record's id, a trailing
    /// `$` marks the (first) field as plural
    pub name: String,
    /// Encoded kind
    pub kind: FieldKind,
}

impl KeyField {
    /// Integer-kinded field
    pub fn int(name: &str) -> Self {
        KeyField {
            name: name.to_string(),
            kind: FieldKind::Int,
        }
    }

    /// String-kinded field
    pub fn str(name: &str) -> Self {
        KeyField {
            name: name.to_string(),
            kind: FieldKind::Str,
        }
    }
}

/// Operator of the primary data sequence: key `[id]`, value = record JSON
#[derive(Debug, Clone)]
pub struct DataOperator {
    codec: KeyCodec,
}

impl DataOperator {
    /// The standard data operator
    pub fn new() -> Self {
        DataOperator {
            codec: KeyCodec::id_only(),
        }
    }

    /// Key codec (a single integer id)
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }
}

impl Default for DataOperator {
    fn default() -> Self {
        DataOperator::new()
    }
}

/// Derived operator producing one index record per extracted key
#[derive(Debug, Clone)]
pub struct IndexOperator {
    /// Ordered key fields; the first may be plural
    pub key: Vec<KeyField>,
    /// Field names copied into the record value
    pub payload: Vec<String>,
    /// Restrict to records of this category
    pub category: Option<Oid>,
    codec: KeyCodec,
}

impl IndexOperator {
    /// Index over `key` fields with a `payload` projection
    pub fn new(key: Vec<KeyField>, payload: Vec<String>) -> Self {
        let codec = KeyCodec::new(key.iter().map(|f| f.kind).collect());
        IndexOperator {
            key,
            payload,
            category: None,
            codec,
        }
    }

    /// Restrict the index to one category
    pub fn for_category(mut self, category: Oid) -> Self {
        self.category = Some(category);
        self
    }
}

/// Derived operator folding records into per-key accumulators
#[derive(Debug, Clone)]
pub struct AggregationOperator {
    /// Ordered key fields; the first may be plural
    pub key: Vec<KeyField>,
    /// Fields summed into the accumulator, after the leading count
    pub sums: Vec<String>,
    /// Restrict to records of this category
    pub category: Option<Oid>,
    codec: KeyCodec,
}

impl AggregationOperator {
    /// Aggregation over `key` fields summing the `sums` fields
    pub fn new(key: Vec<KeyField>, sums: Vec<String>) -> Self {
        let codec = KeyCodec::new(key.iter().map(|f| f.kind).collect());
        AggregationOperator {
            key,
            sums,
            category: None,
            codec,
        }
    }

    /// Restrict the aggregation to one category
    pub fn for_category(mut self, category: Oid) -> Self {
        self.category = Some(category);
        self
    }
}

/// Operator attached to a sequence
#[derive(Debug, Clone)]
pub enum Operator {
    /// Primary data sequence
    Data(DataOperator),
    /// Derived index
    Index(IndexOperator),
    /// Derived aggregation
    Aggregation(AggregationOperator),
}

impl Operator {
    /// Key codec of the destination records
    pub fn codec(&self) -> &KeyCodec {
        match self {
            Operator::Data(op) => op.codec(),
            Operator::Index(op) => &op.codec,
            Operator::Aggregation(op) => &op.codec,
        }
    }

    /// Whether destination values are accumulators merged by inc/dec
    pub fn is_aggregation(&self) -> bool {
        matches!(self, Operator::Aggregation(_))
    }

    /// Map one source record onto its destination records.
    ///
    /// `src_key` is the source binary key (an encoded id); `record` is the
    /// record JSON, or `None` for an absent side of a change. Data
    /// operators are identity maps and never derive.
    pub fn map(
        &self,
        src_key: &[u8],
        record: Option<&str>,
    ) -> Result<BTreeMap<Vec<u8>, String>> {
        let mut out = BTreeMap::new();
        let Some(record) = record else {
            return Ok(out);
        };
        match self {
            Operator::Data(_) => {
                out.insert(src_key.to_vec(), record.to_string());
                Ok(out)
            }
            Operator::Index(op) => {
                let id = torus_core::decode_id(src_key)?;
                let object = WebObject::from_record_str(id, record)?;
                if !category_matches(op.category, &object) {
                    return Ok(out);
                }
                let payload = render_payload(&op.payload, &object);
                for key_values in extract_keys(&op.key, &object) {
                    let dest = op.codec.encode(&key_values)?;
                    out.insert(dest, payload.clone());
                }
                Ok(out)
            }
            Operator::Aggregation(op) => {
                let id = torus_core::decode_id(src_key)?;
                let object = WebObject::from_record_str(id, record)?;
                if !category_matches(op.category, &object) {
                    return Ok(out);
                }
                let accumulator = render_accumulator(&op.sums, &object);
                for key_values in extract_keys(&op.key, &object) {
                    let dest = op.codec.encode(&key_values)?;
                    out.insert(dest, accumulator.clone());
                }
                Ok(out)
            }
        }
    }
}

fn category_matches(filter: Option<Oid>, object: &WebObject) -> bool {
    match filter {
        Some(cat) => object.category == Some(cat),
        None => true,
    }
}

/// Extract the ordered key vectors of one source object.
///
/// Yields nothing when a key field is absent (the record simply does not
/// appear in the destination). Only the first field expands plurally.
fn extract_keys(fields: &[KeyField], object: &WebObject) -> Vec<Vec<Value>> {
    if fields.is_empty() {
        return Vec::new();
    }
    let mut tail = Vec::with_capacity(fields.len() - 1);
    for field in &fields[1..] {
        match field_value(field, object) {
            Some(v) => tail.push(v),
            None => return Vec::new(),
        }
    }
    let Some(first) = fields.first() else {
        return Vec::new();
    };
    let (base, plural) = singular_name(&first.name);
    let heads: Vec<Value> = if base == "id" {
        vec![Value::Int(object.id as i64)]
    } else {
        match object.get(base) {
            Some(value) if plural => value.as_list().into_iter().cloned().collect(),
            Some(Value::Array(items)) => items.clone(),
            Some(value) => vec![value.clone()],
            None => Vec::new(),
        }
    };
    heads
        .into_iter()
        .map(|head| {
            let mut key = Vec::with_capacity(fields.len());
            key.push(head);
            key.extend(tail.iter().cloned());
            key
        })
        .collect()
}

fn field_value(field: &KeyField, object: &WebObject) -> Option<Value> {
    let (base, _) = singular_name(&field.name);
    if base == "id" {
        return Some(Value::Int(object.id as i64));
    }
    object.get(base).cloned()
}

fn render_payload(payload: &[String], object: &WebObject) -> String {
    if payload.is_empty() {
        return String::new();
    }
    let mut obj = serde_json::Map::new();
    for field in payload {
        if let Some(value) = object.get(field) {
            obj.insert(field.clone(), value.to_json());
        }
    }
    serde_json::Value::Object(obj).to_string()
}

fn render_accumulator(sums: &[String], object: &WebObject) -> String {
    let mut acc = Vec::with_capacity(sums.len() + 1);
    acc.push(1.0);
    for field in sums {
        acc.push(object.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0));
    }
    accumulator_to_json(&acc)
}

/// Render an accumulator, keeping whole numbers as JSON integers
pub fn accumulator_to_json(acc: &[f64]) -> String {
    let items: Vec<serde_json::Value> = acc
        .iter()
        .map(|&x| {
            if x.fract() == 0.0 && x.abs() < 9e15 {
                serde_json::json!(x as i64)
            } else {
                serde_json::json!(x)
            }
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

/// Parse an accumulator value
pub fn accumulator_from_json(value: &str) -> Result<Vec<f64>> {
    let parsed: Vec<serde_json::Value> = serde_json::from_str(value)?;
    Ok(parsed.iter().map(|v| v.as_f64().unwrap_or(0.0)).collect())
}
